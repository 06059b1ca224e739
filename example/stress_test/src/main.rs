use std::{
    collections::HashMap,
    io::Read,
    sync::{Arc, Mutex},
};

use ::qstore::*;
use bytes::Bytes;
use log::info;
use rand::{Rng, RngCore};
use threadpool::ThreadPool;

fn rand_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id = [0u8; 16];
    rng.fill_bytes(&mut id);
    id.iter().map(|b| format!("{:02x}", b)).collect()
}

fn rand_value() -> Bytes {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..256 * 1024);
    let mut vec = Vec::new();
    vec.resize(len, 0);

    rng.fill_bytes(&mut vec[..]);
    vec.into()
}

fn is_removed() -> bool {
    let mut rng = rand::thread_rng();
    rng.gen_bool(0.07)
}

fn load_range(be: &Backend, h: &Handle, length: u64, offset: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    be.load(&Context::new(), h, length, offset, &mut |rd| {
        rd.read_to_end(&mut buf)
            .map_err(|e| DeviceError::from_io(h.name.as_str(), e))?;
        Ok(())
    })
    .unwrap();
    buf
}

fn main() {
    env_logger::init();
    let cfg = Config {
        prefix: "stress".into(),
        host_name: "mem://stress".into(),
        user_name: "stress".into(),
        password: "stress".into(),
        storage_group: "SG1".into(),
        container: "C1".into(),
        device_type: Some(DeviceType::Streaming.tag().into()),
        ..Config::default()
    };

    let be = Arc::new(Backend::create(&cfg).unwrap());
    let pool = ThreadPool::new(be.device().max_streams());
    let exist = Arc::new(Mutex::new(HashMap::<String, Bytes>::new()));

    let total_test: usize = 2_000;

    for i in 0..total_test {
        let be = be.clone();
        let exist = exist.clone();
        pool.execute(move || {
            let ctx = Context::new();
            let h = Handle::new(FileType::Data, rand_id());
            let value = rand_value();
            be.save(&ctx, &h, &mut &value[..]).unwrap();

            let fi = be.stat(&ctx, &h).unwrap();
            assert_eq!(fi.size, value.len() as u64, "size mismatch for {}", h);

            if !value.is_empty() {
                let mut rng = rand::thread_rng();
                let offset = rng.gen_range(0..value.len());
                let length = rng.gen_range(1..=value.len() - offset);
                let got = load_range(&be, &h, length as u64, offset as u64);
                assert_eq!(&got[..], &value[offset..offset + length], "corruption in {}", h);
            }

            if is_removed() {
                be.remove(&h).unwrap();
                assert!(!be.test(&h).unwrap());
            } else {
                exist.lock().unwrap().insert(h.name.clone(), value);
            }

            if i % (total_test / 100) == 0 {
                info!("finish {}%", i / (total_test / 100))
            }
        });
    }
    pool.join();
    assert_eq!(pool.panic_count(), 0, "worker panicked");
    assert_eq!(be.device().open_files(), 0, "admission slots leaked");

    let exist = exist.lock().unwrap();
    let mut listed = 0;
    be.list(&Context::new(), FileType::Data, &mut |fi| {
        let value = exist.get(&fi.name).expect("listed object was never saved");
        assert_eq!(fi.size, value.len() as u64, "size mismatch for {}", fi.name);
        listed += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(listed, exist.len(), "object count != expected object count");

    for (name, value) in exist.iter() {
        let got = load_range(&be, &Handle::new(FileType::Data, name.as_str()), 0, 0);
        assert_eq!(&got[..], &value[..], "corruption in {}", name);
    }
    info!("{} objects verified at {}", listed, be.location());
}
