use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use clap::Parser;
use log::error;
use pretty_hex::pretty_hex;
use qstore::{
    config,
    device::{Device, FsDevice},
    err::Result,
    Backend, Config, Context, DeviceError, DeviceType, FileType, Handle, ObjectStore,
};
mod opt;

fn main() {
    env_logger::init();
    let cli = opt::Cli::parse();
    if let Err(e) = run(&cli.config, cli.command) {
        error!("{}", e);
        eprintln!("qsutil: {}", e);
        std::process::exit(1);
    }
}

fn run(path: &str, command: opt::Commands) -> Result<()> {
    let cfg = config::load_config_from(path)?;
    match command {
        opt::Commands::Init => init(&cfg),
        opt::Commands::Ls { file_type } => ls(&cfg, &file_type),
        opt::Commands::Stat { file_type, id } => stat(&cfg, handle(&file_type, id)?),
        opt::Commands::Put {
            file_type,
            id,
            file,
        } => put(&cfg, handle(&file_type, id)?, &file),
        opt::Commands::Get(opts) => get(&cfg, handle(&opts.file_type, opts.id)?, opts.out, opts.hex),
        opt::Commands::Rm { file_type, id } => Backend::open(&cfg)?.remove(&handle(&file_type, id)?),
        opt::Commands::Push { local, device_path } => push(&cfg, &local, &device_path),
        opt::Commands::Pull { device_path, local } => pull(&cfg, &device_path, &local),
        opt::Commands::Groups => groups(&cfg),
    }
}

fn handle(file_type: &str, id: String) -> Result<Handle> {
    let h = Handle::new(file_type.parse()?, id);
    h.valid()?;
    Ok(h)
}

fn init(cfg: &Config) -> Result<()> {
    let be = Backend::create(cfg)?;
    println!("created {}", be.location());
    Ok(())
}

fn ls(cfg: &Config, file_type: &str) -> Result<()> {
    let t: FileType = file_type.parse()?;
    let be = Backend::open(cfg)?;
    be.list(&Context::new(), t, &mut |fi| {
        println!("{}\t{}", fi.size, fi.name);
        Ok(())
    })
}

fn stat(cfg: &Config, h: Handle) -> Result<()> {
    let be = Backend::open(cfg)?;
    let fi = be.stat(&Context::new(), &h)?;
    println!("{} size {}", h, fi.size);
    Ok(())
}

fn put(cfg: &Config, h: Handle, file: &str) -> Result<()> {
    let mut f = File::open(file).map_err(|e| DeviceError::from_io(file, e))?;
    let be = Backend::open(cfg)?;
    be.save(&Context::new(), &h, &mut f)?;
    println!("saved {}", h);
    Ok(())
}

fn get(cfg: &Config, h: Handle, out: Option<String>, hex: bool) -> Result<()> {
    let be = Backend::open(cfg)?;
    let mut buf = Vec::new();
    be.load(&Context::new(), &h, 0, 0, &mut |rd| {
        rd.read_to_end(&mut buf)
            .map_err(|e| DeviceError::from_io(h.name.as_str(), e))?;
        Ok(())
    })?;

    match out {
        Some(out) => File::create(&out)
            .and_then(|mut f| f.write_all(&buf))
            .map_err(|e| DeviceError::from_io(out, e)),
        None if hex => {
            println!("{}", pretty_hex(&buf));
            Ok(())
        }
        None => io::stdout()
            .write_all(&buf)
            .map_err(|e| DeviceError::from_io("stdout", e)),
    }
}

fn push(cfg: &Config, local: &str, device_path: &str) -> Result<()> {
    let be = Backend::open(cfg)?;
    let n = be.device().copy_file_to_device(Path::new(local), device_path)?;
    println!("{} bytes copied to {}", n, device_path);
    Ok(())
}

fn pull(cfg: &Config, device_path: &str, local: &str) -> Result<()> {
    let be = Backend::open(cfg)?;
    let n = be.device().copy_file_from_device(device_path, Path::new(local))?;
    println!("{} bytes copied to {}", n, local);
    Ok(())
}

fn groups(cfg: &Config) -> Result<()> {
    let attributes = cfg.device_attributes()?;
    if attributes.device_type != DeviceType::Filesystem {
        return Err(DeviceError::InvalidDeviceType(format!(
            "storage groups are listed on {} only",
            DeviceType::Filesystem.tag()
        )));
    }
    let mut dev = FsDevice::new(
        &attributes.url,
        &attributes.storage_group,
        &attributes.container,
    );
    dev.connect(&attributes.username, &attributes.password)?;
    for group in dev.list_storage_groups() {
        let marker = if group == attributes.storage_group { "*" } else { " " };
        println!("{} {}", marker, group);
    }
    Ok(())
}
