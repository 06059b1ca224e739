use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::debug;
use positioned_io::{ReadAt, WriteAt};

use super::*;
use crate::{
    err::{DeviceError, IoResultExt, Result},
    session::{SessionKey, SessionRegistry},
    util::{path, HandleSemaphore},
};

/// Local file behind a filesystem device handle.
pub struct FsFile {
    name: String,
    f: File,
    writable: bool,
}

impl Read for FsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.f.read(buf)
    }
}

/// Streamed writes always land at the current end of the file. The file is
/// not opened in append mode so that positioned writes keep their offset.
impl Write for FsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.f.seek(SeekFrom::End(0))?;
        self.f.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.f)
    }
}

impl ReadAt for FsFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        ReadAt::read_at(&self.f, pos, buf)
    }
}

impl WriteAt for FsFile {
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        WriteAt::write_at(&mut self.f, pos, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.f)
    }
}

impl DeviceFile for FsFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Result<u64> {
        Ok(self.f.metadata().at(&self.name)?.len())
    }

    fn close(&mut self) -> Result<()> {
        if self.writable {
            self.f.sync_data().at(&self.name)?;
        }
        Ok(())
    }
}

/// Storage groups and their containers, as seen on disk at connect time and
/// kept in step with every change made through this device.
type Namespace = BTreeMap<String, BTreeSet<String>>;

/// Device over a local directory tree laid out as
/// `root/storageGroup/container/objectPath`.
#[derive(Debug)]
pub struct FsDevice {
    root: PathBuf,
    storage_group: String,
    container: String,
    namespace: Mutex<Namespace>,
    registry: Arc<SessionRegistry>,
    session: Option<Arc<HandleSemaphore>>,
}

impl FsDevice {
    pub fn new(root: impl Into<PathBuf>, storage_group: &str, container: &str) -> Self {
        Self::with_registry(root, storage_group, container, SessionRegistry::global())
    }

    pub fn with_registry(
        root: impl Into<PathBuf>,
        storage_group: &str,
        container: &str,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            root: root.into(),
            storage_group: path::clean(storage_group),
            container: path::clean(container),
            namespace: Mutex::new(Namespace::new()),
            registry,
            session: None,
        }
    }

    fn session_key(&self) -> SessionKey {
        SessionKey::Root(self.root.clone())
    }

    fn container_path(&self) -> PathBuf {
        self.root.join(&self.storage_group).join(&self.container)
    }

    fn object_path(&self, p: &str) -> PathBuf {
        let mut full = self.container_path();
        for seg in path::clean(p).split('/').filter(|s| !s.is_empty()) {
            full.push(seg);
        }
        full
    }

    fn scan_namespace(root: &Path) -> Result<Namespace> {
        let mut ns = Namespace::new();
        for group in subdirs(root)? {
            let containers = subdirs(&root.join(&group))?;
            ns.insert(group, containers.into_iter().collect());
        }
        Ok(ns)
    }

    fn open_with(&self, p: &str, opts: &OpenOptions, writable: bool) -> Result<DeviceHandle> {
        let full = self.object_path(p);
        let name = full.display().to_string();
        let f = opts.open(&full).map_err(|e| {
            debug!("open {} failed: {}", name, e);
            DeviceError::from_io(name.as_str(), e)
        })?;
        Ok(DeviceHandle::new(FsFile { name, f, writable }))
    }

    pub fn add_storage_group(&self, name: &str) -> Result<()> {
        let mut ns = self.namespace.lock().unwrap();
        if ns.contains_key(name) {
            return Err(DeviceError::StorageGroupExists(name.to_owned()));
        }
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).at(&dir.display().to_string())?;
        ns.insert(name.to_owned(), BTreeSet::new());
        Ok(())
    }

    pub fn remove_storage_group(&self, name: &str) -> Result<()> {
        let mut ns = self.namespace.lock().unwrap();
        if !ns.contains_key(name) {
            return Err(DeviceError::StorageGroupNotFound(name.to_owned()));
        }
        let dir = self.root.join(name);
        fs::remove_dir_all(&dir).at(&dir.display().to_string())?;
        ns.remove(name);
        Ok(())
    }

    pub fn list_storage_groups(&self) -> Vec<String> {
        self.namespace.lock().unwrap().keys().cloned().collect()
    }

    fn active_group(&self) -> Result<&str> {
        if self.storage_group.is_empty() {
            return Err(DeviceError::NoActiveStorageGroup);
        }
        Ok(&self.storage_group)
    }

    pub fn add_container(&self, name: &str) -> Result<()> {
        let group = self.active_group()?;
        let mut ns = self.namespace.lock().unwrap();
        let containers = ns
            .get_mut(group)
            .ok_or_else(|| DeviceError::StorageGroupNotFound(group.to_owned()))?;
        if containers.contains(name) {
            return Err(DeviceError::ContainerExists(name.to_owned()));
        }
        let dir = self.root.join(group).join(name);
        fs::create_dir_all(&dir).at(&dir.display().to_string())?;
        containers.insert(name.to_owned());
        Ok(())
    }

    pub fn remove_container(&self, name: &str) -> Result<()> {
        let group = self.active_group()?;
        let mut ns = self.namespace.lock().unwrap();
        let containers = ns
            .get_mut(group)
            .ok_or_else(|| DeviceError::StorageGroupNotFound(group.to_owned()))?;
        if !containers.contains(name) {
            return Err(DeviceError::ContainerNotFound(name.to_owned()));
        }
        let dir = self.root.join(group).join(name);
        fs::remove_dir_all(&dir).at(&dir.display().to_string())?;
        containers.remove(name);
        Ok(())
    }

    pub fn container_exists(&self, name: &str) -> Result<bool> {
        let group = self.active_group()?;
        let ns = self.namespace.lock().unwrap();
        Ok(ns.get(group).map_or(false, |c| c.contains(name)))
    }

    pub fn list_containers(&self) -> Result<Vec<String>> {
        let group = self.active_group()?;
        let ns = self.namespace.lock().unwrap();
        ns.get(group)
            .map(|c| c.iter().cloned().collect())
            .ok_or_else(|| DeviceError::StorageGroupNotFound(group.to_owned()))
    }
}

fn subdirs(dir: &Path) -> Result<Vec<String>> {
    let name = dir.display().to_string();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).at(&name)? {
        let entry = entry.at(&name)?;
        if entry.file_type().at(&name)?.is_dir() {
            dirs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(dirs)
}

impl Device for FsDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Filesystem
    }

    fn connect(&mut self, _user: &str, _password: &str) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let root = self.root.clone();
        let sem = self.registry.connect(self.session_key(), MAX_OPEN_FILES, || {
            if root.is_dir() {
                Ok(())
            } else {
                Err(DeviceError::Connect(format!(
                    "url/path {} does not exist",
                    root.display()
                )))
            }
        })?;
        match Self::scan_namespace(&self.root) {
            Ok(ns) => *self.namespace.lock().unwrap() = ns,
            Err(e) => {
                self.registry.release(&self.session_key(), || {});
                return Err(DeviceError::Connect(e.to_string()));
            }
        }
        self.session = Some(sem);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.session.take().is_some() {
            self.registry.release(&self.session_key(), || {});
            self.namespace.lock().unwrap().clear();
        }
    }

    fn admission(&self) -> Result<Arc<HandleSemaphore>> {
        self.session.clone().ok_or(DeviceError::NotConnected)
    }

    fn create_namespace(&self) -> Result<()> {
        let group = self.active_group()?.to_owned();
        match self.add_storage_group(&group) {
            Ok(()) | Err(DeviceError::StorageGroupExists(_)) => {}
            Err(e) => return Err(e),
        }
        match self.add_container(&self.container) {
            Ok(()) | Err(DeviceError::ContainerExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn add_directory(&self, p: &str) -> Result<()> {
        let dir = self.object_path(p);
        fs::create_dir_all(&dir).at(&dir.display().to_string())
    }

    fn remove_dir(&self, p: &str) -> Result<()> {
        let dir = self.object_path(p);
        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            r => r.at(&dir.display().to_string()),
        }
    }

    fn delete_file(&self, p: &str) -> Result<()> {
        let file = self.object_path(p);
        fs::remove_file(&file).at(&file.display().to_string())
    }

    fn object_exist(&self, p: &str) -> Result<bool> {
        let full = self.object_path(p);
        match fs::metadata(&full) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DeviceError::from_io(full.display().to_string(), e)),
        }
    }

    fn dir_walk(&self, p: &str) -> Result<Vec<DeviceFileInfo>> {
        let dir = self.object_path(p);
        let name = dir.display().to_string();
        let mut values = Vec::new();
        for entry in fs::read_dir(&dir).at(&name)? {
            let entry = entry.at(&name)?;
            values.push(DeviceFileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type().at(&name)?.is_dir(),
            });
        }
        Ok(values)
    }

    fn open_read(&self, p: &str) -> Result<DeviceHandle> {
        self.open_with(p, OpenOptions::new().read(true), false)
    }

    fn open_write(&self, p: &str) -> Result<DeviceHandle> {
        self.open_with(
            p,
            OpenOptions::new().read(true).write(true).create(true),
            true,
        )
    }
}

impl Drop for FsDevice {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    fn connected(root: &TempDir, registry: &Arc<SessionRegistry>) -> FsDevice {
        fs::create_dir_all(root.path().join("SG1").join("C1")).unwrap();
        let mut dev = FsDevice::with_registry(root.path(), "SG1", "C1", registry.clone());
        dev.connect("", "").unwrap();
        dev
    }

    #[test]
    pub fn connect_missing_root() {
        let registry = Arc::new(SessionRegistry::new());
        let mut dev = FsDevice::with_registry("/no/such/qstore/root", "SG1", "C1", registry.clone());
        assert_eq!(
            dev.connect("", "").unwrap_err(),
            DeviceError::Connect(String::new())
        );
        assert!(registry.is_empty());
        assert_eq!(dev.admission().unwrap_err(), DeviceError::NotConnected);
    }

    #[test]
    pub fn sessions_shared_per_root() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let mut a = connected(&root, &registry);
        let mut b = connected(&root, &registry);
        let key = SessionKey::Root(root.path().to_owned());
        assert_eq!(registry.ref_count(&key), 2);
        assert!(Arc::ptr_eq(&a.admission().unwrap(), &b.admission().unwrap()));

        let h = a.open_stream_file_write("x").unwrap();
        assert_eq!(b.open_files(), 1);
        drop(h);

        a.disconnect();
        a.disconnect();
        assert_eq!(registry.ref_count(&key), 1);
        b.disconnect();
        assert!(!registry.contains(&key));
    }

    #[test]
    pub fn storage_group_cache() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);

        assert_eq!(dev.list_storage_groups(), vec!["SG1".to_owned()]);
        dev.add_storage_group("SG2").unwrap();
        assert!(root.path().join("SG2").is_dir());
        assert_eq!(
            dev.add_storage_group("SG2").unwrap_err(),
            DeviceError::StorageGroupExists(String::new())
        );
        assert_eq!(dev.list_storage_groups(), vec!["SG1".to_owned(), "SG2".to_owned()]);

        dev.remove_storage_group("SG2").unwrap();
        assert!(!root.path().join("SG2").exists());
        assert_eq!(
            dev.remove_storage_group("SG2").unwrap_err(),
            DeviceError::StorageGroupNotFound(String::new())
        );
        assert_eq!(dev.list_storage_groups(), vec!["SG1".to_owned()]);
    }

    #[test]
    pub fn container_cache() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);

        assert_eq!(dev.list_containers().unwrap(), vec!["C1".to_owned()]);
        dev.add_container("C2").unwrap();
        assert!(dev.container_exists("C2").unwrap());
        assert!(root.path().join("SG1").join("C2").is_dir());
        assert_eq!(
            dev.add_container("C2").unwrap_err(),
            DeviceError::ContainerExists(String::new())
        );
        dev.remove_container("C2").unwrap();
        assert!(!dev.container_exists("C2").unwrap());
        assert_eq!(
            dev.remove_container("C2").unwrap_err(),
            DeviceError::ContainerNotFound(String::new())
        );

        let mut no_group = FsDevice::with_registry(root.path(), "", "C1", registry.clone());
        no_group.connect("", "").unwrap();
        assert_eq!(
            no_group.add_container("C3").unwrap_err(),
            DeviceError::NoActiveStorageGroup
        );
    }

    #[test]
    pub fn create_namespace_is_idempotent() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let mut dev = FsDevice::with_registry(root.path(), "SG9", "C9", registry);
        dev.connect("", "").unwrap();
        dev.create_namespace().unwrap();
        dev.create_namespace().unwrap();
        assert!(root.path().join("SG9").join("C9").is_dir());
        assert!(dev.container_exists("C9").unwrap());
    }

    #[test]
    pub fn buffer_roundtrip() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);
        dev.add_directory("data/ab").unwrap();

        for (name, payload) in [
            ("data/ab/empty", Vec::new()),
            ("data/ab/small", b"snapshot metadata".to_vec()),
            ("data/ab/block", crate::test::rand_payload(BLOCK_SIZE as usize)),
        ] {
            dev.copy_buffer_to_device(name, &payload).unwrap();
            assert!(dev.object_exist(name).unwrap());
            assert_eq!(&dev.copy_buffer_from_device(name).unwrap()[..], &payload[..]);
        }
        assert!(root.path().join("SG1/C1/data/ab/small").is_file());
        assert_eq!(dev.open_files(), 0);
    }

    #[test]
    pub fn resave_appends() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);

        dev.copy_buffer_to_device("obj", b"first").unwrap();
        dev.copy_buffer_to_device("obj", b"second").unwrap();
        assert_eq!(&dev.copy_buffer_from_device("obj").unwrap()[..], b"firstsecond");
    }

    #[test]
    pub fn positioned_write_keeps_offset() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);
        dev.copy_buffer_to_device("obj", b"0123456789").unwrap();

        let mut h = dev.open_stream_file_write("obj").unwrap();
        assert_eq!(WriteAt::write_at(&mut h, 2, b"XY").unwrap(), 2);
        h.write_all(b"end").unwrap();
        dev.close(h).unwrap();
        assert_eq!(&dev.copy_buffer_from_device("obj").unwrap()[..], b"01XY456789end");
    }

    #[test]
    pub fn replicate_range() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);
        dev.copy_buffer_to_device("src", b"0123456789").unwrap();
        dev.copy_buffer_to_device("dst", b"head:").unwrap();

        let src = dev.open_stream_file_read("src").unwrap();
        let mut dst = dev.open_stream_file_write("dst").unwrap();
        assert_eq!(dev.open_files(), 2);

        let r = dev.replicate_file(&src, &mut dst, 2, 5).unwrap();
        assert_eq!(r.bytes_replicated(), 5);
        assert_eq!(r.status, ReplicationStatus::Done);

        let err = dev.replicate_file(&src, &mut dst, 8, 5).unwrap_err();
        assert_eq!(
            err,
            DeviceError::ShortTransfer {
                path: String::new(),
                expected: 0,
                actual: 0
            }
        );

        dev.close(src).unwrap();
        dev.close(dst).unwrap();
        assert_eq!(dev.open_files(), 0);
        assert_eq!(&dev.copy_buffer_from_device("dst").unwrap()[..], b"head:23456");
    }

    #[test]
    pub fn failed_stream_open_releases_slot() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);
        for _ in 0..(MAX_OPEN_FILES * 3) {
            assert!(dev.open_stream_file_read("missing").unwrap_err().is_not_found());
            assert!(dev.open_stream_file_write("no/such/dir/obj").is_err());
        }
        assert_eq!(dev.open_files(), 0);

        let handles: Vec<_> = (0..MAX_OPEN_FILES)
            .map(|i| dev.open_stream_file_write(&format!("f{}", i)).unwrap())
            .collect();
        assert_eq!(dev.open_files(), MAX_OPEN_FILES);
        assert!(dev.admission().unwrap().try_acquire().is_none());
        for h in handles {
            dev.close(h).unwrap();
        }
        assert_eq!(dev.open_files(), 0);
    }

    #[test]
    pub fn copy_files_through_device() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);

        let local = scratch.path().join("in.bin");
        let payload = crate::test::rand_payload(100_000);
        File::create(&local).unwrap().write_all(&payload).unwrap();

        dev.add_directory("index").unwrap();
        assert_eq!(dev.copy_file_to_device(&local, "index/in.bin").unwrap(), 100_000);
        let out = scratch.path().join("out.bin");
        assert_eq!(dev.copy_file_from_device("index/in.bin", &out).unwrap(), 100_000);
        assert_eq!(fs::read(&out).unwrap(), payload);

        assert!(dev
            .copy_file_to_device(&scratch.path().join("nope"), "index/nope")
            .is_err());
        assert!(dev.copy_file_from_device("index/nope", &out).is_err());
        assert_eq!(dev.open_files(), 0);
    }

    #[test]
    pub fn walk_and_remove() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let dev = connected(&root, &registry);
        dev.add_directory("keys/sub").unwrap();
        dev.copy_buffer_to_device("keys/k1", b"k").unwrap();

        let mut entries = dev.dir_walk("keys").unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            entries,
            vec![
                DeviceFileInfo {
                    name: "k1".into(),
                    is_dir: false
                },
                DeviceFileInfo {
                    name: "sub".into(),
                    is_dir: true
                },
            ]
        );

        dev.delete_file("keys/k1").unwrap();
        assert!(!dev.object_exist("keys/k1").unwrap());
        assert!(dev.delete_file("keys/k1").unwrap_err().is_not_found());
        dev.remove_dir("keys").unwrap();
        dev.remove_dir("keys").unwrap();
        assert!(!dev.object_exist("keys").unwrap());
    }
}
