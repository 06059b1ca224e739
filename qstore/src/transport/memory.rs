use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use lazy_static::lazy_static;

use super::*;
use crate::util::path;

// session tokens are unique across endpoints, they key the shared session registry
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref ENDPOINTS: Mutex<HashMap<String, Arc<MemoryTransport>>> = Mutex::new(HashMap::new());
}

/// Named in-memory endpoint shared by everything in the process that
/// resolves `mem://<name>`.
pub fn endpoint(name: &str) -> Arc<MemoryTransport> {
    ENDPOINTS
        .lock()
        .unwrap()
        .entry(name.to_owned())
        .or_insert_with(|| Arc::new(MemoryTransport::new()))
        .clone()
}

type ObjectData = Arc<RwLock<Vec<u8>>>;

#[derive(Debug, Default)]
struct Tree {
    dirs: BTreeSet<String>,
    objects: BTreeMap<String, ObjectData>,
}

impl Tree {
    fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || self.dirs.contains(path)
    }

    fn children<'a, I>(keys: I, dir: &'a str) -> impl Iterator<Item = &'a str> + 'a
    where
        I: Iterator<Item = &'a String> + 'a,
    {
        keys.filter(move |k| path::parent(k) == dir)
            .map(|k| path::base(k))
    }
}

#[derive(Debug, Default)]
struct Handshake {
    active: Option<SessionId>,
    handshakes: usize,
    teardowns: usize,
}

/// Loopback implementation of the streaming protocol, kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    tree: Mutex<Tree>,
    handshake: Mutex<Handshake>,
    credentials: Option<(String, String)>,
    write_limit: Option<usize>,
    open_objects: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects handshakes with any other username/password.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    /// Caps the bytes accepted by a single positional write.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.handshake.lock().unwrap().active
    }

    pub fn handshakes(&self) -> usize {
        self.handshake.lock().unwrap().handshakes
    }

    pub fn teardowns(&self) -> usize {
        self.handshake.lock().unwrap().teardowns
    }

    /// Remote objects opened and not yet closed or dropped.
    pub fn open_objects(&self) -> usize {
        self.open_objects.load(Ordering::Acquire)
    }

    fn io_err(path: &str, kind: io::ErrorKind, detail: &str) -> DeviceError {
        DeviceError::Io {
            path: path.to_owned(),
            source: io::Error::new(kind, detail.to_owned()),
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, info: &ConnectInfo) -> Result<SessionId> {
        if let Some((user, password)) = &self.credentials {
            if user != &info.username || password != &info.password {
                return Err(DeviceError::Connect(format!(
                    "credentials rejected for {} at {}",
                    info.username, info.url
                )));
            }
        }
        let mut hs = self.handshake.lock().unwrap();
        hs.handshakes += 1;
        if let Some(id) = hs.active {
            return Ok(id);
        }
        let id = SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        hs.active = Some(id);
        Ok(id)
    }

    fn disconnect(&self, session: SessionId) {
        let mut hs = self.handshake.lock().unwrap();
        if hs.active == Some(session) {
            hs.active = None;
            hs.teardowns += 1;
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let path = path::clean(path);
        let tree = self.tree.lock().unwrap();
        Ok(tree.is_dir(&path) || tree.objects.contains_key(&path))
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = path::clean(path);
        let tree = self.tree.lock().unwrap();
        if !tree.is_dir(&path) {
            return Err(Self::io_err(&path, io::ErrorKind::NotFound, "no such directory"));
        }
        let dirs = Tree::children(tree.dirs.iter(), &path).map(|name| RemoteEntry {
            name: name.to_owned(),
            kind: EntryKind::Directory,
        });
        let objects = Tree::children(tree.objects.keys(), &path).map(|name| RemoteEntry {
            name: name.to_owned(),
            kind: EntryKind::Object,
        });
        Ok(dirs.chain(objects).collect())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let path = path::clean(path);
        let mut tree = self.tree.lock().unwrap();
        if tree.is_dir(&path) || tree.objects.contains_key(&path) {
            return Err(Self::io_err(&path, io::ErrorKind::AlreadyExists, "already exists"));
        }
        if !tree.is_dir(path::parent(&path)) {
            return Err(Self::io_err(
                &path,
                io::ErrorKind::NotFound,
                "parent directory does not exist",
            ));
        }
        tree.dirs.insert(path);
        Ok(())
    }

    fn remove_all(&self, path: &str) -> Result<()> {
        let path = path::clean(path);
        let prefix = format!("{}/", path);
        let mut tree = self.tree.lock().unwrap();
        if path.is_empty() {
            *tree = Tree::default();
            return Ok(());
        }
        tree.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
        tree.objects
            .retain(|o, _| o != &path && !o.starts_with(&prefix));
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let path = path::clean(path);
        let mut tree = self.tree.lock().unwrap();
        match tree.objects.remove(&path) {
            Some(_) => Ok(()),
            None => Err(Self::io_err(&path, io::ErrorKind::NotFound, "no such object")),
        }
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn RemoteObject>> {
        let path = path::clean(path);
        let mut tree = self.tree.lock().unwrap();
        let data = if mode.contains(OpenMode::CREATE) {
            if tree.objects.contains_key(&path) || tree.is_dir(&path) {
                return Err(Self::io_err(&path, io::ErrorKind::AlreadyExists, "already exists"));
            }
            if !tree.is_dir(path::parent(&path)) {
                return Err(Self::io_err(
                    &path,
                    io::ErrorKind::NotFound,
                    "parent directory does not exist",
                ));
            }
            let data = ObjectData::default();
            tree.objects.insert(path.clone(), data.clone());
            data
        } else {
            match tree.objects.get(&path) {
                Some(data) => data.clone(),
                None => return Err(Self::io_err(&path, io::ErrorKind::NotFound, "no such object")),
            }
        };

        self.open_objects.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryObject {
            name: path,
            data,
            mode,
            write_limit: self.write_limit,
            open_objects: self.open_objects.clone(),
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryObject {
    name: String,
    data: ObjectData,
    mode: OpenMode,
    write_limit: Option<usize>,
    open_objects: Arc<AtomicUsize>,
    closed: bool,
}

impl RemoteObject for MemoryObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().unwrap().len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.read().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.mode.intersects(OpenMode::WRITE | OpenMode::APPEND) {
            return Err(MemoryTransport::io_err(
                &self.name,
                io::ErrorKind::PermissionDenied,
                "object not opened for writing",
            ));
        }
        let n = self.write_limit.map_or(buf.len(), |l| l.min(buf.len()));
        let offset = offset as usize;
        let mut data = self.data.write().unwrap();
        if data.len() < offset + n {
            data.resize(offset + n, 0);
        }
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.open_objects.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
