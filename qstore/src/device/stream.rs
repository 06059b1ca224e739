use std::sync::Arc;

use log::{debug, info};

use super::*;
use crate::{
    err::{DeviceError, Result},
    session::{SessionKey, SessionRegistry},
    transport::{ConnectInfo, EntryKind, OpenMode, SessionId, Transport},
    util::{path, HandleSemaphore},
};

pub mod file;

pub use file::StreamFile;

/// Storage group used when the attributes leave it empty.
pub const SYSTEM_WIDE_GROUP: &str = "_system_wide";

/// Device over a remote streaming endpoint.
#[derive(Debug)]
pub struct StreamDevice {
    info: ConnectInfo,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    session: Option<(SessionId, Arc<HandleSemaphore>)>,
}

impl StreamDevice {
    pub fn new(attributes: &DeviceAttributes, transport: Arc<dyn Transport>) -> Self {
        Self::with_registry(attributes, transport, SessionRegistry::global())
    }

    pub fn with_registry(
        attributes: &DeviceAttributes,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let storage_group = match path::clean(&attributes.storage_group) {
            g if g.is_empty() => SYSTEM_WIDE_GROUP.to_owned(),
            g => g,
        };
        Self {
            info: ConnectInfo {
                url: attributes.url.clone(),
                username: attributes.username.clone(),
                password: attributes.password.clone(),
                storage_group,
                container: path::clean(&attributes.container),
                info: attributes.info.clone(),
            },
            transport,
            registry,
            session: None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|(id, _)| *id)
    }

    fn remote_path(&self, p: &str) -> String {
        path::join([
            self.info.storage_group.as_str(),
            self.info.container.as_str(),
            p,
        ])
    }

    fn ensure_dir(&self, remote: &str) -> Result<()> {
        if remote.is_empty() || self.transport.exists(remote)? {
            return Ok(());
        }
        self.ensure_dir(path::parent(remote))?;
        debug!("mkdir {}", remote);
        match self.transport.mkdir(remote) {
            // lost a race with another writer creating the same directory
            Err(_) if self.transport.exists(remote)? => Ok(()),
            r => r,
        }
    }
}

impl Device for StreamDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Streaming
    }

    fn connect(&mut self, user: &str, password: &str) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        self.info.username = user.to_owned();
        self.info.password = password.to_owned();
        let (transport, info) = (&self.transport, &self.info);
        let (id, sem) = self
            .registry
            .connect_remote(MAX_OPEN_FILES, || transport.connect(info))?;
        info!(
            "connected to {} as {} session {}",
            self.info.url, self.info.username, id
        );
        self.session = Some((id, sem));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some((id, _)) = self.session.take() {
            let transport = &self.transport;
            self.registry
                .release(&SessionKey::Remote(id), || transport.disconnect(id));
        }
    }

    fn admission(&self) -> Result<Arc<HandleSemaphore>> {
        self.session
            .as_ref()
            .map(|(_, sem)| sem.clone())
            .ok_or(DeviceError::NotConnected)
    }

    fn create_namespace(&self) -> Result<()> {
        self.ensure_dir(&path::join([
            self.info.storage_group.as_str(),
            self.info.container.as_str(),
        ]))
    }

    fn add_directory(&self, p: &str) -> Result<()> {
        self.ensure_dir(&self.remote_path(p))
    }

    fn remove_dir(&self, p: &str) -> Result<()> {
        let remote = self.remote_path(p);
        if !self.transport.exists(&remote)? {
            return Ok(());
        }
        self.transport.remove_all(&remote)
    }

    fn delete_file(&self, p: &str) -> Result<()> {
        self.transport.delete(&self.remote_path(p))
    }

    fn object_exist(&self, p: &str) -> Result<bool> {
        self.transport.exists(&self.remote_path(p))
    }

    fn dir_walk(&self, p: &str) -> Result<Vec<DeviceFileInfo>> {
        Ok(self
            .transport
            .list(&self.remote_path(p))?
            .into_iter()
            .map(|e| DeviceFileInfo {
                name: e.name,
                is_dir: e.kind == EntryKind::Directory,
            })
            .collect())
    }

    fn open_read(&self, p: &str) -> Result<DeviceHandle> {
        let object = self.transport.open(&self.remote_path(p), OpenMode::READ)?;
        Ok(DeviceHandle::new(StreamFile::new(object)))
    }

    fn open_write(&self, p: &str) -> Result<DeviceHandle> {
        let remote = self.remote_path(p);
        let mode = if self.transport.exists(&remote)? {
            OpenMode::WRITE | OpenMode::APPEND
        } else {
            OpenMode::CREATE | OpenMode::WRITE
        };
        let object = self.transport.open(&remote, mode)?;
        Ok(DeviceHandle::new(StreamFile::new(object)))
    }

    fn copy_buffer_from_device(&self, p: &str) -> Result<Bytes> {
        let remote = self.remote_path(p);
        let mut file = StreamFile::new(self.transport.open(&remote, OpenMode::READ)?);
        let size = file.size();
        let read = file.read_all();
        let closed = file.close();
        let (size, buffer) = (size?, read?);
        closed?;
        if (buffer.len() as u64) < size {
            return Err(DeviceError::ShortTransfer {
                path: remote,
                expected: size,
                actual: buffer.len() as u64,
            });
        }
        debug!("bytes copied from {}: {}", remote, buffer.len());
        Ok(buffer.into())
    }
}

impl Drop for StreamDevice {
    fn drop(&mut self) {
        self.disconnect();
    }
}
