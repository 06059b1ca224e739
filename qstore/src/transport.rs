//! Client side of the remote streaming protocol.
//!
//! The streaming device only talks to the remote end through [`Transport`]
//! and [`RemoteObject`]. Paths handed to a transport are full remote paths,
//! `storageGroup/container/objectPath`, and the empty path is the endpoint root.

use std::{fmt::Debug, fmt::Display, sync::Arc};

use bitflags::bitflags;

use crate::err::{DeviceError, Result};

pub mod memory;

/// Opaque token identifying one protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const CREATE = 0b0100;
        const APPEND = 0b1000;
    }
}

#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub url: String,
    pub username: String,
    pub password: String,
    pub storage_group: String,
    pub container: String,
    pub info: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// One open remote object. The protocol has no implicit cursor, every
/// transfer names its offset.
pub trait RemoteObject: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn size(&self) -> Result<u64>;
    /// Returns 0 once `offset` is at or past the end of the object.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    /// May write fewer bytes than asked; callers decide whether that is an error.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    fn close(&mut self) -> Result<()>;
}

pub trait Transport: Send + Sync + Debug {
    /// Protocol handshake. Handshakes against the same endpoint return the same
    /// token while that session is alive.
    fn connect(&self, info: &ConnectInfo) -> Result<SessionId>;
    fn disconnect(&self, session: SessionId);
    fn exists(&self, path: &str) -> Result<bool>;
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;
    /// Fails when the parent directory does not exist.
    fn mkdir(&self, path: &str) -> Result<()>;
    fn remove_all(&self, path: &str) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn RemoteObject>>;
}

/// Resolves a device url to its transport. `mem://<name>` is a process wide
/// in-memory endpoint.
pub fn for_url(url: &str) -> Result<Arc<dyn Transport>> {
    match url.split_once("://") {
        Some(("mem", name)) => Ok(memory::endpoint(name)),
        Some((scheme, _)) => Err(DeviceError::Connect(format!(
            "no transport for scheme {} in {}",
            scheme, url
        ))),
        None => Err(DeviceError::Connect(format!("invalid device url {}", url))),
    }
}
