use std::{
    fmt::Debug,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::Path,
    str::FromStr,
    sync::Arc,
};

use bytes::Bytes;
use log::debug;
use positioned_io::{ReadAt, WriteAt};

use crate::{
    err::{DeviceError, IoResultExt, Result},
    util::{AdmissionPermit, HandleSemaphore},
};

pub mod fs;
pub mod stream;

pub use fs::FsDevice;
pub use stream::StreamDevice;

/// Parallel transfer streams a caller should run against one device.
pub const MAX_STREAMS: usize = 20;
/// Admitted open handles per physical session.
pub const MAX_OPEN_FILES: usize = 5;
/// Natural transfer granularity, used to size buffers. Not a protocol limit.
pub const BLOCK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Filesystem,
    Streaming,
}

impl DeviceType {
    pub fn tag(&self) -> &'static str {
        match self {
            DeviceType::Filesystem => "FILESYSTEM_DEVICE",
            DeviceType::Streaming => "ROFS_DEVICE",
        }
    }

    /// Picks the device type: the environment override wins over the
    /// configured tag, and with neither the streaming device is used.
    pub fn resolve(configured: Option<&str>, env_override: Option<&str>) -> Result<DeviceType> {
        match env_override.filter(|s| !s.is_empty()).or(configured) {
            Some(tag) => tag.parse(),
            None => Ok(DeviceType::Streaming),
        }
    }
}

impl FromStr for DeviceType {
    type Err = DeviceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "FILESYSTEM_DEVICE" | "filesystem" => Ok(DeviceType::Filesystem),
            "ROFS_DEVICE" | "STREAMING_DEVICE" | "streaming" => Ok(DeviceType::Streaming),
            other => Err(DeviceError::InvalidDeviceType(other.to_owned())),
        }
    }
}

/// How to reach a device. For the filesystem device `url` is the root directory.
#[derive(Debug, Clone)]
pub struct DeviceAttributes {
    pub url: String,
    pub username: String,
    pub password: String,
    pub info: String,
    pub storage_group: String,
    pub container: String,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFileInfo {
    pub name: String,
    pub is_dir: bool,
}

/// The file contract every device handle provides.
pub trait DeviceFile: Read + Write + ReadAt + WriteAt + Send {
    fn name(&self) -> &str;
    fn size(&self) -> Result<u64>;
    fn close(&mut self) -> Result<()>;
}

/// An open object on a device. Handles opened through the stream opens carry
/// an admission permit that goes back to the session when the handle is
/// closed or dropped.
pub struct DeviceHandle {
    file: Box<dyn DeviceFile>,
    permit: Option<AdmissionPermit>,
}

impl DeviceHandle {
    pub fn new<F: DeviceFile + 'static>(file: F) -> Self {
        Self {
            file: Box::new(file),
            permit: None,
        }
    }

    fn admitted(mut self, permit: AdmissionPermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    pub fn size(&self) -> Result<u64> {
        self.file.size()
    }

    pub fn is_admitted(&self) -> bool {
        self.permit.is_some()
    }

    pub fn close(mut self) -> Result<()> {
        let r = self.file.close();
        self.permit.take();
        r
    }
}

impl Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name())
            .field("admitted", &self.is_admitted())
            .finish()
    }
}

impl Read for DeviceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for DeviceHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut *self.file)
    }
}

impl ReadAt for DeviceHandle {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read_at(pos, buf)
    }
}

impl WriteAt for DeviceHandle {
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        self.file.write_at(pos, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        WriteAt::flush(&mut *self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    Pending,
    Done,
}

/// Outcome of one block range copy between two open handles.
#[derive(Debug, Clone)]
pub struct Replication {
    pub source: String,
    pub destination: String,
    pub bytes_replicated: u64,
    pub status: ReplicationStatus,
}

impl Replication {
    fn new(src: &DeviceHandle, dst: &DeviceHandle) -> Self {
        Self {
            source: src.name().to_owned(),
            destination: dst.name().to_owned(),
            bytes_replicated: 0,
            status: ReplicationStatus::Pending,
        }
    }

    pub fn bytes_replicated(&self) -> u64 {
        self.bytes_replicated
    }
}

/// A storage device. Paths are relative to the active storage group and
/// container of the instance.
pub trait Device: Send + Sync + Debug {
    fn device_type(&self) -> DeviceType;

    fn connect(&mut self, user: &str, password: &str) -> Result<()>;
    fn disconnect(&mut self);

    /// Semaphore of the session this instance is connected to.
    fn admission(&self) -> Result<Arc<HandleSemaphore>>;

    /// Creates the active storage group and container if they are missing.
    fn create_namespace(&self) -> Result<()>;

    fn add_directory(&self, path: &str) -> Result<()>;
    fn remove_dir(&self, path: &str) -> Result<()>;
    fn delete_file(&self, path: &str) -> Result<()>;
    fn object_exist(&self, path: &str) -> Result<bool>;
    fn dir_walk(&self, path: &str) -> Result<Vec<DeviceFileInfo>>;

    fn open_read(&self, path: &str) -> Result<DeviceHandle>;
    /// Creates the object if missing, appends to it otherwise.
    fn open_write(&self, path: &str) -> Result<DeviceHandle>;

    fn open_stream_file_read(&self, path: &str) -> Result<DeviceHandle> {
        let permit = self.admission()?.acquire();
        // an open failure drops the permit on the way out
        let handle = self.open_read(path)?;
        Ok(handle.admitted(permit))
    }

    fn open_stream_file_write(&self, path: &str) -> Result<DeviceHandle> {
        let permit = self.admission()?.acquire();
        let handle = self.open_write(path)?;
        Ok(handle.admitted(permit))
    }

    fn copy_file_to_device(&self, source: &Path, dest: &str) -> Result<u64> {
        let source_name = source.display().to_string();
        let mut src = File::open(source).at(&source_name)?;
        let mut dst = self.open_stream_file_write(dest)?;
        let copied = io::copy(&mut src, &mut dst).at(dest);
        let closed = self.close(dst);
        let copied = copied?;
        closed?;
        debug!("bytes copied from {} to {}: {}", source_name, dest, copied);
        Ok(copied)
    }

    fn copy_file_from_device(&self, source: &str, dest: &Path) -> Result<u64> {
        let dest_name = dest.display().to_string();
        let mut dst = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)
            .at(&dest_name)?;
        let mut src = self.open_stream_file_read(source)?;
        let copied = io::copy(&mut src, &mut dst).at(source);
        let closed = self.close(src);
        let copied = copied?;
        closed?;
        debug!("bytes copied from {} to {}: {}", source, dest_name, copied);
        Ok(copied)
    }

    fn copy_buffer_to_device(&self, path: &str, buffer: &[u8]) -> Result<()> {
        let mut fp = self.open_write(path)?;
        let written = fp.write_all(buffer).at(path);
        let closed = self.close(fp);
        written?;
        closed?;
        debug!("bytes copied to {}: {}", path, buffer.len());
        Ok(())
    }

    fn copy_buffer_from_device(&self, path: &str) -> Result<Bytes> {
        let mut fp = self.open_read(path)?;
        let read = read_whole(&mut fp, path);
        let closed = self.close(fp);
        let buffer = read?;
        closed?;
        debug!("bytes copied from {}: {}", path, buffer.len());
        Ok(buffer.into())
    }

    /// Copies `length` bytes of `src` starting at `src_offset` to the append
    /// position of `dst`.
    fn replicate_file(
        &self,
        src: &DeviceHandle,
        dst: &mut DeviceHandle,
        src_offset: u64,
        length: u64,
    ) -> Result<Replication> {
        let mut replication = Replication::new(src, dst);
        let available = src.size()?.saturating_sub(src_offset);
        if available < length {
            return Err(DeviceError::ShortTransfer {
                path: src.name().to_owned(),
                expected: length,
                actual: available,
            });
        }

        let mut buf = vec![0u8; length.min(self.block_size()) as usize];
        while replication.bytes_replicated < length {
            let chunk = (length - replication.bytes_replicated).min(buf.len() as u64) as usize;
            let offset = src_offset + replication.bytes_replicated;
            let n = read_full_at(src, offset, &mut buf[..chunk])?;
            if n < chunk {
                return Err(DeviceError::ShortTransfer {
                    path: src.name().to_owned(),
                    expected: length,
                    actual: replication.bytes_replicated + n as u64,
                });
            }
            dst.write_all(&buf[..chunk]).at(dst.name())?;
            replication.bytes_replicated += chunk as u64;
        }
        replication.status = ReplicationStatus::Done;
        debug!(
            "replicated {} bytes from {} to {}",
            replication.bytes_replicated, replication.source, replication.destination
        );
        Ok(replication)
    }

    fn file_size(&self, handle: &DeviceHandle) -> Result<u64> {
        handle.size()
    }

    /// Closes the handle and gives back its admission slot, if it holds one.
    fn close(&self, handle: DeviceHandle) -> Result<()> {
        handle.close()
    }

    fn open_files(&self) -> usize {
        self.admission().map(|s| s.count()).unwrap_or(0)
    }

    fn max_streams(&self) -> usize {
        MAX_STREAMS
    }

    fn block_size(&self) -> u64 {
        BLOCK_SIZE
    }
}

fn read_full_at(src: &DeviceHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src
            .read_at(offset + filled as u64, &mut buf[filled..])
            .at(src.name())?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_whole(fp: &mut DeviceHandle, path: &str) -> Result<Vec<u8>> {
    let size = fp.size()?;
    let mut buffer = Vec::with_capacity(size as usize);
    fp.read_to_end(&mut buffer).at(path)?;
    if (buffer.len() as u64) < size {
        return Err(DeviceError::ShortTransfer {
            path: path.to_owned(),
            expected: size,
            actual: buffer.len() as u64,
        });
    }
    Ok(buffer)
}

/// Builds the device variant named by `attributes` and connects it.
pub fn connect_to_device(attributes: &DeviceAttributes) -> Result<Box<dyn Device>> {
    let mut device: Box<dyn Device> = match attributes.device_type {
        DeviceType::Filesystem => Box::new(FsDevice::new(
            &attributes.url,
            &attributes.storage_group,
            &attributes.container,
        )),
        DeviceType::Streaming => {
            let transport = crate::transport::for_url(&attributes.url)?;
            Box::new(StreamDevice::new(attributes, transport))
        }
    };
    device.connect(&attributes.username, &attributes.password)?;
    Ok(device)
}
