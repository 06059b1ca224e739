use std::{
    fmt::Debug,
    io::{self, Read},
};

use log::{debug, info, warn};
use positioned_io::ReadAt;

use crate::{
    config::{Config, ResavePolicy},
    context::Context,
    device::{connect_to_device, Device, DeviceAttributes, DeviceFileInfo, DeviceHandle},
    err::{DeviceError, IoResultExt, Result},
    layout::{DefaultLayout, FileInfo, FileType, Handle, Layout},
    util::path,
};

/// Object store contract the repository layer drives.
pub trait ObjectStore: Send + Sync + Debug {
    fn location(&self) -> String;
    fn test(&self, h: &Handle) -> Result<bool>;
    fn remove(&self, h: &Handle) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn save(&self, ctx: &Context, h: &Handle, rd: &mut dyn Read) -> Result<()>;
    /// Hands `f` a reader over `length` bytes at `offset`; a zero length
    /// reads to the end of the object.
    fn load(
        &self,
        ctx: &Context,
        h: &Handle,
        length: u64,
        offset: u64,
        f: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<()>;
    fn stat(&self, ctx: &Context, h: &Handle) -> Result<FileInfo>;
    fn list(&self, ctx: &Context, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()>;
    fn is_not_exist(&self, err: &DeviceError) -> bool;
    fn delete(&self, ctx: &Context) -> Result<()>;
}

/// Bounded reader over a positioned device handle.
pub struct RangeReader<'a> {
    r: &'a DeviceHandle,
    offset: u64,
    end: u64,
}

impl<'a> RangeReader<'a> {
    pub fn new(r: &'a DeviceHandle, offset: u64, end: u64) -> Self {
        Self { r, offset, end }
    }
}

impl<'a> Read for RangeReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.end {
            return Ok(0);
        }
        let len = buf.len().min((self.end - self.offset) as usize);
        let n = self.r.read_at(self.offset, &mut buf[..len])?;
        self.offset += n as u64;
        Ok(n)
    }
}

#[derive(Debug)]
pub struct Backend {
    device: Box<dyn Device>,
    attributes: DeviceAttributes,
    layout: DefaultLayout,
    resave: ResavePolicy,
    closed: bool,
}

impl Backend {
    pub fn with_device(
        device: Box<dyn Device>,
        attributes: DeviceAttributes,
        layout: DefaultLayout,
        resave: ResavePolicy,
    ) -> Self {
        Self {
            device,
            attributes,
            layout,
            resave,
            closed: false,
        }
    }

    /// Connects to an existing repository namespace.
    pub fn open(cfg: &Config) -> Result<Self> {
        let attributes = cfg.device_attributes()?;
        debug!(
            "open {} device at {}",
            attributes.device_type.tag(),
            attributes.url
        );
        let device = connect_to_device(&attributes)?;
        Ok(Self::with_device(
            device,
            attributes,
            DefaultLayout::new(&cfg.prefix),
            cfg.resave,
        ))
    }

    /// Connects and lays out a fresh repository: storage group, container and
    /// every type directory.
    pub fn create(cfg: &Config) -> Result<Self> {
        let be = Self::open(cfg)?;
        be.device.create_namespace()?;
        for dir in be.layout.paths() {
            be.device.add_directory(&dir)?;
        }
        info!("repository created at {}", be.location());
        Ok(be)
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn layout(&self) -> &DefaultLayout {
        &self.layout
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DeviceError::NotConnected);
        }
        Ok(())
    }

    fn object_size(&self, name: &str) -> Result<u64> {
        let fp = self.device.open_read(name)?;
        let size = self.device.file_size(&fp);
        let closed = self.device.close(fp);
        let size = size?;
        closed?;
        Ok(size)
    }

    fn read_range(
        &self,
        fp: &DeviceHandle,
        length: u64,
        offset: u64,
        f: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        let size = fp.size()?;
        let end = match length {
            0 => Some(size),
            n => offset.checked_add(n),
        };
        match end {
            Some(end) if offset <= size && end <= size => f(&mut RangeReader::new(fp, offset, end)),
            _ => Err(DeviceError::ShortTransfer {
                path: fp.name().to_owned(),
                expected: if length == 0 { size.saturating_sub(offset) } else { length },
                actual: size.saturating_sub(offset),
            }),
        }
    }

    fn visit(
        &self,
        ctx: &Context,
        name: &str,
        f: &mut dyn FnMut(FileInfo) -> Result<()>,
    ) -> Result<()> {
        ctx.check()?;
        let size = self.object_size(name)?;
        f(FileInfo {
            name: path::base(name).to_owned(),
            size,
        })
    }

    fn walk(&self, dir: &str) -> Result<Option<Vec<DeviceFileInfo>>> {
        match self.device.dir_walk(dir) {
            Ok(mut entries) => {
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(Some(entries))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl ObjectStore for Backend {
    fn location(&self) -> String {
        format!(
            "{}:{}/{}/{}",
            self.attributes.device_type.tag(),
            self.attributes.url,
            self.attributes.storage_group,
            self.attributes.container
        )
    }

    fn test(&self, h: &Handle) -> Result<bool> {
        self.check_open()?;
        h.valid()?;
        self.device.object_exist(&self.layout.filename(h))
    }

    fn remove(&self, h: &Handle) -> Result<()> {
        self.check_open()?;
        h.valid()?;
        self.device.delete_file(&self.layout.filename(h))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.device.disconnect();
            debug!("closed {}", self.location());
        }
        Ok(())
    }

    fn save(&self, ctx: &Context, h: &Handle, rd: &mut dyn Read) -> Result<()> {
        self.check_open()?;
        h.valid()?;
        ctx.check()?;
        let name = self.layout.filename(h);
        self.device.add_directory(path::parent(&name))?;

        let mut buf = Vec::new();
        rd.read_to_end(&mut buf).at(&name)?;

        if self.resave == ResavePolicy::Overwrite && self.device.object_exist(&name)? {
            debug!("overwriting {}", name);
            self.device.delete_file(&name)?;
        }
        self.device.copy_buffer_to_device(&name, &buf)?;
        debug!("saved {} as {}: {} bytes", h, name, buf.len());
        Ok(())
    }

    fn load(
        &self,
        ctx: &Context,
        h: &Handle,
        length: u64,
        offset: u64,
        f: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        self.check_open()?;
        h.valid()?;
        ctx.check()?;
        let name = self.layout.filename(h);
        let fp = self.device.open_stream_file_read(&name)?;
        let r = self.read_range(&fp, length, offset, f);
        let closed = self.device.close(fp);
        if let Err(e) = &closed {
            warn!("close {} after load: {}", name, e);
        }
        r?;
        closed
    }

    fn stat(&self, ctx: &Context, h: &Handle) -> Result<FileInfo> {
        self.check_open()?;
        h.valid()?;
        ctx.check()?;
        let size = self.object_size(&self.layout.filename(h))?;
        Ok(FileInfo {
            name: h.name.clone(),
            size,
        })
    }

    fn list(&self, ctx: &Context, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
        self.check_open()?;
        let (dir, sharded) = self.layout.basedir(t);
        let Some(entries) = self.walk(&dir)? else {
            debug!("list {}: base directory {} missing", t, dir);
            return Ok(());
        };

        for entry in entries {
            let sub = path::join([dir.as_str(), entry.name.as_str()]);
            if !entry.is_dir {
                self.visit(ctx, &sub, f)?;
                continue;
            }
            if !sharded {
                continue;
            }
            for leaf in self.walk(&sub)?.unwrap_or_default() {
                if !leaf.is_dir {
                    self.visit(ctx, &path::join([sub.as_str(), leaf.name.as_str()]), f)?;
                }
            }
        }
        ctx.check()
    }

    fn is_not_exist(&self, err: &DeviceError) -> bool {
        err.is_not_found()
    }

    fn delete(&self, ctx: &Context) -> Result<()> {
        self.check_open()?;
        for dir in self.layout.paths() {
            ctx.check()?;
            self.device.remove_dir(&dir)?;
        }
        match self.device.delete_file(&self.layout.filename(&Handle::config())) {
            Err(e) if e.is_not_found() => Ok(()),
            r => r,
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
