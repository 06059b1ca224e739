use std::io::{self, Read, Write};

use positioned_io::{ReadAt, WriteAt};

use crate::{
    device::DeviceFile,
    err::{DeviceError, Result},
    transport::RemoteObject,
};

/// Remote object adapted to the device file contract. Reads go through a
/// private cursor, writes always land at the current end of the object.
#[derive(Debug)]
pub struct StreamFile {
    object: Box<dyn RemoteObject>,
    read_off: u64,
}

impl StreamFile {
    pub fn new(object: Box<dyn RemoteObject>) -> Self {
        Self {
            object,
            read_off: 0,
        }
    }

    /// Reads everything from the cursor to the end of the object.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let size = self.object.size()?;
        let mut buf = vec![0u8; size.saturating_sub(self.read_off) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.object.read_at(&mut buf[filled..], self.read_off)?;
            if n == 0 {
                break;
            }
            filled += n;
            self.read_off += n as u64;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn short_write(&self, expected: usize, actual: usize) -> DeviceError {
        DeviceError::ShortTransfer {
            path: self.object.name().to_owned(),
            expected: expected as u64,
            actual: actual as u64,
        }
    }
}

impl Read for StreamFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.object.read_at(buf, self.read_off)?;
        self.read_off += n as u64;
        Ok(n)
    }
}

impl Write for StreamFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.object.size()?;
        let n = self.object.write_at(buf, end)?;
        if n < buf.len() {
            return Err(self.short_write(buf.len(), n).into());
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ReadAt for StreamFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.object.read_at(buf, pos)?)
    }
}

impl WriteAt for StreamFile {
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        let n = self.object.write_at(buf, pos)?;
        if n < buf.len() {
            return Err(self.short_write(buf.len(), n).into());
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DeviceFile for StreamFile {
    fn name(&self) -> &str {
        self.object.name()
    }

    fn size(&self) -> Result<u64> {
        self.object.size()
    }

    fn close(&mut self) -> Result<()> {
        self.object.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::{memory::MemoryTransport, OpenMode, Transport};

    #[test]
    pub fn cursor_reads_and_appending_writes() {
        let t = MemoryTransport::new();
        let mut f = StreamFile::new(t.open("obj", OpenMode::CREATE | OpenMode::WRITE).unwrap());
        f.write_all(b"hello").unwrap();
        f.write_all(b" world").unwrap();
        assert_eq!(f.size().unwrap(), 11);

        let mut r = StreamFile::new(t.open("obj", OpenMode::READ).unwrap());
        let mut head = [0u8; 6];
        r.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"hello ");
        assert_eq!(r.read_all().unwrap(), b"world");
        assert_eq!(r.read_all().unwrap(), b"");

        let mut buf = [0u8; 4];
        assert_eq!(ReadAt::read_at(&r, 1, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ello");
    }

    #[test]
    pub fn short_write_is_an_error() {
        let t = MemoryTransport::new().with_write_limit(4);
        let mut f = StreamFile::new(t.open("obj", OpenMode::CREATE | OpenMode::WRITE).unwrap());
        let err = f.write(b"0123456789").unwrap_err();
        assert_eq!(
            DeviceError::from_io("obj", err),
            DeviceError::ShortTransfer {
                path: String::new(),
                expected: 0,
                actual: 0
            }
        );
        assert!(WriteAt::write_at(&mut f, 0, b"abcdef").is_err());
    }

    #[test]
    pub fn close_releases_remote_object() {
        let t = MemoryTransport::new();
        let mut f = StreamFile::new(t.open("obj", OpenMode::CREATE | OpenMode::WRITE).unwrap());
        assert_eq!(t.open_objects(), 1);
        f.close().unwrap();
        f.close().unwrap();
        assert_eq!(t.open_objects(), 0);
    }
}
