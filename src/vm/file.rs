//! File handles backing the OPEN/CLOSE/READ/WRITE syscalls.

use crate::bytecode::{FILE_PREOPEN, FILE_READ, FILE_WRITE};
use crate::errors::VmError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

/// What a descriptor points at.
enum Stream {
    Stdin,
    Stdout,
    Stderr,
    File(Mutex<File>),
}

/// An entry in the VM's descriptor table.
///
/// Descriptors 0, 1 and 2 are preopened onto the process's stdio and flagged
/// `FILE_PREOPEN`; closing them only removes the table entry.
pub struct FileHandle {
    path: String,
    flags: u32,
    /// Creation mode requested by the bytecode; recorded but advisory.
    #[allow(dead_code)]
    mode: u32,
    stream: Stream,
}

impl FileHandle {
    /// Opens `path` with the `FILE_READ`/`FILE_WRITE` flag bits.
    pub fn open(path: String, flags: u32, mode: u32) -> Result<Self, VmError> {
        let file = OpenOptions::new()
            .read(flags & FILE_READ != 0)
            .write(flags & FILE_WRITE != 0)
            .create(flags & FILE_WRITE != 0)
            .open(&path)?;
        Ok(Self {
            path,
            flags,
            mode,
            stream: Stream::File(Mutex::new(file)),
        })
    }

    pub fn stdin() -> Self {
        Self::preopened("stdin", FILE_READ, Stream::Stdin)
    }

    pub fn stdout() -> Self {
        Self::preopened("stdout", FILE_WRITE, Stream::Stdout)
    }

    pub fn stderr() -> Self {
        Self::preopened("stderr", FILE_WRITE, Stream::Stderr)
    }

    fn preopened(path: &str, flags: u32, stream: Stream) -> Self {
        Self {
            path: path.to_string(),
            flags: flags | FILE_PREOPEN,
            mode: 0,
            stream,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_preopened(&self) -> bool {
        self.flags & FILE_PREOPEN != 0
    }

    /// Reads up to `buf.len()` bytes into `buf`, returning the count.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, VmError> {
        let count = match &self.stream {
            Stream::Stdin => std::io::stdin().lock().read(buf)?,
            Stream::Stdout | Stream::Stderr => 0,
            Stream::File(file) => file.lock().read(buf)?,
        };
        Ok(count)
    }

    /// Writes `buf`, returning the number of bytes accepted.
    pub fn write(&self, buf: &[u8]) -> Result<usize, VmError> {
        let count = match &self.stream {
            Stream::Stdin => 0,
            Stream::Stdout => {
                let mut out = std::io::stdout().lock();
                let n = out.write(buf)?;
                out.flush()?;
                n
            }
            Stream::Stderr => {
                let mut err = std::io::stderr().lock();
                let n = err.write(buf)?;
                err.flush()?;
                n
            }
            Stream::File(file) => file.lock().write(buf)?,
        };
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    #[test]
    fn preopened_stdio_flags() {
        assert!(FileHandle::stdin().is_preopened());
        assert!(FileHandle::stdout().is_preopened());
        assert!(FileHandle::stderr().is_preopened());
        assert_eq!(FileHandle::stdin().path(), "stdin");
    }

    #[test]
    fn file_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin").to_string_lossy().into_owned();

        let handle = FileHandle::open(path.clone(), FILE_READ | FILE_WRITE, 0).unwrap();
        assert!(!handle.is_preopened());
        assert_eq!(handle.write(b"hello").unwrap(), 5);

        if let Stream::File(file) = &handle.stream {
            file.lock().rewind().unwrap();
        }
        let mut buf = [0; 5];
        assert_eq!(handle.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = FileHandle::open("/no/such/path/anywhere".to_string(), FILE_READ, 0);
        assert!(matches!(err, Err(VmError::IoError(_))));
    }
}
