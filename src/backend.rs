use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// How a file is opened through a [`Backend`].
///
/// The base image is always opened [`ReadOnly`](OpenMode::ReadOnly); the
/// read-write modes are used for the change file only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, creating the file when it does not exist.
    ReadWriteCreate,
}

/// Opens files by path on behalf of the engine.
///
/// The engine performs no OS calls of its own; everything goes through a
/// `Backend` and the [`BackendFile`] handles it produces. This also allows
/// the engine and the change-file overlay to be unit-tested without touching
/// the filesystem (see [`MemBackend`]).
pub trait Backend {
    type File: BackendFile;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Self::File>;
}

/// Positional I/O on an open file handle.
///
/// Reads and writes are all-or-nothing: `read_at` fills the whole buffer or
/// fails (a short read surfaces as [`io::ErrorKind::UnexpectedEof`]), and
/// `write_at` writes the whole buffer, extending the file if required.
pub trait BackendFile {
    /// Current length in bytes.
    fn len(&mut self) -> io::Result<u64>;

    /// Resize to `len` bytes, zero-filling when growing.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes all of `buf` at `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flushes buffered state to durable storage.
    fn flush(&mut self) -> io::Result<()>;
}

/// [`Backend`] over the host filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileBackend;

impl Backend for FileBackend {
    type File = FileHandle;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<FileHandle> {
        let mut options = fs::OpenOptions::new();

        match mode {
            OpenMode::ReadOnly => options.read(true),
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::ReadWriteCreate => options.read(true).write(true).create(true),
        };

        Ok(FileHandle {
            file: options.open(path)?,
        })
    }
}

/// An open [`FileBackend`] file.
#[derive(Debug)]
pub struct FileHandle {
    file: fs::File,
}

impl BackendFile for FileHandle {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// In-memory [`Backend`] used for tests and embedding.
///
/// Clones share the same file namespace, so a test can keep a handle on the
/// backend, hand a clone to the engine, and inspect what was written after
/// the engine is done.
#[derive(Clone, Debug, Default)]
pub struct MemBackend {
    files: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a file with `data`, replacing any previous content.
    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files
            .lock()
            .expect("backend lock poisoned")
            .insert(path.into(), Arc::new(Mutex::new(data)));
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.files
            .lock()
            .expect("backend lock poisoned")
            .contains_key(path.as_ref())
    }

    /// Returns a copy of the file's current content.
    pub fn snapshot(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let files = self.files.lock().expect("backend lock poisoned");
        let data = files.get(path.as_ref())?;
        let data = data.lock().expect("backend lock poisoned");
        Some(data.clone())
    }
}

/// An open [`MemBackend`] file.
#[derive(Debug)]
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Backend for MemBackend {
    type File = MemFile;

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<MemFile> {
        let mut files = self.files.lock().expect("backend lock poisoned");

        match files.get(path) {
            Some(data) => Ok(MemFile { data: data.clone() }),
            None if mode == OpenMode::ReadWriteCreate => {
                let data = Arc::new(Mutex::new(Vec::new()));
                files.insert(path.to_path_buf(), data.clone());
                Ok(MemFile { data })
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )),
        }
    }
}

impl BackendFile for MemFile {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.data.lock().expect("backend lock poisoned").len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        self.data
            .lock()
            .expect("backend lock poisoned")
            .resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock().expect("backend lock poisoned");
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file")
            })?;

        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().expect("backend lock poisoned");
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;

        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
