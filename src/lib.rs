//! A library for random-access reading and writing of partclone partition
//! images.
//!
//! A partition image stores only the blocks that were in use on the imaged
//! device, preceded by a usage bitmap saying which logical blocks those
//! are. This crate presents such an image as if it were the device itself:
//! seek to any logical block and read back either the stored contents (for
//! used blocks) or zeros (for unused ones). Writes never touch the image:
//! they are redirected to a sidecar change file that shadows the base on
//! every later read.
//!
//! # Features
//!
//! - Parse and verify the "0001" and "0002" image formats, including the
//!   V2 bitmap CRC
//! - O(1) logical-block to file-offset translation via a precomputed
//!   prefix-sum index over the usage map
//! - Copy-on-write change file ([`changefile`]) so the base image stays
//!   pristine
//! - Pluggable I/O backend ([`backend`]); implementations for plain files
//!   and in-memory buffers are included
//!
//! # Example
//!
//! ```no_run
//! use partclone_image::{FileBackend, Image};
//!
//! let mut image = Image::open(FileBackend, "sda1.img").unwrap();
//! image.verify().unwrap();
//!
//! let block_size = image.block_size().unwrap() as usize;
//! let mut buf = vec![0u8; block_size * 4];
//! image.seek(0).unwrap();
//! image.read_blocks(&mut buf).unwrap();
//! ```
//!
//! # References
//!
//! - partclone: <https://partclone.org>

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use zerocopy::FromBytes;

pub mod backend;
pub mod changefile;
pub mod checksum;
pub mod diagnostics;

mod bitmap;
mod header;

pub use backend::{Backend, BackendFile, FileBackend, MemBackend, OpenMode};
pub use changefile::{ChangeFile, ChangeFileError};
pub use diagnostics::{DiagnosticSink, SilentDiagnostics};

use bitmap::UsageMap;
use header::{ImageHeader, V1HeaderRaw, V2HeaderRaw};

/// Default prefix-sum stride factor: one index entry per 1024 blocks.
pub const DEFAULT_STRIDE_FACTOR: u32 = bitmap::DEFAULT_STRIDE_FACTOR;

/// On-disk format version of an image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Version {
    /// "0001": byte-wide usage map closed by an 8-byte marker.
    V1,
    /// "0002": bit-packed usage map protected by a CRC-32.
    V2,
}

/// Version stamps understood by the engine. Immutable; the matching row is
/// selected by byte-exact comparison during [`Image::verify`].
const VERSION_TABLE: &[(&[u8; 4], Version)] =
    &[(b"0001", Version::V1), (b"0002", Version::V2)];

// Hard cap to keep a hostile header from driving absurd allocations or
// offset overflows.
const MAX_TOTAL_BLOCKS: u64 = 1 << 48;

impl Version {
    fn from_stamp(stamp: &[u8; 4]) -> Option<Self> {
        VERSION_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == stamp)
            .map(|&(_, version)| version)
    }
}

/// Options for [`Image::open_with`].
#[derive(Clone, Debug)]
pub struct ImageOptions {
    /// Change-file path. When `None` and a write needs one, the engine
    /// derives `<image-path>.cf`.
    pub change_file: Option<PathBuf>,
    /// Governs writability only; the base image is always opened
    /// read-only.
    pub mode: OpenMode,
    /// log2 of the prefix-sum stride: one index entry per
    /// `2^stride_factor` blocks. Smaller factors trade memory for faster
    /// seeks.
    pub stride_factor: u32,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            change_file: None,
            mode: OpenMode::ReadOnly,
            stride_factor: DEFAULT_STRIDE_FACTOR,
        }
    }
}

/// Errors for [`Image::open`] / [`Image::open_with`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot open image file"))]
    Open { source: io::Error },

    #[snafu(display("stride factor {factor} out of range (max 31)"))]
    InvalidStrideFactor { factor: u32 },
}

/// Errors for [`Image::verify`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum VerifyError {
    #[snafu(display("cannot read image header"))]
    ReadHeader { source: io::Error },

    #[snafu(display("unrecognized image version stamp"))]
    UnknownVersion,

    #[snafu(display("invalid image magic"))]
    BadMagic,

    #[snafu(display("cannot read usage map"))]
    ReadBitmap { source: io::Error },

    #[snafu(display(
        "usage map checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
    ))]
    BitmapCrcMismatch { stored: u32, computed: u32 },

    #[snafu(display("usage map trailer marker mismatch"))]
    BadTrailerMagic,

    #[snafu(display("image dimensions do not fit in memory"))]
    NoMemory,

    #[snafu(display("cannot attach change file"))]
    AttachChangeFile { source: ChangeFileError },
}

/// Errors for [`Image::seek`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum SeekError {
    #[snafu(display("image is not verified"))]
    NotReady,

    #[snafu(display("block {block} out of range ({total_blocks} blocks)"))]
    OutOfRange { block: u64, total_blocks: u64 },
}

/// Errors for [`Image::read_blocks`] / [`Image::block_used`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("image is not verified"))]
    NotReady,

    #[snafu(display("block {block} out of range ({total_blocks} blocks)"))]
    OutOfRange { block: u64, total_blocks: u64 },

    #[snafu(display(
        "buffer length {len} is not a multiple of the block size {block_size}"
    ))]
    UnalignedBuffer { len: usize, block_size: u32 },

    #[snafu(display("cannot read block {block}"))]
    Io { block: u64, source: io::Error },

    #[snafu(display("change file read failed"))]
    ChangeFile { source: ChangeFileError },
}

/// Errors for [`Image::write_blocks`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(display("image is not verified"))]
    NotReady,

    #[snafu(display("image was opened read-only"))]
    ReadOnly,

    #[snafu(display("block {block} out of range ({total_blocks} blocks)"))]
    OutOfRange { block: u64, total_blocks: u64 },

    #[snafu(display(
        "buffer length {len} is not a multiple of the block size {block_size}"
    ))]
    UnalignedBuffer { len: usize, block_size: u32 },

    #[snafu(display("cannot create change file"))]
    CreateChangeFile { source: ChangeFileError },

    #[snafu(display("change file write failed"))]
    ChangeFile { source: ChangeFileError },
}

/// Errors for [`Image::sync`] / [`Image::close`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum SyncError {
    #[snafu(display("image is not write-ready"))]
    NotReady,

    #[snafu(display("change file sync failed"))]
    ChangeFile { source: ChangeFileError },
}

/// Errors for [`probe`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ProbeError {
    #[snafu(transparent)]
    Open { source: OpenError },

    #[snafu(transparent)]
    Verify { source: VerifyError },
}

/// Checks whether `path` holds a recognized partition image.
///
/// Opens the file read-only, verifies it, and drops the handle. Nothing is
/// ever written.
pub fn probe<B: Backend>(backend: B, path: impl AsRef<Path>) -> Result<(), ProbeError> {
    let mut image = Image::open(backend, path)?;
    image.verify()?;
    Ok(())
}

/// State that exists only once [`Image::verify`] has succeeded.
struct Verified {
    header: ImageHeader,
    version: Version,
    usage: UsageMap,
    /// Count of used blocks strictly before the cursor; keeps block reads
    /// O(1) during sequential sweeps.
    walking_valid: u64,
}

/// An opened partition image.
///
/// The handle goes through two phases: [`open`](Self::open) only opens the
/// base file (read-only, always), and [`verify`](Self::verify) identifies
/// the format and loads the usage map. Reading and writing are available
/// after a successful verify; operations called too early fail with their
/// `NotReady` variant.
///
/// A handle is single-threaded: the block cursor ([`seek`](Self::seek) /
/// [`tell`](Self::tell)) is stateful. Multiple independent read-only
/// handles on one image file are safe.
#[must_use]
pub struct Image<B: Backend> {
    backend: B,
    file: B::File,
    path: PathBuf,
    cf_path: Option<PathBuf>,
    mode: OpenMode,
    stride_factor: u32,
    tolerant: bool,
    diagnostics: Box<dyn DiagnosticSink>,
    state: Option<Verified>,
    change_file: Option<ChangeFile<B::File>>,
    cur_block: u64,
}

impl<B: Backend> fmt::Debug for Image<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("verified", &self.state.is_some())
            .field("block_count", &self.block_count())
            .field("cur_block", &self.cur_block)
            .field("change_file", &self.change_file.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Image<B> {
    /// Opens the image at `path` read-only with default options.
    pub fn open(backend: B, path: impl AsRef<Path>) -> Result<Self, OpenError> {
        Self::open_with(backend, path, ImageOptions::default())
    }

    /// Opens the image at `path`.
    ///
    /// The base file is opened read-only regardless of `options.mode`; the
    /// mode only decides whether a change file may be attached or created.
    /// Nothing is read until [`verify`](Self::verify).
    pub fn open_with(
        backend: B,
        path: impl AsRef<Path>,
        options: ImageOptions,
    ) -> Result<Self, OpenError> {
        ensure!(
            options.stride_factor <= 31,
            InvalidStrideFactorSnafu {
                factor: options.stride_factor,
            }
        );

        let path = path.as_ref().to_path_buf();
        let file = backend.open(&path, OpenMode::ReadOnly).context(OpenSnafu)?;

        Ok(Self {
            backend,
            file,
            path,
            cf_path: options.change_file,
            mode: options.mode,
            stride_factor: options.stride_factor,
            tolerant: false,
            diagnostics: Box::new(SilentDiagnostics),
            state: None,
            change_file: None,
            cur_block: 0,
        })
    }

    /// Switches subsequent [`verify`](Self::verify) calls to tolerant
    /// mode: a V1 trailer-marker mismatch is reported through the
    /// diagnostic sink instead of failing verification. The V2 bitmap CRC
    /// stays fatal; a corrupt bitmap corrupts block indexing itself.
    pub fn set_tolerant(&mut self) {
        self.tolerant = true;
    }

    /// Installs a sink for verification diagnostics.
    pub fn set_diagnostics(&mut self, sink: Box<dyn DiagnosticSink>) {
        self.diagnostics = sink;
    }

    /// Identifies the on-disk format and loads the usage map.
    ///
    /// Reads the outer header, selects the format handler by its 4-byte
    /// version stamp, validates magic and integrity data, expands the
    /// usage map, and precomputes the prefix-sum index. On success the
    /// cursor is reset to block 0.
    ///
    /// When a change-file path was supplied and the image is writable, an
    /// existing change file is attached and validated here; a missing one
    /// is not an error (it is created lazily by the first write), but a
    /// present-and-invalid one fails verification.
    pub fn verify(&mut self) -> Result<(), VerifyError> {
        let mut outer = [0u8; header::OUTER_HEADER_SIZE];
        self.file.read_at(0, &mut outer).context(ReadHeaderSnafu)?;

        let stamp: [u8; 4] = outer[IMAGE_MAGIC_LEN..]
            .try_into()
            .expect("outer header holds a 4-byte stamp");
        let version = Version::from_stamp(&stamp).context(UnknownVersionSnafu)?;

        let (mut header, usage) = match version {
            Version::V1 => self.verify_v1()?,
            Version::V2 => self.verify_v2()?,
        };

        // The on-disk device size is advisory.
        header.device_size = header
            .total_blocks
            .checked_mul(u64::from(header.block_size))
            .ok_or(VerifyError::NoMemory)?;

        if usage.anomalous_bytes() > 0 {
            self.diagnostics.anomalous_map_bytes(usage.anomalous_bytes());
        }

        self.change_file = match (&self.cf_path, self.is_writable()) {
            (Some(cf_path), true) => {
                match ChangeFile::open(&self.backend, cf_path, header.block_size, header.total_blocks)
                {
                    Ok(mut cf) => {
                        cf.verify().context(AttachChangeFileSnafu)?;
                        Some(cf)
                    }
                    Err(ChangeFileError::Io { source })
                        if source.kind() == io::ErrorKind::NotFound =>
                    {
                        None
                    }
                    Err(e) => return Err(VerifyError::AttachChangeFile { source: e }),
                }
            }
            _ => None,
        };

        self.state = Some(Verified {
            header,
            version,
            usage,
            walking_valid: 0,
        });
        self.cur_block = 0;
        Ok(())
    }

    fn verify_v1(&mut self) -> Result<(ImageHeader, UsageMap), VerifyError> {
        let mut raw_bytes = [0u8; header::V1_HEADER_SIZE];
        self.file.read_at(0, &mut raw_bytes).context(ReadHeaderSnafu)?;
        let raw = V1HeaderRaw::read_from_bytes(&raw_bytes)
            .expect("buffer is exactly one header");

        ensure!(&raw.magic == header::IMAGE_MAGIC, BadMagicSnafu);
        debug_assert_eq!(&raw.version, b"0001");
        ensure!(raw.total_blocks.get() <= MAX_TOTAL_BLOCKS, NoMemorySnafu);

        let image_header = ImageHeader::from_v1(&raw);
        let total = usize::try_from(image_header.total_blocks)
            .map_err(|_| VerifyError::NoMemory)?;

        let mut map = Vec::new();
        map.try_reserve_exact(total)
            .map_err(|_| VerifyError::NoMemory)?;
        map.resize(total, 0);
        self.file
            .read_at(header::V1_HEADER_SIZE as u64, &mut map)
            .context(ReadBitmapSnafu)?;

        let mut trailer = [0u8; 8];
        self.file
            .read_at(header::V1_HEADER_SIZE as u64 + total as u64, &mut trailer)
            .context(ReadBitmapSnafu)?;
        if &trailer != header::BITMAP_MAGIC {
            ensure!(self.tolerant, BadTrailerMagicSnafu);
            self.diagnostics.trailer_magic_mismatch();
        }

        let usage = UsageMap::build(map, self.stride_factor)
            .map_err(|_| VerifyError::NoMemory)?;
        Ok((image_header, usage))
    }

    fn verify_v2(&mut self) -> Result<(ImageHeader, UsageMap), VerifyError> {
        let mut raw_bytes = [0u8; header::V2_HEADER_SIZE];
        self.file.read_at(0, &mut raw_bytes).context(ReadHeaderSnafu)?;
        let raw = V2HeaderRaw::read_from_bytes(&raw_bytes)
            .expect("buffer is exactly one header");

        ensure!(&raw.magic == header::IMAGE_MAGIC, BadMagicSnafu);
        debug_assert_eq!(&raw.version, b"0002");
        ensure!(raw.total_blocks.get() <= MAX_TOTAL_BLOCKS, NoMemorySnafu);

        let image_header = ImageHeader::from_v2(&raw);
        let bitmap_size = usize::try_from(image_header.bitmap_size())
            .map_err(|_| VerifyError::NoMemory)?;

        let mut bits = Vec::new();
        bits.try_reserve_exact(bitmap_size + header::CRC_SIZE)
            .map_err(|_| VerifyError::NoMemory)?;
        bits.resize(bitmap_size + header::CRC_SIZE, 0);
        self.file
            .read_at(header::V2_HEADER_SIZE as u64, &mut bits)
            .context(ReadBitmapSnafu)?;

        let stored = u32::from_le_bytes(
            bits[bitmap_size..]
                .try_into()
                .expect("trailing CRC is 4 bytes"),
        );
        let computed = checksum::ieee_crc32(&bits[..bitmap_size]);
        ensure!(
            stored == computed,
            BitmapCrcMismatchSnafu { stored, computed }
        );

        let total = usize::try_from(image_header.total_blocks)
            .map_err(|_| VerifyError::NoMemory)?;
        let map = bitmap::expand_bits(&bits[..bitmap_size], total)
            .map_err(|_| VerifyError::NoMemory)?;
        drop(bits);

        let usage = UsageMap::build(map, self.stride_factor)
            .map_err(|_| VerifyError::NoMemory)?;
        Ok((image_header, usage))
    }

    /// Block size of the verified image, or `None` before
    /// [`verify`](Self::verify).
    #[must_use]
    pub fn block_size(&self) -> Option<u32> {
        self.state.as_ref().map(|s| s.header.block_size)
    }

    /// Number of logical blocks, or `None` before [`verify`](Self::verify).
    #[must_use]
    pub fn block_count(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.header.total_blocks)
    }

    /// Size of the imaged device in bytes (always
    /// `block_count * block_size`), or `None` before
    /// [`verify`](Self::verify).
    #[must_use]
    pub fn device_size(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.header.device_size)
    }

    /// Format version of the verified image.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        self.state.as_ref().map(|s| s.version)
    }

    /// Path of the base image file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the change file, once one is configured or derived.
    #[must_use]
    pub fn change_file_path(&self) -> Option<&Path> {
        self.cf_path.as_deref()
    }

    /// Current block cursor, or `None` before [`verify`](Self::verify).
    #[must_use]
    pub fn tell(&self) -> Option<u64> {
        self.state.as_ref().map(|_| self.cur_block)
    }

    /// Positions the cursor at `block` and resynchronizes the walking
    /// used-block count from the prefix-sum index.
    ///
    /// `block` may equal the block count (the end-of-image position); any
    /// read or write from there fails.
    pub fn seek(&mut self, block: u64) -> Result<(), SeekError> {
        let state = self.state.as_mut().context(seek_error::NotReadySnafu)?;
        ensure!(
            block <= state.header.total_blocks,
            seek_error::OutOfRangeSnafu {
                block,
                total_blocks: state.header.total_blocks,
            }
        );

        state.walking_valid = state.usage.count_before(block);
        self.cur_block = block;
        Ok(())
    }

    /// Reads whole blocks at the cursor into `buf`.
    ///
    /// `buf` must hold a whole number of blocks. For each block, an
    /// override in the change file wins; otherwise a used block is read
    /// from the image and an unused block is zero-filled. Blocks are
    /// filled in order and the cursor advances past each completed block,
    /// so after an error the cursor rests on the block that failed and the
    /// caller may re-seek and retry.
    pub fn read_blocks(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        let state = self.state.as_mut().context(read_error::NotReadySnafu)?;
        let block_size = state.header.block_size as usize;
        ensure!(
            block_size > 0 && buf.len() % block_size == 0,
            read_error::UnalignedBufferSnafu {
                len: buf.len(),
                block_size: state.header.block_size,
            }
        );

        let file = &mut self.file;
        let change_file = &mut self.change_file;
        let cur_block = &mut self.cur_block;

        for chunk in buf.chunks_exact_mut(block_size) {
            ensure!(
                *cur_block < state.header.total_blocks,
                read_error::OutOfRangeSnafu {
                    block: *cur_block,
                    total_blocks: state.header.total_blocks,
                }
            );
            read_one_block(state, change_file, file, *cur_block, chunk)?;
            *cur_block += 1;
        }

        Ok(())
    }

    /// Reports whether the block under the cursor reads from stored data:
    /// overridden in the change file, or marked used in the image's usage
    /// map.
    pub fn block_used(&self) -> Result<bool, ReadError> {
        let state = self.state.as_ref().context(read_error::NotReadySnafu)?;
        ensure!(
            self.cur_block < state.header.total_blocks,
            read_error::OutOfRangeSnafu {
                block: self.cur_block,
                total_blocks: state.header.total_blocks,
            }
        );

        if let Some(cf) = &self.change_file {
            if cf.block_present(self.cur_block) {
                return Ok(true);
            }
        }

        Ok(state.usage.is_used(self.cur_block))
    }

    /// Writes whole blocks at the cursor.
    ///
    /// Writes never touch the base image: every block lands in the change
    /// file, which is created on the first write if none is attached yet
    /// (at the configured path, or `<image-path>.cf`). The cursor advances
    /// past each completed block.
    pub fn write_blocks(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        let state = self.state.as_ref().context(write_error::NotReadySnafu)?;
        ensure!(self.mode != OpenMode::ReadOnly, write_error::ReadOnlySnafu);

        let block_size = state.header.block_size;
        let total_blocks = state.header.total_blocks;
        ensure!(
            block_size > 0 && buf.len() % block_size as usize == 0,
            write_error::UnalignedBufferSnafu {
                len: buf.len(),
                block_size,
            }
        );
        if buf.is_empty() {
            return Ok(());
        }

        self.ensure_change_file(block_size, total_blocks)?;

        let state = self.state.as_mut().context(write_error::NotReadySnafu)?;
        let change_file = self
            .change_file
            .as_mut()
            .context(write_error::NotReadySnafu)?;
        let cur_block = &mut self.cur_block;

        for chunk in buf.chunks_exact(block_size as usize) {
            ensure!(
                *cur_block < total_blocks,
                write_error::OutOfRangeSnafu {
                    block: *cur_block,
                    total_blocks,
                }
            );
            change_file
                .write_block(*cur_block, chunk)
                .context(write_error::ChangeFileSnafu)?;
            // Advancing the cursor past a block that is used in the base
            // keeps the walking count honest for any read that follows.
            if state.usage.is_used(*cur_block) {
                state.walking_valid += 1;
            }
            *cur_block += 1;
        }

        Ok(())
    }

    /// Flushes pending change-file writes to durable storage.
    ///
    /// Blocks written but not yet synced may be lost on a crash; that is
    /// the durability contract.
    pub fn sync(&mut self) -> Result<(), SyncError> {
        ensure!(
            self.state.is_some() && self.is_writable(),
            sync_error::NotReadySnafu
        );
        let cf = self
            .change_file
            .as_mut()
            .context(sync_error::NotReadySnafu)?;
        cf.sync().context(sync_error::ChangeFileSnafu)
    }

    /// Flushes the change file (if one is attached) and closes the image.
    ///
    /// Dropping the handle does the same, discarding any sync error.
    /// Closing a half-constructed handle (opened but never verified, or
    /// whose verify failed) is fine and releases everything.
    pub fn close(mut self) -> Result<(), SyncError> {
        match self.change_file.take() {
            Some(cf) => cf.finish().context(sync_error::ChangeFileSnafu),
            None => Ok(()),
        }
    }

    fn is_writable(&self) -> bool {
        self.mode != OpenMode::ReadOnly
    }

    /// Creates and attaches the change file if none is attached yet.
    fn ensure_change_file(
        &mut self,
        block_size: u32,
        total_blocks: u64,
    ) -> Result<(), WriteError> {
        if self.change_file.is_some() {
            return Ok(());
        }

        let cf_path = match &self.cf_path {
            Some(path) => path.clone(),
            None => {
                let mut path = self.path.clone().into_os_string();
                path.push(".cf");
                let path = PathBuf::from(path);
                self.cf_path = Some(path.clone());
                path
            }
        };

        let cf = ChangeFile::create(&self.backend, &cf_path, block_size, total_blocks)
            .context(write_error::CreateChangeFileSnafu)?;
        self.change_file = Some(cf);
        Ok(())
    }
}

impl<B: Backend> Drop for Image<B> {
    fn drop(&mut self) {
        if let Some(cf) = self.change_file.as_mut() {
            let _ = cf.sync();
        }
    }
}

const IMAGE_MAGIC_LEN: usize = header::IMAGE_MAGIC.len();

/// Reads one block at `block` into `buf`: change-file override first, then
/// the image for used blocks, zeros for unused ones.
fn read_one_block<F: BackendFile>(
    state: &mut Verified,
    change_file: &mut Option<ChangeFile<F>>,
    file: &mut F,
    block: u64,
    buf: &mut [u8],
) -> Result<(), ReadError> {
    if let Some(cf) = change_file {
        if cf
            .read_block(block, buf)
            .context(read_error::ChangeFileSnafu)?
        {
            // The walking count stays in step even when the overlay served
            // the read; later used blocks are addressed from it.
            if state.usage.is_used(block) {
                state.walking_valid += 1;
            }
            return Ok(());
        }
    }

    if state.usage.is_used(block) {
        let offset = state.header.stored_block_offset(state.walking_valid);
        file.read_at(offset, buf)
            .context(read_error::IoSnafu { block })?;
        state.walking_valid += 1;
    } else {
        buf.fill(0);
    }

    Ok(())
}
