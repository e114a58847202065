//! Soundfile descriptor and error types.
//!
//! A [`SoundFile`] is the per-file context shared by every component: the
//! open handle, the resolved format implementation, the sample geometry,
//! and the remaining payload byte limit. The descriptor is a plain value;
//! whoever owns it mutates it (the batch engine directly, the streaming
//! worker under its object's mutex).

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::sync::Arc;

use crate::format::SoundFileFormat;

/// Hard upper bound on channels per file.
pub const MAX_CHANNELS: usize = 64;

/// Sentinel byte limit meaning "no declared end of payload".
pub const MAX_BYTES: usize = usize::MAX;

/// Sentinel frame count meaning "no requested limit".
pub const MAX_FRAMES: usize = usize::MAX / (MAX_CHANNELS * 4);

/// How the header of a file to be opened should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSpec {
    /// Probe the registered formats and parse the recognized header.
    Detect,
    /// No header parse; caller supplies the geometry and this many bytes
    /// are skipped before the first frame.
    Raw(usize),
}

/// Sample endianness as requested on a command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub fn native() -> Endian {
        if crate::codec::host_is_big_endian() {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    /// Single-letter form used in info tuples: `b` or `l`.
    pub fn letter(self) -> char {
        match self {
            Endian::Big => 'b',
            Endian::Little => 'l',
        }
    }
}

/// Opaque per-format state held while a file is open.
///
/// Ownership transfers to the format's `close` call, which is responsible
/// for releasing it; the descriptor nulls its slot at that point so a
/// superseding open can never see stale state.
pub trait FormatState: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> FormatState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-file context: handle, format, geometry, remaining payload.
pub struct SoundFile {
    /// Open OS handle, `None` when closed.
    pub file: Option<File>,
    /// Resolved format implementation, set whenever `file` is.
    pub format: Option<Arc<dyn SoundFileFormat>>,
    /// Sample rate in Hz. Informational only; never used for timing.
    pub sample_rate: u32,
    /// Channel count, 1..=64.
    pub channels: usize,
    /// Bytes per sample: 2, 3, or 4 (4 is always IEEE float).
    pub bytes_per_sample: usize,
    /// True if sample data is big-endian.
    pub big_endian: bool,
    /// Header size in bytes once known.
    pub header_size: usize,
    /// channels * bytes_per_sample; kept in sync by [`set_geometry`].
    ///
    /// [`set_geometry`]: SoundFile::set_geometry
    pub bytes_per_frame: usize,
    /// Payload bytes remaining before EOF.
    pub byte_limit: usize,
    /// Format-private state, owned by the format while the file is open.
    pub state: Option<Box<dyn FormatState>>,
}

impl SoundFile {
    pub fn new() -> SoundFile {
        SoundFile {
            file: None,
            format: None,
            sample_rate: 0,
            channels: 0,
            bytes_per_sample: 0,
            big_endian: false,
            header_size: 0,
            bytes_per_frame: 0,
            byte_limit: MAX_BYTES,
            state: None,
        }
    }

    /// Set the sample geometry, keeping the derived frame size in sync.
    pub fn set_geometry(&mut self, channels: usize, bytes_per_sample: usize) {
        self.channels = channels;
        self.bytes_per_sample = bytes_per_sample;
        self.bytes_per_frame = channels * bytes_per_sample;
    }

    pub fn endian(&self) -> Endian {
        if self.big_endian {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Whole frames remaining within the byte limit.
    pub fn frames_left(&self) -> usize {
        if self.bytes_per_frame == 0 || self.byte_limit == MAX_BYTES {
            return MAX_FRAMES;
        }
        self.byte_limit / self.bytes_per_frame
    }

    /// Five-element info tuple for result outlets.
    pub fn info(&self) -> SfInfo {
        SfInfo {
            sample_rate: self.sample_rate,
            header_size: self.header_size,
            channels: self.channels,
            bytes_per_sample: self.bytes_per_sample,
            endian: self.endian().letter(),
        }
    }

    /// Close through the format implementation, releasing format state.
    pub fn close(&mut self) {
        if let Some(format) = self.format.clone() {
            format.close(self);
        } else {
            self.file = None;
        }
        self.state = None;
    }
}

impl Default for SoundFile {
    fn default() -> SoundFile {
        SoundFile::new()
    }
}

impl fmt::Debug for SoundFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.sample_rate,
            self.channels,
            self.bytes_per_sample,
            self.header_size,
            self.endian().letter(),
            self.byte_limit,
            self.bytes_per_frame
        )
    }
}

/// Format info emitted after every read or write:
/// sample rate, header size, channels, bytes per sample, endianness letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfInfo {
    pub sample_rate: u32,
    pub header_size: usize,
    pub channels: usize,
    pub bytes_per_sample: usize,
    pub endian: char,
}

/// Error type for soundfile operations.
#[derive(Debug)]
pub enum SfError {
    /// The file could not be located through the environment's resolver.
    PathNotFound(String),
    /// No registered format recognized the header, or the header was
    /// malformed for the format that claimed it.
    BadHeader(String),
    /// The container is valid but carries samples this library does not
    /// handle (compressed, or a width outside 2..=4 bytes).
    UnsupportedSampleFormat(String),
    /// OS-level read/write/seek failure.
    Io(std::io::Error),
    /// The format has no metadata support.
    MetadataUnsupported(&'static str),
    /// A named table does not exist.
    NoSuchTable(String),
    /// A table could not be resized to the requested length.
    ResizeFailed(String),
    /// Bad flags or arguments on a command surface.
    Usage(String),
}

impl fmt::Display for SfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SfError::PathNotFound(name) => write!(f, "{}: can't open", name),
            SfError::BadHeader(name) => {
                write!(f, "{}: unknown or bad header format", name)
            }
            SfError::UnsupportedSampleFormat(name) => write!(
                f,
                "{}: supported sample formats: uncompressed 16 bit int, \
                 24 bit int, or 32 bit float",
                name
            ),
            SfError::Io(err) => write!(f, "{}", err),
            SfError::MetadataUnsupported(name) => {
                write!(f, "{} does not support metadata", name)
            }
            SfError::NoSuchTable(name) => write!(f, "{}: no such table", name),
            SfError::ResizeFailed(name) => write!(f, "{}: resize failed", name),
            SfError::Usage(msg) => write!(f, "usage: {}", msg),
        }
    }
}

impl std::error::Error for SfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SfError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SfError {
    fn from(err: std::io::Error) -> SfError {
        SfError::Io(err)
    }
}

pub type SfResult<T> = Result<T, SfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_kept_in_sync() {
        let mut sf = SoundFile::new();
        sf.set_geometry(2, 3);
        assert_eq!(sf.bytes_per_frame, 6);
        sf.set_geometry(8, 4);
        assert_eq!(sf.bytes_per_frame, 32);
    }

    #[test]
    fn test_frames_left() {
        let mut sf = SoundFile::new();
        sf.set_geometry(2, 2);
        sf.byte_limit = 4000;
        assert_eq!(sf.frames_left(), 1000);
        sf.byte_limit = MAX_BYTES;
        assert_eq!(sf.frames_left(), MAX_FRAMES);
    }

    #[test]
    fn test_endian_letters() {
        assert_eq!(Endian::Big.letter(), 'b');
        assert_eq!(Endian::Little.letter(), 'l');
    }

    #[test]
    fn test_info_tuple() {
        let mut sf = SoundFile::new();
        sf.sample_rate = 44100;
        sf.set_geometry(2, 2);
        sf.header_size = 44;
        let info = sf.info();
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.header_size, 44);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bytes_per_sample, 2);
        assert_eq!(info.endian, 'l');
    }
}
