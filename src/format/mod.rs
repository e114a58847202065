//! Container format plug-ins.
//!
//! Each supported container implements [`SoundFileFormat`], a vtable of
//! per-format operations: header sniffing, header read/write/update,
//! frame seeking, sample I/O, filename extension handling, an endianness
//! policy, and optional metadata access.
//!
//! Formats register into a process-wide, append-only list of at most
//! [`MAX_FORMATS`] entries. Registration order is significant: it is the
//! sniff priority during header detection and the first entry is the
//! default format when nothing else applies. The raw pass-through format
//! is a singleton outside the registry and only reachable explicitly.

pub mod aiff;
pub mod caf;
pub mod next;
pub mod raw;
pub mod wave;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;

use crate::soundfile::{Endian, HeaderSpec, SfError, SfResult, SoundFile};

pub use aiff::AiffFormat;
pub use caf::CafFormat;
pub use next::NextFormat;
pub use raw::RawFormat;
pub use wave::WaveFormat;

/// Maximum number of registered format implementations.
pub const MAX_FORMATS: usize = 8;

/// A container format implementation.
///
/// Implementations are stateless and shared; per-file state lives in the
/// descriptor's `state` slot and is released by [`close`].
///
/// [`close`]: SoundFileFormat::close
pub trait SoundFileFormat: Send + Sync {
    /// Printable name, also the `-<name>` command flag.
    fn name(&self) -> &'static str;

    /// Smallest byte count `sniff` needs to recognize a header.
    fn min_header_size(&self) -> usize;

    /// True iff `buf` plausibly begins a file of this format.
    fn sniff(&self, buf: &[u8]) -> bool;

    /// Parse the header with the handle at byte 0; fill geometry, sample
    /// rate, endianness, header size, and payload byte limit.
    fn read_header(&self, sf: &mut SoundFile) -> SfResult<()>;

    /// Emit a header declaring `nframes` frames of the descriptor's
    /// geometry; returns the header size in bytes.
    fn write_header(&self, sf: &mut SoundFile, nframes: usize) -> SfResult<usize>;

    /// Patch length fields after the real frame count is known. Must be
    /// idempotent; called on close and after short writes.
    fn update_header(&self, sf: &mut SoundFile, frames_written: usize) -> SfResult<()>;

    /// Absolute seek to `header_size + frame * bytes_per_frame`.
    fn seek_to_frame(&self, sf: &mut SoundFile, frame: usize) -> SfResult<()> {
        let offset = sf.header_size as u64 + (sf.bytes_per_frame * frame) as u64;
        let file = sf.file.as_mut().ok_or_else(closed)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read payload bytes at the current position. The default is a plain
    /// `read`; partial reads are the caller's business.
    fn read_samples(&self, sf: &mut SoundFile, buf: &mut [u8]) -> SfResult<usize> {
        let file = sf.file.as_mut().ok_or_else(closed)?;
        Ok(file.read(buf)?)
    }

    /// Write payload bytes at the current position. The default is a plain
    /// `write`; a short count is reported, not retried.
    fn write_samples(&self, sf: &mut SoundFile, buf: &[u8]) -> SfResult<usize> {
        let file = sf.file.as_mut().ok_or_else(closed)?;
        Ok(file.write(buf)?)
    }

    /// Read format-specific metadata as key/value pairs.
    fn read_metadata(&self, _sf: &mut SoundFile) -> SfResult<Vec<(String, String)>> {
        Err(SfError::MetadataUnsupported(self.name()))
    }

    /// Write format-specific metadata from raw message arguments. Only
    /// valid between header creation and the first sample write.
    fn write_metadata(&self, _sf: &mut SoundFile, _args: &[String]) -> SfResult<()> {
        Err(SfError::MetadataUnsupported(self.name()))
    }

    /// True if `name` ends in one of this format's filename extensions.
    fn has_extension(&self, name: &str) -> bool;

    /// Extension appended when completing a filename, without the dot.
    fn default_extension(&self) -> &'static str;

    /// Map a requested endianness to the one the format will actually use.
    fn endianness(&self, requested: Option<Endian>) -> Endian;

    /// Close the handle and release per-format state. Ownership of the
    /// state transfers here so a superseding open can never double-free.
    fn close(&self, sf: &mut SoundFile) {
        sf.file = None;
        sf.state = None;
    }
}

/// Overwrite bytes at an absolute offset, preserving the current position.
pub(crate) fn patch_bytes(file: &mut File, pos: u64, bytes: &[u8]) -> SfResult<()> {
    let saved = file.stream_position()?;
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(bytes)?;
    file.seek(SeekFrom::Start(saved))?;
    Ok(())
}

pub(crate) fn read_exact_at_current(file: &mut File, buf: &mut [u8]) -> SfResult<()> {
    file.read_exact(buf)
        .map_err(|_| SfError::BadHeader("truncated header".to_string()))
}

pub(crate) fn read_u16(file: &mut File, big: bool) -> SfResult<u16> {
    let mut buf = [0u8; 2];
    read_exact_at_current(file, &mut buf)?;
    Ok(if big {
        u16::from_be_bytes(buf)
    } else {
        u16::from_le_bytes(buf)
    })
}

pub(crate) fn read_u32(file: &mut File, big: bool) -> SfResult<u32> {
    let mut buf = [0u8; 4];
    read_exact_at_current(file, &mut buf)?;
    Ok(if big {
        u32::from_be_bytes(buf)
    } else {
        u32::from_le_bytes(buf)
    })
}

pub(crate) fn read_u64(file: &mut File, big: bool) -> SfResult<u64> {
    let mut buf = [0u8; 8];
    read_exact_at_current(file, &mut buf)?;
    Ok(if big {
        u64::from_be_bytes(buf)
    } else {
        u64::from_le_bytes(buf)
    })
}

fn closed() -> SfError {
    SfError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "soundfile is not open",
    ))
}

/// Case-insensitive extension match helper shared by the built-ins.
pub(crate) fn name_has_extension(name: &str, extensions: &[&str]) -> bool {
    let lower = name.to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

static FORMATS: Mutex<Vec<Arc<dyn SoundFileFormat>>> = Mutex::new(Vec::new());
static SETUP: Once = Once::new();

/// Register the built-in formats, once. Order defines sniff priority and
/// the default format.
pub fn setup_formats() {
    SETUP.call_once(|| {
        let mut formats = FORMATS.lock();
        formats.push(Arc::new(WaveFormat) as Arc<dyn SoundFileFormat>);
        formats.push(Arc::new(AiffFormat));
        formats.push(Arc::new(CafFormat));
        formats.push(Arc::new(NextFormat));
    });
}

/// Append a format implementation. Fails once the registry is full.
pub fn register_format(format: Arc<dyn SoundFileFormat>) -> SfResult<()> {
    setup_formats();
    let mut formats = FORMATS.lock();
    if formats.len() == MAX_FORMATS {
        log::error!("soundfile: max number of format implementations reached");
        return Err(SfError::Usage(
            "format registry is full".to_string(),
        ));
    }
    formats.push(format);
    Ok(())
}

/// Snapshot of the registered formats in priority order.
pub fn formats() -> Vec<Arc<dyn SoundFileFormat>> {
    setup_formats();
    FORMATS.lock().clone()
}

/// Look up a registered format by name. `nextstep` is accepted as an
/// alias for the NeXT/Sun format.
pub fn find_format(name: &str) -> Option<Arc<dyn SoundFileFormat>> {
    let name = if name == "nextstep" { "next" } else { name };
    formats().into_iter().find(|f| f.name() == name)
}

/// The read-only raw pass-through format, outside the registry.
pub fn raw_format() -> Arc<RawFormat> {
    static RAW: OnceLock<Arc<RawFormat>> = OnceLock::new();
    RAW.get_or_init(|| Arc::new(RawFormat)).clone()
}

/// Largest `min_header_size` among the registered formats; how much the
/// open routine reads before sniffing.
pub fn min_header_size() -> usize {
    formats()
        .iter()
        .map(|f| f.min_header_size())
        .max()
        .unwrap_or(0)
}

/// The `-name` flag list for usage strings, in registry order.
pub fn format_flags() -> String {
    formats()
        .iter()
        .map(|f| format!("-{}", f.name()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything the open routine needs besides the path.
#[derive(Clone)]
pub struct OpenRequest {
    /// Force this format instead of probing, when set.
    pub format: Option<Arc<dyn SoundFileFormat>>,
    /// Header handling; `Raw` uses the caller geometry below.
    pub header: HeaderSpec,
    /// Caller geometry, used only for raw opens.
    pub channels: usize,
    pub bytes_per_sample: usize,
    pub big_endian: bool,
    pub sample_rate: u32,
    /// Frames to skip past the header before the first read.
    pub onset_frames: usize,
}

impl Default for OpenRequest {
    fn default() -> OpenRequest {
        OpenRequest {
            format: None,
            header: HeaderSpec::Detect,
            channels: 1,
            bytes_per_sample: 2,
            big_endian: false,
            sample_rate: 0,
            onset_frames: 0,
        }
    }
}

/// Open a soundfile: detect (or assert) the format, parse the header,
/// seek past it and any onset frames, and charge the onset against the
/// byte limit. The handle is dropped on any failure.
pub fn open_soundfile(path: &Path, req: &OpenRequest) -> SfResult<SoundFile> {
    let mut sf = SoundFile::new();
    let name = path.display().to_string();
    let mut file = File::open(path)?;

    match req.header {
        HeaderSpec::Raw(size) => {
            // header detection overridden; caller supplies the geometry
            sf.set_geometry(req.channels, req.bytes_per_sample);
            sf.big_endian = req.big_endian;
            sf.sample_rate = req.sample_rate;
            sf.header_size = size;
            sf.format = Some(raw_format());
            sf.file = Some(file);
        }
        HeaderSpec::Detect => {
            let mut buf = vec![0u8; min_header_size()];
            let mut got = 0;
            while got < buf.len() {
                match file.read(&mut buf[got..])? {
                    0 => break,
                    n => got += n,
                }
            }
            let format = match &req.format {
                Some(format) => {
                    if !format.sniff(&buf[..got]) {
                        return Err(SfError::BadHeader(name));
                    }
                    format.clone()
                }
                None => formats()
                    .into_iter()
                    .find(|f| f.sniff(&buf[..got]))
                    .ok_or_else(|| SfError::BadHeader(name.clone()))?,
            };
            file.seek(SeekFrom::Start(0))?;
            sf.file = Some(file);
            sf.format = Some(format.clone());
            format.read_header(&mut sf)?;
        }
    }

    let format = match sf.format.clone() {
        Some(format) => format,
        None => return Err(SfError::BadHeader(name)),
    };
    format.seek_to_frame(&mut sf, req.onset_frames)?;
    sf.byte_limit = sf
        .byte_limit
        .saturating_sub(sf.bytes_per_frame * req.onset_frames);
    Ok(sf)
}

/// Complete `name` with the format's extension when it has none.
pub fn complete_filename(format: &dyn SoundFileFormat, name: &str) -> String {
    if format.has_extension(name) {
        name.to_string()
    } else {
        format!("{}.{}", name, format.default_extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_and_lookup() {
        let formats = formats();
        let names: Vec<&str> = formats.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["wave", "aiff", "caf", "next"]);
        assert!(find_format("aiff").is_some());
        assert!(find_format("nextstep").unwrap().name() == "next");
        assert!(find_format("flac").is_none());
    }

    #[test]
    fn test_min_header_size_covers_all() {
        let largest = min_header_size();
        for format in formats() {
            assert!(format.min_header_size() <= largest);
        }
    }

    #[test]
    fn test_format_flags_string() {
        assert_eq!(format_flags(), "-wave -aiff -caf -next");
    }

    #[test]
    fn test_complete_filename() {
        let wave = find_format("wave").unwrap();
        assert_eq!(complete_filename(&*wave, "take1"), "take1.wav");
        assert_eq!(complete_filename(&*wave, "take1.WAV"), "take1.WAV");
    }
}
