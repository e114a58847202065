//! NeXT/Sun (.snd/.au) format implementation.
//!
//! Either endianness: the `.snd` magic is stored big-endian; a file whose
//! magic reads byte-reversed carries little-endian header fields and
//! sample data. Layout:
//!
//! ```text
//! [4 bytes] magic ".snd"
//! [4 bytes] data location (byte offset of the first frame)
//! [4 bytes] data size, ~0 when unknown
//! [4 bytes] encoding: 3 = 16-bit, 4 = 24-bit, 6 = 32-bit float
//! [4 bytes] sample rate
//! [4 bytes] channels
//! [data location - 24 bytes] info string, null-padded
//! ```
//!
//! The default data location is 28, leaving four bytes of info string;
//! writing longer metadata re-emits the header with a larger onset, which
//! is only possible before the first sample lands.

use std::io::{Seek, SeekFrom};

use super::{name_has_extension, patch_bytes, read_u32, SoundFileFormat};
use crate::soundfile::{Endian, SfError, SfResult, SoundFile, MAX_CHANNELS};

const SND_MAGIC: &[u8; 4] = b".snd";
const SND_MAGIC_SWAPPED: &[u8; 4] = b"dns.";

const ENCODING_PCM16: u32 = 3;
const ENCODING_PCM24: u32 = 4;
const ENCODING_FLOAT: u32 = 6;

/// Data size field value meaning "unknown, read to end of file".
const SIZE_UNKNOWN: u32 = u32::MAX;

/// Fixed fields plus the default four-byte info string.
const DEFAULT_ONSET: usize = 28;

pub struct NextFormat;

impl SoundFileFormat for NextFormat {
    fn name(&self) -> &'static str {
        "next"
    }

    fn min_header_size(&self) -> usize {
        24
    }

    fn sniff(&self, buf: &[u8]) -> bool {
        buf.len() >= 24 && (&buf[0..4] == SND_MAGIC || &buf[0..4] == SND_MAGIC_SWAPPED)
    }

    fn read_header(&self, sf: &mut SoundFile) -> SfResult<()> {
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        super::read_exact_at_current(file, &mut magic)?;
        let big = match &magic {
            m if m == SND_MAGIC => true,
            m if m == SND_MAGIC_SWAPPED => false,
            _ => return Err(SfError::BadHeader("not a NeXT/Sun file".to_string())),
        };

        let onset = read_u32(file, big)? as u64;
        let data_size = read_u32(file, big)?;
        let encoding = read_u32(file, big)?;
        let sample_rate = read_u32(file, big)?;
        let channels = read_u32(file, big)? as usize;

        if onset < 24 {
            return Err(SfError::BadHeader("data location inside header".to_string()));
        }
        let bytes_per_sample = match encoding {
            ENCODING_PCM16 => 2,
            ENCODING_PCM24 => 3,
            ENCODING_FLOAT => 4,
            other => {
                return Err(SfError::UnsupportedSampleFormat(format!(
                    "NeXT encoding {}",
                    other
                )))
            }
        };
        if channels < 1 || channels > MAX_CHANNELS {
            return Err(SfError::BadHeader(format!("bad channel count {}", channels)));
        }

        sf.set_geometry(channels, bytes_per_sample);
        sf.sample_rate = sample_rate;
        sf.big_endian = big;
        sf.header_size = onset as usize;
        let on_disk = file_len.saturating_sub(onset);
        sf.byte_limit = if data_size == SIZE_UNKNOWN {
            on_disk as usize
        } else {
            (data_size as u64).min(on_disk) as usize
        };
        Ok(())
    }

    fn write_header(&self, sf: &mut SoundFile, nframes: usize) -> SfResult<usize> {
        let header = build_header(sf, nframes, &[0u8; 4]);
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        file.seek(SeekFrom::Start(0))?;
        std::io::Write::write_all(file, &header)?;
        sf.header_size = header.len();
        Ok(header.len())
    }

    fn update_header(&self, sf: &mut SoundFile, frames_written: usize) -> SfResult<()> {
        let data_size = sat_u32(frames_written * sf.bytes_per_frame);
        let big = sf.big_endian;
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let bytes = if big {
            data_size.to_be_bytes()
        } else {
            data_size.to_le_bytes()
        };
        patch_bytes(file, 8, &bytes)?;
        Ok(())
    }

    fn read_metadata(&self, sf: &mut SoundFile) -> SfResult<Vec<(String, String)>> {
        if sf.header_size <= 24 {
            return Ok(Vec::new());
        }
        let info_len = sf.header_size - 24;
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(24))?;
        let mut info = vec![0u8; info_len];
        super::read_exact_at_current(file, &mut info)?;
        file.seek(SeekFrom::Start(saved))?;
        while info.last() == Some(&0) {
            info.pop();
        }
        if info.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![(
            "info".to_string(),
            String::from_utf8_lossy(&info).to_string(),
        )])
    }

    fn write_metadata(&self, sf: &mut SoundFile, args: &[String]) -> SfResult<()> {
        if args.is_empty() {
            return Err(SfError::Usage("meta <text...>".to_string()));
        }
        let mut info = args.join(" ").into_bytes();
        info.push(0);
        while info.len() % 4 != 0 {
            info.push(0);
        }
        // re-emit the whole header with the larger onset, preserving the
        // declared data size; legal only while no sample data has been
        // written
        let big = sf.big_endian;
        let declared = {
            let file = sf.file.as_mut().ok_or_else(not_open)?;
            let saved = file.stream_position()?;
            file.seek(SeekFrom::Start(8))?;
            let n = read_u32(file, big)?;
            file.seek(SeekFrom::Start(saved))?;
            n
        };
        let mut header = build_header(sf, 0, &info);
        let size_bytes = if big {
            declared.to_be_bytes()
        } else {
            declared.to_le_bytes()
        };
        header[8..12].copy_from_slice(&size_bytes);
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        file.seek(SeekFrom::Start(0))?;
        std::io::Write::write_all(file, &header)?;
        sf.header_size = header.len();
        Ok(())
    }

    fn has_extension(&self, name: &str) -> bool {
        name_has_extension(name, &["snd", "au"])
    }

    fn default_extension(&self) -> &'static str {
        "snd"
    }

    fn endianness(&self, requested: Option<Endian>) -> Endian {
        requested.unwrap_or(Endian::Big)
    }
}

fn build_header(sf: &SoundFile, nframes: usize, info: &[u8]) -> Vec<u8> {
    let big = sf.big_endian;
    let onset = (24 + info.len()) as u32;
    let data_size = sat_u32(nframes * sf.bytes_per_frame);
    let encoding = match sf.bytes_per_sample {
        2 => ENCODING_PCM16,
        3 => ENCODING_PCM24,
        _ => ENCODING_FLOAT,
    };
    let word = |n: u32| if big { n.to_be_bytes() } else { n.to_le_bytes() };

    let mut header = Vec::with_capacity(24 + info.len());
    header.extend_from_slice(if big { SND_MAGIC } else { SND_MAGIC_SWAPPED });
    header.extend_from_slice(&word(onset));
    header.extend_from_slice(&word(data_size));
    header.extend_from_slice(&word(encoding));
    header.extend_from_slice(&word(sf.sample_rate));
    header.extend_from_slice(&word(sf.channels as u32));
    header.extend_from_slice(info);
    header
}

fn not_open() -> SfError {
    SfError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "soundfile is not open",
    ))
}

fn sat_u32(n: usize) -> u32 {
    n.min(u32::MAX as usize) as u32
}
