//! WAVE (RIFF) format implementation.
//!
//! Little-endian only. Layout:
//!
//! ```text
//! [4 bytes] "RIFF"
//! [4 bytes] file size - 8 (little-endian u32)
//! [4 bytes] "WAVE"
//! [4 bytes] "fmt "
//! [4 bytes] chunk size (16)
//! [2 bytes] format code: 1 = PCM, 3 = IEEE float
//! [2 bytes] channels
//! [4 bytes] sample rate
//! [4 bytes] bytes per second
//! [2 bytes] bytes per frame
//! [2 bytes] bits per sample
//! ("fact" chunk with the frame count, float files only)
//! [4 bytes] "data"
//! [4 bytes] payload size
//! ```
//!
//! Unknown chunks are skipped on read; chunk sizes are word-aligned with a
//! pad byte after odd lengths. Metadata rides in a `LIST`/`INFO` chunk of
//! key/value subchunks inserted between the header and the data chunk.

use std::io::{Read, Seek, SeekFrom};

use super::{
    name_has_extension, patch_bytes, read_u16, read_u32, SoundFileFormat,
};
use crate::soundfile::{Endian, SfError, SfResult, SoundFile, MAX_CHANNELS};

const RIFF_ID: &[u8; 4] = b"RIFF";
const WAVE_ID: &[u8; 4] = b"WAVE";
const FMT_ID: &[u8; 4] = b"fmt ";
const FACT_ID: &[u8; 4] = b"fact";
const DATA_ID: &[u8; 4] = b"data";
const LIST_ID: &[u8; 4] = b"LIST";
const INFO_ID: &[u8; 4] = b"INFO";

const FORMAT_PCM: u16 = 1;
const FORMAT_FLOAT: u16 = 3;

/// 12-byte RIFF preamble + fmt chunk.
const MIN_HEADER: usize = 12 + 8 + 16;

/// Patch offsets recorded while writing, consumed by `update_header` and
/// metadata insertion.
struct WaveState {
    /// Offset of the data chunk's size field.
    data_size_pos: u64,
    /// Offset of the fact chunk's frame count, float files only.
    fact_pos: Option<u64>,
}

pub struct WaveFormat;

impl SoundFileFormat for WaveFormat {
    fn name(&self) -> &'static str {
        "wave"
    }

    fn min_header_size(&self) -> usize {
        MIN_HEADER
    }

    fn sniff(&self, buf: &[u8]) -> bool {
        buf.len() >= 12 && &buf[0..4] == RIFF_ID && &buf[8..12] == WAVE_ID
    }

    fn read_header(&self, sf: &mut SoundFile) -> SfResult<()> {
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let file_len = file.metadata()?.len();

        let mut preamble = [0u8; 12];
        super::read_exact_at_current(file, &mut preamble)?;
        if &preamble[0..4] != RIFF_ID || &preamble[8..12] != WAVE_ID {
            return Err(SfError::BadHeader("not a RIFF WAVE file".to_string()));
        }

        let mut format_code = 0u16;
        let mut channels = 0usize;
        let mut sample_rate = 0u32;
        let mut bits = 0u16;
        let mut fmt_seen = false;

        loop {
            let mut id = [0u8; 4];
            if file.read_exact(&mut id).is_err() {
                return Err(SfError::BadHeader("no data chunk".to_string()));
            }
            let size = read_u32(file, false)? as u64;
            match &id {
                id if id == FMT_ID => {
                    if size < 16 {
                        return Err(SfError::BadHeader("format chunk too small".to_string()));
                    }
                    format_code = read_u16(file, false)?;
                    channels = read_u16(file, false)? as usize;
                    sample_rate = read_u32(file, false)?;
                    let _byte_rate = read_u32(file, false)?;
                    let _block_align = read_u16(file, false)?;
                    bits = read_u16(file, false)?;
                    if size > 16 {
                        file.seek(SeekFrom::Current(pad(size) as i64 - 16))?;
                    }
                    fmt_seen = true;
                }
                id if id == DATA_ID => {
                    if !fmt_seen {
                        return Err(SfError::BadHeader(
                            "data chunk before format chunk".to_string(),
                        ));
                    }
                    let data_start = file.stream_position()?;
                    let bytes_per_sample = match (format_code, bits) {
                        (FORMAT_PCM, 16) => 2,
                        (FORMAT_PCM, 24) => 3,
                        (FORMAT_FLOAT, 32) => 4,
                        _ => {
                            return Err(SfError::UnsupportedSampleFormat(format!(
                                "wave format {} with {} bits",
                                format_code, bits
                            )))
                        }
                    };
                    if channels < 1 || channels > MAX_CHANNELS {
                        return Err(SfError::BadHeader(format!(
                            "bad channel count {}",
                            channels
                        )));
                    }
                    sf.set_geometry(channels, bytes_per_sample);
                    sf.sample_rate = sample_rate;
                    sf.big_endian = false;
                    sf.header_size = data_start as usize;
                    // clamp the declared payload to what is actually on disk
                    let on_disk = file_len.saturating_sub(data_start);
                    sf.byte_limit = if size == u32::MAX as u64 {
                        on_disk as usize
                    } else {
                        size.min(on_disk) as usize
                    };
                    return Ok(());
                }
                _ => {
                    file.seek(SeekFrom::Current(pad(size) as i64))?;
                }
            }
        }
    }

    fn write_header(&self, sf: &mut SoundFile, nframes: usize) -> SfResult<usize> {
        let float = sf.bytes_per_sample == 4;
        let header_size = 12 + 24 + if float { 12 } else { 0 } + 8;
        let data_size = sat_u32(nframes * sf.bytes_per_frame);
        let riff_size = (header_size as u32 - 8).saturating_add(data_size);

        let mut header = Vec::with_capacity(header_size);
        header.extend_from_slice(RIFF_ID);
        header.extend_from_slice(&riff_size.to_le_bytes());
        header.extend_from_slice(WAVE_ID);
        header.extend_from_slice(FMT_ID);
        header.extend_from_slice(&16u32.to_le_bytes());
        let code = if float { FORMAT_FLOAT } else { FORMAT_PCM };
        header.extend_from_slice(&code.to_le_bytes());
        header.extend_from_slice(&(sf.channels as u16).to_le_bytes());
        header.extend_from_slice(&sf.sample_rate.to_le_bytes());
        let byte_rate = sf.sample_rate * sf.bytes_per_frame as u32;
        header.extend_from_slice(&byte_rate.to_le_bytes());
        header.extend_from_slice(&(sf.bytes_per_frame as u16).to_le_bytes());
        header.extend_from_slice(&((sf.bytes_per_sample * 8) as u16).to_le_bytes());
        let mut fact_pos = None;
        if float {
            header.extend_from_slice(FACT_ID);
            header.extend_from_slice(&4u32.to_le_bytes());
            fact_pos = Some(header.len() as u64);
            header.extend_from_slice(&sat_u32(nframes).to_le_bytes());
        }
        header.extend_from_slice(DATA_ID);
        header.extend_from_slice(&data_size.to_le_bytes());

        let file = sf.file.as_mut().ok_or_else(not_open)?;
        std::io::Write::write_all(file, &header)?;
        sf.header_size = header_size;
        sf.big_endian = false;
        sf.state = Some(Box::new(WaveState {
            data_size_pos: header_size as u64 - 4,
            fact_pos,
        }));
        Ok(header_size)
    }

    fn update_header(&self, sf: &mut SoundFile, frames_written: usize) -> SfResult<()> {
        let data_size = sat_u32(frames_written * sf.bytes_per_frame);
        let riff_size = (sf.header_size as u32 - 8).saturating_add(data_size);
        let (data_size_pos, fact_pos) = match state(sf) {
            Some(ws) => (ws.data_size_pos, ws.fact_pos),
            // canonical layout fallback: data chunk header ends the header
            None => (sf.header_size as u64 - 4, None),
        };
        let frames = sat_u32(frames_written);
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        patch_bytes(file, 4, &riff_size.to_le_bytes())?;
        if let Some(pos) = fact_pos {
            patch_bytes(file, pos, &frames.to_le_bytes())?;
        }
        patch_bytes(file, data_size_pos, &data_size.to_le_bytes())?;
        Ok(())
    }

    fn read_metadata(&self, sf: &mut SoundFile) -> SfResult<Vec<(String, String)>> {
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(12))?;
        let mut pairs = Vec::new();
        loop {
            let mut id = [0u8; 4];
            if file.read_exact(&mut id).is_err() {
                break;
            }
            let size = read_u32(file, false)? as u64;
            if &id == DATA_ID {
                break;
            }
            if &id == LIST_ID && size >= 4 {
                let chunk_end = file.stream_position()? + pad(size);
                let mut kind = [0u8; 4];
                super::read_exact_at_current(file, &mut kind)?;
                if &kind == INFO_ID {
                    let mut left = size - 4;
                    while left >= 8 {
                        let mut key = [0u8; 4];
                        super::read_exact_at_current(file, &mut key)?;
                        let len = read_u32(file, false)? as u64;
                        let mut value = vec![0u8; pad(len) as usize];
                        super::read_exact_at_current(file, &mut value)?;
                        value.truncate(len as usize);
                        while value.last() == Some(&0) {
                            value.pop();
                        }
                        pairs.push((
                            String::from_utf8_lossy(&key).trim_end().to_string(),
                            String::from_utf8_lossy(&value).to_string(),
                        ));
                        left = left.saturating_sub(8 + pad(len));
                    }
                }
                file.seek(SeekFrom::Start(chunk_end))?;
            } else {
                file.seek(SeekFrom::Current(pad(size) as i64))?;
            }
        }
        file.seek(SeekFrom::Start(saved))?;
        Ok(pairs)
    }

    fn write_metadata(&self, sf: &mut SoundFile, args: &[String]) -> SfResult<()> {
        if args.is_empty() {
            return Err(SfError::Usage("meta <key> <value...>".to_string()));
        }
        let mut key = [b' '; 4];
        for (i, b) in args[0].bytes().take(4).enumerate() {
            key[i] = b;
        }
        let value = args[1..].join(" ").into_bytes();
        let value_padded = pad(value.len() as u64) as usize;

        // build LIST/INFO with one subchunk
        let mut chunk = Vec::new();
        chunk.extend_from_slice(LIST_ID);
        chunk.extend_from_slice(&((4 + 8 + value_padded) as u32).to_le_bytes());
        chunk.extend_from_slice(INFO_ID);
        chunk.extend_from_slice(&key);
        chunk.extend_from_slice(&(value.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&value);
        chunk.resize(8 + 4 + 8 + value_padded, 0);

        // splice before the data chunk header, then re-emit it after; only
        // legal before the first sample lands
        let data_header_pos = sf.header_size as u64 - 8;
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let mut data_header = [0u8; 8];
        file.seek(SeekFrom::Start(data_header_pos))?;
        super::read_exact_at_current(file, &mut data_header)?;
        file.seek(SeekFrom::Start(data_header_pos))?;
        std::io::Write::write_all(file, &chunk)?;
        std::io::Write::write_all(file, &data_header)?;

        sf.header_size += chunk.len();
        if let Some(ws) = state_mut(sf) {
            ws.data_size_pos += chunk.len() as u64;
        }
        Ok(())
    }

    fn has_extension(&self, name: &str) -> bool {
        name_has_extension(name, &["wav", "wave"])
    }

    fn default_extension(&self) -> &'static str {
        "wav"
    }

    fn endianness(&self, _requested: Option<Endian>) -> Endian {
        Endian::Little
    }
}

fn not_open() -> SfError {
    SfError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "soundfile is not open",
    ))
}

fn pad(size: u64) -> u64 {
    size + (size % 2)
}

fn sat_u32(n: usize) -> u32 {
    n.min(u32::MAX as usize) as u32
}

fn state(sf: &SoundFile) -> Option<&WaveState> {
    sf.state.as_deref().and_then(|s| s.as_any().downcast_ref())
}

fn state_mut(sf: &mut SoundFile) -> Option<&mut WaveState> {
    sf.state
        .as_deref_mut()
        .and_then(|s| s.as_any_mut().downcast_mut())
}
