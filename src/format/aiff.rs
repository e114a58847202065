//! AIFF / AIFF-C format implementation.
//!
//! Big-endian only. Layout:
//!
//! ```text
//! [4 bytes] "FORM"
//! [4 bytes] file size - 8 (big-endian u32)
//! [4 bytes] "AIFF" or "AIFC"
//! [4 bytes] "COMM"
//! [4 bytes] chunk size (18, or 22+ for AIFC)
//! [2 bytes] channels
//! [4 bytes] sample frames
//! [2 bytes] bits per sample
//! [10 bytes] sample rate, IEEE 754 80-bit extended
//! (AIFC: [4 bytes] compression id + pascal-string name)
//! [4 bytes] "SSND"
//! [4 bytes] chunk size (payload + 8)
//! [4 bytes] payload offset
//! [4 bytes] block size
//! ```
//!
//! PCM 16/24 bit files are written as classic AIFF; float files as AIFC
//! with the `fl32` compression id (and the mandatory FVER chunk). Only
//! uncompressed subformats are accepted on read. Metadata rides in `ANNO`
//! chunks inserted before the sound data.

use std::io::{Read, Seek, SeekFrom};

use super::{name_has_extension, patch_bytes, read_u16, read_u32, SoundFileFormat};
use crate::soundfile::{Endian, SfError, SfResult, SoundFile, MAX_CHANNELS};

const FORM_ID: &[u8; 4] = b"FORM";
const AIFF_ID: &[u8; 4] = b"AIFF";
const AIFC_ID: &[u8; 4] = b"AIFC";
const COMM_ID: &[u8; 4] = b"COMM";
const SSND_ID: &[u8; 4] = b"SSND";
const FVER_ID: &[u8; 4] = b"FVER";
const ANNO_ID: &[u8; 4] = b"ANNO";

const COMP_NONE: &[u8; 4] = b"NONE";
const COMP_FL32: &[u8; 4] = b"fl32";
const COMP_FL32_UPPER: &[u8; 4] = b"FL32";

/// AIFC version 1 timestamp for the FVER chunk.
const AIFC_VERSION: u32 = 0xA280_5140;

/// FORM preamble + COMM chunk.
const MIN_HEADER: usize = 12 + 8 + 18;

struct AiffState {
    comm_frames_pos: u64,
    ssnd_size_pos: u64,
}

pub struct AiffFormat;

impl SoundFileFormat for AiffFormat {
    fn name(&self) -> &'static str {
        "aiff"
    }

    fn min_header_size(&self) -> usize {
        MIN_HEADER
    }

    fn sniff(&self, buf: &[u8]) -> bool {
        buf.len() >= 12
            && &buf[0..4] == FORM_ID
            && (&buf[8..12] == AIFF_ID || &buf[8..12] == AIFC_ID)
    }

    fn read_header(&self, sf: &mut SoundFile) -> SfResult<()> {
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let file_len = file.metadata()?.len();

        let mut preamble = [0u8; 12];
        super::read_exact_at_current(file, &mut preamble)?;
        if &preamble[0..4] != FORM_ID {
            return Err(SfError::BadHeader("not a FORM file".to_string()));
        }
        let aifc = match &preamble[8..12] {
            b if b == AIFF_ID => false,
            b if b == AIFC_ID => true,
            _ => return Err(SfError::BadHeader("not an AIFF form".to_string())),
        };

        let mut channels = 0usize;
        let mut bits = 0u16;
        let mut rate = 0.0f64;
        let mut float_samples = false;
        let mut comm_seen = false;

        loop {
            let mut id = [0u8; 4];
            if file.read_exact(&mut id).is_err() {
                return Err(SfError::BadHeader("no sound data chunk".to_string()));
            }
            let size = read_u32(file, true)? as u64;
            match &id {
                id if id == COMM_ID => {
                    if size < 18 {
                        return Err(SfError::BadHeader("COMM chunk too small".to_string()));
                    }
                    channels = read_u16(file, true)? as usize;
                    let _nframes = read_u32(file, true)?;
                    bits = read_u16(file, true)?;
                    let mut f80 = [0u8; 10];
                    super::read_exact_at_current(file, &mut f80)?;
                    rate = decode_f80(&f80);
                    let mut consumed = 18u64;
                    if aifc && size >= 22 {
                        let mut comp = [0u8; 4];
                        super::read_exact_at_current(file, &mut comp)?;
                        consumed += 4;
                        match &comp {
                            c if c == COMP_NONE => {}
                            c if c == COMP_FL32 || c == COMP_FL32_UPPER => {
                                float_samples = true
                            }
                            _ => {
                                return Err(SfError::UnsupportedSampleFormat(format!(
                                    "AIFC compression {:?}",
                                    String::from_utf8_lossy(&comp)
                                )))
                            }
                        }
                    }
                    file.seek(SeekFrom::Current(pad(size) as i64 - consumed as i64))?;
                    comm_seen = true;
                }
                id if id == SSND_ID => {
                    if !comm_seen {
                        return Err(SfError::BadHeader(
                            "sound data before COMM chunk".to_string(),
                        ));
                    }
                    let offset = read_u32(file, true)? as u64;
                    let _block_size = read_u32(file, true)?;
                    if offset > 0 {
                        file.seek(SeekFrom::Current(offset as i64))?;
                    }
                    let data_start = file.stream_position()?;
                    let bytes_per_sample = match (bits, float_samples) {
                        (16, false) => 2,
                        (24, false) => 3,
                        (32, true) => 4,
                        _ => {
                            return Err(SfError::UnsupportedSampleFormat(format!(
                                "AIFF {} bit{}",
                                bits,
                                if float_samples { " float" } else { "" }
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
                    sf.sample_rate = rate.round() as u32;
                    sf.big_endian = true;
                    sf.header_size = data_start as usize;
                    let declared = size.saturating_sub(8 + offset);
                    let on_disk = file_len.saturating_sub(data_start);
                    sf.byte_limit = declared.min(on_disk) as usize;
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
        let data_size = sat_u32(nframes * sf.bytes_per_frame);

        let mut header: Vec<u8> = Vec::new();
        header.extend_from_slice(FORM_ID);
        header.extend_from_slice(&0u32.to_be_bytes()); // patched below
        header.extend_from_slice(if float { AIFC_ID } else { AIFF_ID });
        if float {
            header.extend_from_slice(FVER_ID);
            header.extend_from_slice(&4u32.to_be_bytes());
            header.extend_from_slice(&AIFC_VERSION.to_be_bytes());
        }
        header.extend_from_slice(COMM_ID);
        let comm_size: u32 = if float { 18 + 4 + 2 } else { 18 };
        header.extend_from_slice(&comm_size.to_be_bytes());
        header.extend_from_slice(&(sf.channels as u16).to_be_bytes());
        let comm_frames_pos = header.len() as u64;
        header.extend_from_slice(&sat_u32(nframes).to_be_bytes());
        header.extend_from_slice(&((sf.bytes_per_sample * 8) as u16).to_be_bytes());
        header.extend_from_slice(&encode_f80(sf.sample_rate as f64));
        if float {
            header.extend_from_slice(COMP_FL32);
            header.extend_from_slice(&[0, 0]); // empty pascal string, padded
        }
        header.extend_from_slice(SSND_ID);
        let ssnd_size_pos = header.len() as u64;
        header.extend_from_slice(&(data_size.saturating_add(8)).to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes()); // offset
        header.extend_from_slice(&0u32.to_be_bytes()); // block size

        let header_size = header.len();
        let form_size = (header_size as u32 - 8).saturating_add(data_size);
        header[4..8].copy_from_slice(&form_size.to_be_bytes());

        let file = sf.file.as_mut().ok_or_else(not_open)?;
        std::io::Write::write_all(file, &header)?;
        sf.header_size = header_size;
        sf.big_endian = true;
        sf.state = Some(Box::new(AiffState {
            comm_frames_pos,
            ssnd_size_pos,
        }));
        Ok(header_size)
    }

    fn update_header(&self, sf: &mut SoundFile, frames_written: usize) -> SfResult<()> {
        let data_size = sat_u32(frames_written * sf.bytes_per_frame);
        let form_size = (sf.header_size as u32 - 8).saturating_add(data_size);
        let (comm_frames_pos, ssnd_size_pos) = match state(sf) {
            Some(st) => (st.comm_frames_pos, st.ssnd_size_pos),
            None => return Ok(()), // nothing recorded; file was opened for read
        };
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        patch_bytes(file, 4, &form_size.to_be_bytes())?;
        patch_bytes(file, comm_frames_pos, &sat_u32(frames_written).to_be_bytes())?;
        patch_bytes(file, ssnd_size_pos, &data_size.saturating_add(8).to_be_bytes())?;
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
            let size = read_u32(file, true)? as u64;
            if &id == SSND_ID {
                break;
            }
            if &id == ANNO_ID {
                let mut text = vec![0u8; pad(size) as usize];
                super::read_exact_at_current(file, &mut text)?;
                text.truncate(size as usize);
                while text.last() == Some(&0) {
                    text.pop();
                }
                pairs.push(("anno".to_string(), String::from_utf8_lossy(&text).to_string()));
            } else {
                file.seek(SeekFrom::Current(pad(size) as i64))?;
            }
        }
        file.seek(SeekFrom::Start(saved))?;
        Ok(pairs)
    }

    fn write_metadata(&self, sf: &mut SoundFile, args: &[String]) -> SfResult<()> {
        if args.is_empty() {
            return Err(SfError::Usage("meta <text...>".to_string()));
        }
        let text = args.join(" ").into_bytes();
        let mut chunk = Vec::with_capacity(8 + pad(text.len() as u64) as usize);
        chunk.extend_from_slice(ANNO_ID);
        chunk.extend_from_slice(&(text.len() as u32).to_be_bytes());
        chunk.extend_from_slice(&text);
        if chunk.len() % 2 == 1 {
            chunk.push(0);
        }

        // splice before the SSND header (16 bytes at the end of the header
        // region), then re-emit it after
        let ssnd_pos = sf.header_size as u64 - 16;
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let mut ssnd_header = [0u8; 16];
        file.seek(SeekFrom::Start(ssnd_pos))?;
        super::read_exact_at_current(file, &mut ssnd_header)?;
        file.seek(SeekFrom::Start(ssnd_pos))?;
        std::io::Write::write_all(file, &chunk)?;
        std::io::Write::write_all(file, &ssnd_header)?;

        sf.header_size += chunk.len();
        if let Some(st) = state_mut(sf) {
            st.ssnd_size_pos += chunk.len() as u64;
        }
        Ok(())
    }

    fn has_extension(&self, name: &str) -> bool {
        name_has_extension(name, &["aif", "aiff", "aifc"])
    }

    fn default_extension(&self) -> &'static str {
        "aif"
    }

    fn endianness(&self, _requested: Option<Endian>) -> Endian {
        Endian::Big
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

fn state(sf: &SoundFile) -> Option<&AiffState> {
    sf.state.as_deref().and_then(|s| s.as_any().downcast_ref())
}

fn state_mut(sf: &mut SoundFile) -> Option<&mut AiffState> {
    sf.state
        .as_deref_mut()
        .and_then(|s| s.as_any_mut().downcast_mut())
}

/// Encode a sample rate as an IEEE 754 80-bit extended float.
fn encode_f80(rate: f64) -> [u8; 10] {
    let mut out = [0u8; 10];
    if rate <= 0.0 {
        return out;
    }
    let exponent = rate.log2().floor() as i32;
    let mantissa = (rate / (2.0f64).powi(exponent) * (2.0f64).powi(63)) as u64;
    let biased = (16383 + exponent) as u16;
    out[0..2].copy_from_slice(&biased.to_be_bytes());
    out[2..10].copy_from_slice(&mantissa.to_be_bytes());
    out
}

/// Decode an IEEE 754 80-bit extended float sample rate.
fn decode_f80(bytes: &[u8; 10]) -> f64 {
    let biased = u16::from_be_bytes([bytes[0] & 0x7f, bytes[1]]) as i32;
    let mantissa = u64::from_be_bytes(bytes[2..10].try_into().expect("8 bytes"));
    if biased == 0 && mantissa == 0 {
        return 0.0;
    }
    let value = mantissa as f64 * (2.0f64).powi(biased - 16383 - 63);
    if bytes[0] & 0x80 != 0 {
        -value
    } else {
        value
    }
}
