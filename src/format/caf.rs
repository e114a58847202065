//! Core Audio Format implementation.
//!
//! Chunk scaffolding is always big-endian; sample data may be either, per
//! the LPCM little-endian flag. Layout:
//!
//! ```text
//! [4 bytes] "caff"
//! [2 bytes] version (1)
//! [2 bytes] flags (0)
//! per chunk:
//!   [4 bytes] chunk type
//!   [8 bytes] chunk size (big-endian i64)
//! "desc" chunk (32 bytes):
//!   [8 bytes] sample rate, IEEE 754 double
//!   [4 bytes] format id "lpcm"
//!   [4 bytes] format flags: 1 = float, 2 = little-endian
//!   [4 bytes] bytes per packet
//!   [4 bytes] frames per packet (1 for LPCM)
//!   [4 bytes] channels per frame
//!   [4 bytes] bits per channel
//! "data" chunk: [4 bytes] edit count, then payload; size -1 = unknown
//! ```
//!
//! Metadata rides in an `info` chunk of null-terminated key/value string
//! pairs inserted before the data chunk.

use std::io::{Read, Seek, SeekFrom};

use super::{name_has_extension, patch_bytes, read_u32, read_u64, SoundFileFormat};
use crate::soundfile::{Endian, SfError, SfResult, SoundFile, MAX_CHANNELS};

const CAFF_ID: &[u8; 4] = b"caff";
const DESC_ID: &[u8; 4] = b"desc";
const DATA_ID: &[u8; 4] = b"data";
const INFO_ID: &[u8; 4] = b"info";
const LPCM_ID: &[u8; 4] = b"lpcm";

const CAF_VERSION: u16 = 1;

const FLAG_FLOAT: u32 = 1;
const FLAG_LITTLE: u32 = 2;

/// File header + desc chunk.
const MIN_HEADER: usize = 8 + 12 + 32;

struct CafState {
    data_size_pos: u64,
}

pub struct CafFormat;

impl SoundFileFormat for CafFormat {
    fn name(&self) -> &'static str {
        "caf"
    }

    fn min_header_size(&self) -> usize {
        MIN_HEADER
    }

    fn sniff(&self, buf: &[u8]) -> bool {
        buf.len() >= 8
            && &buf[0..4] == CAFF_ID
            && u16::from_be_bytes([buf[4], buf[5]]) == CAF_VERSION
    }

    fn read_header(&self, sf: &mut SoundFile) -> SfResult<()> {
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let file_len = file.metadata()?.len();

        let mut preamble = [0u8; 8];
        super::read_exact_at_current(file, &mut preamble)?;
        if &preamble[0..4] != CAFF_ID {
            return Err(SfError::BadHeader("not a CAF file".to_string()));
        }

        let mut channels = 0usize;
        let mut bits = 0u32;
        let mut rate = 0.0f64;
        let mut flags = 0u32;
        let mut desc_seen = false;

        loop {
            let mut id = [0u8; 4];
            if file.read_exact(&mut id).is_err() {
                return Err(SfError::BadHeader("no data chunk".to_string()));
            }
            let size = read_u64(file, true)? as i64;
            match &id {
                id if id == DESC_ID => {
                    if size < 32 {
                        return Err(SfError::BadHeader("desc chunk too small".to_string()));
                    }
                    let mut rate_bytes = [0u8; 8];
                    super::read_exact_at_current(file, &mut rate_bytes)?;
                    rate = f64::from_bits(u64::from_be_bytes(rate_bytes));
                    let mut format_id = [0u8; 4];
                    super::read_exact_at_current(file, &mut format_id)?;
                    if &format_id != LPCM_ID {
                        return Err(SfError::UnsupportedSampleFormat(format!(
                            "CAF format {:?}",
                            String::from_utf8_lossy(&format_id)
                        )));
                    }
                    flags = read_u32(file, true)?;
                    let _bytes_per_packet = read_u32(file, true)?;
                    let _frames_per_packet = read_u32(file, true)?;
                    channels = read_u32(file, true)? as usize;
                    bits = read_u32(file, true)?;
                    if size > 32 {
                        file.seek(SeekFrom::Current(size - 32))?;
                    }
                    desc_seen = true;
                }
                id if id == DATA_ID => {
                    if !desc_seen {
                        return Err(SfError::BadHeader(
                            "data chunk before desc chunk".to_string(),
                        ));
                    }
                    let _edit_count = read_u32(file, true)?;
                    let data_start = file.stream_position()?;
                    let float = flags & FLAG_FLOAT != 0;
                    let bytes_per_sample = match (bits, float) {
                        (16, false) => 2,
                        (24, false) => 3,
                        (32, true) => 4,
                        _ => {
                            return Err(SfError::UnsupportedSampleFormat(format!(
                                "CAF {} bit{}",
                                bits,
                                if float { " float" } else { "" }
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
                    sf.big_endian = flags & FLAG_LITTLE == 0;
                    sf.header_size = data_start as usize;
                    let on_disk = file_len.saturating_sub(data_start);
                    sf.byte_limit = if size < 0 {
                        on_disk as usize
                    } else {
                        ((size as u64).saturating_sub(4)).min(on_disk) as usize
                    };
                    return Ok(());
                }
                _ => {
                    if size < 0 {
                        return Err(SfError::BadHeader("bad chunk size".to_string()));
                    }
                    file.seek(SeekFrom::Current(size))?;
                }
            }
        }
    }

    fn write_header(&self, sf: &mut SoundFile, nframes: usize) -> SfResult<usize> {
        let float = sf.bytes_per_sample == 4;
        let mut flags = 0u32;
        if float {
            flags |= FLAG_FLOAT;
        }
        if !sf.big_endian {
            flags |= FLAG_LITTLE;
        }

        let mut header: Vec<u8> = Vec::new();
        header.extend_from_slice(CAFF_ID);
        header.extend_from_slice(&CAF_VERSION.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(DESC_ID);
        header.extend_from_slice(&32i64.to_be_bytes());
        header.extend_from_slice(&(sf.sample_rate as f64).to_bits().to_be_bytes());
        header.extend_from_slice(LPCM_ID);
        header.extend_from_slice(&flags.to_be_bytes());
        header.extend_from_slice(&(sf.bytes_per_frame as u32).to_be_bytes());
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&(sf.channels as u32).to_be_bytes());
        header.extend_from_slice(&((sf.bytes_per_sample * 8) as u32).to_be_bytes());
        header.extend_from_slice(DATA_ID);
        let data_size_pos = header.len() as u64;
        let data_size = 4i64 + (nframes * sf.bytes_per_frame) as i64;
        header.extend_from_slice(&data_size.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes()); // edit count

        let header_size = header.len();
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        std::io::Write::write_all(file, &header)?;
        sf.header_size = header_size;
        sf.state = Some(Box::new(CafState { data_size_pos }));
        Ok(header_size)
    }

    fn update_header(&self, sf: &mut SoundFile, frames_written: usize) -> SfResult<()> {
        let data_size = 4i64 + (frames_written * sf.bytes_per_frame) as i64;
        let data_size_pos = match state(sf) {
            Some(st) => st.data_size_pos,
            None => sf.header_size as u64 - 12,
        };
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        patch_bytes(file, data_size_pos, &data_size.to_be_bytes())?;
        Ok(())
    }

    fn read_metadata(&self, sf: &mut SoundFile) -> SfResult<Vec<(String, String)>> {
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(8))?;
        let mut pairs = Vec::new();
        loop {
            let mut id = [0u8; 4];
            if file.read_exact(&mut id).is_err() {
                break;
            }
            let size = read_u64(file, true)? as i64;
            if &id == DATA_ID || size < 0 {
                break;
            }
            if &id == INFO_ID && size >= 4 {
                let mut body = vec![0u8; size as usize];
                super::read_exact_at_current(file, &mut body)?;
                let entries = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let mut strings = body[4..]
                    .split(|&b| b == 0)
                    .map(|s| String::from_utf8_lossy(s).to_string());
                for _ in 0..entries {
                    let key = match strings.next() {
                        Some(k) => k,
                        None => break,
                    };
                    let value = strings.next().unwrap_or_default();
                    pairs.push((key, value));
                }
            } else {
                file.seek(SeekFrom::Current(size))?;
            }
        }
        file.seek(SeekFrom::Start(saved))?;
        Ok(pairs)
    }

    fn write_metadata(&self, sf: &mut SoundFile, args: &[String]) -> SfResult<()> {
        if args.len() < 2 {
            return Err(SfError::Usage("meta <key> <value...>".to_string()));
        }
        let mut body: Vec<u8> = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(args[0].as_bytes());
        body.push(0);
        body.extend_from_slice(args[1..].join(" ").as_bytes());
        body.push(0);

        let mut chunk: Vec<u8> = Vec::with_capacity(12 + body.len());
        chunk.extend_from_slice(INFO_ID);
        chunk.extend_from_slice(&(body.len() as i64).to_be_bytes());
        chunk.extend_from_slice(&body);

        // splice before the data chunk header (12-byte header + 4-byte edit
        // count at the end of the header region)
        let data_pos = sf.header_size as u64 - 16;
        let file = sf.file.as_mut().ok_or_else(not_open)?;
        let mut data_header = [0u8; 16];
        file.seek(SeekFrom::Start(data_pos))?;
        super::read_exact_at_current(file, &mut data_header)?;
        file.seek(SeekFrom::Start(data_pos))?;
        std::io::Write::write_all(file, &chunk)?;
        std::io::Write::write_all(file, &data_header)?;

        sf.header_size += chunk.len();
        if let Some(st) = state_mut(sf) {
            st.data_size_pos += chunk.len() as u64;
        }
        Ok(())
    }

    fn has_extension(&self, name: &str) -> bool {
        name_has_extension(name, &["caf"])
    }

    fn default_extension(&self) -> &'static str {
        "caf"
    }

    fn endianness(&self, requested: Option<Endian>) -> Endian {
        requested.unwrap_or(Endian::Big)
    }
}

fn not_open() -> SfError {
    SfError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "soundfile is not open",
    ))
}

fn state(sf: &SoundFile) -> Option<&CafState> {
    sf.state.as_deref().and_then(|s| s.as_any().downcast_ref())
}

fn state_mut(sf: &mut SoundFile) -> Option<&mut CafState> {
    sf.state
        .as_deref_mut()
        .and_then(|s| s.as_any_mut().downcast_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reopen(tmp: &tempfile::NamedTempFile) -> std::fs::File {
        std::fs::File::options()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap()
    }

    #[test]
    fn test_sniff() {
        assert!(CafFormat.sniff(b"caff\x00\x01\x00\x00"));
        assert!(!CafFormat.sniff(b"caff\x00\x02\x00\x00"));
        assert!(!CafFormat.sniff(b"RIFF\x00\x01\x00\x00"));
    }

    #[test]
    fn test_write_then_read_roundtrip_little() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut sf = SoundFile::new();
        sf.file = Some(reopen(&tmp));
        sf.set_geometry(2, 2);
        sf.sample_rate = 44100;
        sf.big_endian = false;
        let size = CafFormat.write_header(&mut sf, 8).unwrap();
        assert_eq!(size, 8 + 12 + 32 + 12 + 4);
        std::io::Write::write_all(sf.file.as_mut().unwrap(), &vec![0u8; 32]).unwrap();

        let mut back = SoundFile::new();
        back.file = Some(reopen(&tmp));
        CafFormat.read_header(&mut back).unwrap();
        assert_eq!(back.channels, 2);
        assert_eq!(back.bytes_per_sample, 2);
        assert_eq!(back.sample_rate, 44100);
        assert!(!back.big_endian);
        assert_eq!(back.byte_limit, 32);
    }

    #[test]
    fn test_unknown_data_size_reads_to_eof() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut sf = SoundFile::new();
        sf.file = Some(reopen(&tmp));
        sf.set_geometry(1, 4);
        sf.sample_rate = 48000;
        sf.big_endian = true;
        CafFormat.write_header(&mut sf, 0).unwrap();
        // unknown length marker, as a streaming writer would leave it
        let pos = state(&sf).unwrap().data_size_pos;
        patch_bytes(sf.file.as_mut().unwrap(), pos, &(-1i64).to_be_bytes()).unwrap();
        std::io::Write::write_all(sf.file.as_mut().unwrap(), &vec![0u8; 40]).unwrap();

        let mut back = SoundFile::new();
        back.file = Some(reopen(&tmp));
        CafFormat.read_header(&mut back).unwrap();
        assert_eq!(back.bytes_per_sample, 4);
        assert!(back.big_endian);
        assert_eq!(back.byte_limit, 40);
    }

    #[test]
    fn test_update_header_patches_size() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut sf = SoundFile::new();
        sf.file = Some(reopen(&tmp));
        sf.set_geometry(2, 3);
        sf.sample_rate = 96000;
        sf.big_endian = true;
        CafFormat.write_header(&mut sf, 0).unwrap();
        std::io::Write::write_all(sf.file.as_mut().unwrap(), &vec![0u8; 36]).unwrap();
        CafFormat.update_header(&mut sf, 6).unwrap();

        let mut back = SoundFile::new();
        back.file = Some(reopen(&tmp));
        CafFormat.read_header(&mut back).unwrap();
        assert_eq!(back.byte_limit, 36);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut sf = SoundFile::new();
        sf.file = Some(reopen(&tmp));
        sf.set_geometry(1, 2);
        sf.sample_rate = 44100;
        sf.big_endian = true;
        CafFormat.write_header(&mut sf, 2).unwrap();
        CafFormat
            .write_metadata(&mut sf, &["artist".into(), "test".into()])
            .unwrap();
        std::io::Write::write_all(sf.file.as_mut().unwrap(), &[0u8; 4]).unwrap();
        CafFormat.update_header(&mut sf, 2).unwrap();

        let mut back = SoundFile::new();
        back.file = Some(reopen(&tmp));
        CafFormat.read_header(&mut back).unwrap();
        assert_eq!(back.byte_limit, 4);
        let meta = CafFormat.read_metadata(&mut back).unwrap();
        assert_eq!(meta, vec![("artist".to_string(), "test".to_string())]);
    }

    #[test]
    fn test_rejects_non_lpcm() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut bytes: Vec<u8> = Vec::new();
        bytes.extend_from_slice(b"caff");
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(b"desc");
        bytes.extend_from_slice(&32i64.to_be_bytes());
        bytes.extend_from_slice(&44100f64.to_bits().to_be_bytes());
        bytes.extend_from_slice(b"aac "); // compressed
        bytes.extend_from_slice(&[0u8; 20]);
        std::fs::write(tmp.path(), &bytes).unwrap();

        let mut sf = SoundFile::new();
        sf.file = Some(reopen(&tmp));
        assert!(matches!(
            CafFormat.read_header(&mut sf),
            Err(SfError::UnsupportedSampleFormat(_))
        ));
    }
}
