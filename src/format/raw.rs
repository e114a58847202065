//! Headerless pass-through format.
//!
//! Never registered and never sniffed: only reachable when the caller
//! supplies the geometry explicitly (`-raw` on the batch surface, a
//! positive or `-1` header size on the streaming surface). Reads the
//! payload as-is; read-only.

use super::SoundFileFormat;
use crate::soundfile::{Endian, SfError, SfResult, SoundFile};

pub struct RawFormat;

impl SoundFileFormat for RawFormat {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn min_header_size(&self) -> usize {
        0
    }

    fn sniff(&self, _buf: &[u8]) -> bool {
        false
    }

    fn read_header(&self, _sf: &mut SoundFile) -> SfResult<()> {
        // nothing to parse; the caller installed the geometry already
        Ok(())
    }

    fn write_header(&self, _sf: &mut SoundFile, _nframes: usize) -> SfResult<usize> {
        Err(SfError::Usage("raw files are read-only".to_string()))
    }

    fn update_header(&self, _sf: &mut SoundFile, _frames_written: usize) -> SfResult<()> {
        Ok(())
    }

    fn has_extension(&self, _name: &str) -> bool {
        false
    }

    fn default_extension(&self) -> &'static str {
        ""
    }

    fn endianness(&self, requested: Option<Endian>) -> Endian {
        requested.unwrap_or_else(Endian::native)
    }
}
