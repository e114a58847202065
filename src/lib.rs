//! Soundfile I/O core for a realtime audio environment.
//!
//! Three layers, mirroring the classic soundfile-library split:
//!
//! - A format-pluggable access layer ([`format`], [`soundfile`], [`codec`])
//!   reading and writing uncompressed PCM (16/24-bit int, 32-bit float)
//!   wrapped in WAVE, AIFF/AIFC, CAF, or NeXT/Sun containers, plus a raw
//!   pass-through.
//! - A synchronous batch engine ([`filer`]) moving frames between disk and
//!   host-owned float arrays ([`table`]), with normalization, resizing,
//!   onset skip and metadata passthrough. Blocking; not for realtime use.
//! - A streaming engine ([`stream`]) pairing a bounded byte FIFO with a
//!   dedicated I/O worker per object, so a hard-deadline audio callback
//!   never waits on disk.
//!
//! The surrounding environment (path search, running sample rate) is
//! reached through [`env::AudioEnv`].

pub mod cli;
pub mod codec;
pub mod env;
pub mod filer;
pub mod format;
pub mod soundfile;
pub mod stream;
pub mod table;

pub use cli::Cli;
pub use env::{AudioEnv, DirEnv};
pub use filer::{ReadOutcome, WriteOutcome};
pub use format::{open_soundfile, OpenRequest, SoundFileFormat};
pub use soundfile::{Endian, HeaderSpec, SfError, SfInfo, SfResult, SoundFile};
pub use stream::{StreamReader, StreamWriter};
pub use table::{Table, TableSet};
