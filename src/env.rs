//! Host environment seam.
//!
//! The surrounding audio environment owns the search path for relative
//! filenames and knows the running sample rate. The library reaches it
//! through [`AudioEnv`] so the core never touches global process state.
//!
//! Implementations must be safe to call concurrently: the streaming worker
//! resolves paths off the audio thread while control messages may arrive
//! on another.

use std::path::{Path, PathBuf};

/// Services provided by the host environment.
pub trait AudioEnv: Send + Sync {
    /// Resolve a filename for reading. Relative names are searched under
    /// the environment's base directory; returns `None` when nothing
    /// readable is found.
    fn resolve_read(&self, name: &str) -> Option<PathBuf>;

    /// Build the path a new file should be created at. Relative names land
    /// under the environment's base directory.
    fn resolve_write(&self, name: &str) -> PathBuf;

    /// The environment's running sample rate in Hz.
    fn sample_rate(&self) -> f64;
}

/// Environment rooted at a single directory.
pub struct DirEnv {
    base: PathBuf,
    sample_rate: f64,
}

impl DirEnv {
    pub fn new(base: impl Into<PathBuf>) -> DirEnv {
        DirEnv {
            base: base.into(),
            sample_rate: 44100.0,
        }
    }

    pub fn with_sample_rate(mut self, rate: f64) -> DirEnv {
        self.sample_rate = rate;
        self
    }

    fn join(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        }
    }
}

impl AudioEnv for DirEnv {
    fn resolve_read(&self, name: &str) -> Option<PathBuf> {
        let path = self.join(name);
        if path.is_file() {
            Some(path)
        } else {
            None
        }
    }

    fn resolve_write(&self, name: &str) -> PathBuf {
        self.join(name)
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
}
