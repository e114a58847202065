//! Realtime streaming between soundfiles and the audio callback.
//!
//! Each streaming object owns a bounded byte FIFO bridged by a dedicated
//! I/O worker thread, so the audio-thread `perform` call never touches the
//! disk. The two sides share one mutex and a pair of condition variables:
//! the audio side signals "request" to wake the worker (a control message
//! arrived, or another sixteenth of the buffer was consumed), and the
//! worker signals "answer" whenever it has made progress the audio side
//! might be waiting on.
//!
//! All shared state, including the FIFO bytes, is only touched under the
//! mutex; disk I/O runs with the mutex released through a worker-local
//! scratch buffer. The worker re-checks the request word after every
//! blocking call and abandons the job in progress when a newer request
//! has superseded it.

mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::soundfile::{HeaderSpec, SfError, MAX_BYTES};
use crate::format::SoundFileFormat;

/// Bytes per worker disk read.
pub(crate) const READSIZE: usize = 65536;
/// Bytes per worker disk write.
pub(crate) const WRITESIZE: usize = 65536;
/// Default buffer bytes per channel.
pub(crate) const DEFBUFPERCHAN: usize = 262144;
/// Smallest accepted buffer.
pub(crate) const MINBUFSIZE: usize = 4 * READSIZE;
/// Largest accepted buffer.
pub(crate) const MAXBUFSIZE: usize = 16_777_216;

/// Pessimistic upper bound on the host's DSP tick size; the FIFO is sized
/// in multiples of `bytes_per_frame * MAXVECSIZE` so a tick never wraps.
pub const MAXVECSIZE: usize = 128;

/// Pending order for the I/O worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    Nothing,
    Open,
    Close,
    Quit,
    /// Set by the worker itself while serving an Open, so that a newer
    /// request can be noticed after every blocking call.
    Busy,
}

/// Audio-side streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Startup,
    Stream,
}

/// Geometry snapshot the perform adapters read each tick. Written by the
/// control surface at `open` (defaults or raw geometry) and overwritten by
/// the worker once a header has been parsed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameInfo {
    pub channels: usize,
    pub bytes_per_sample: usize,
    pub big_endian: bool,
    pub bytes_per_frame: usize,
    pub sample_rate: u32,
}

impl FrameInfo {
    fn cleared() -> FrameInfo {
        FrameInfo {
            channels: 1,
            bytes_per_sample: 2,
            big_endian: false,
            bytes_per_frame: 2,
            sample_rate: 0,
        }
    }
}

/// Parameters of a pending open, snapshotted by the worker before it
/// releases the mutex for the blocking open call.
pub(crate) struct Pending {
    pub filename: String,
    pub onset: usize,
    pub format: Option<Arc<dyn SoundFileFormat>>,
    pub header: HeaderSpec,
    /// Queued metadata groups, written by the capture worker between the
    /// header and the first sample.
    pub meta: VecDeque<Vec<String>>,
}

impl Pending {
    fn cleared() -> Pending {
        Pending {
            filename: String::new(),
            onset: 0,
            format: None,
            header: HeaderSpec::Detect,
            meta: VecDeque::new(),
        }
    }
}

/// Everything both threads share, behind the object's mutex.
pub(crate) struct Shared {
    pub request: Request,
    pub state: StreamState,
    /// FIFO bytes; allocated at construction, never resized.
    pub buf: Vec<u8>,
    /// Buffer size rounded down to a whole number of maximum-size ticks.
    pub fifo_size: usize,
    /// Producer index: next byte the worker fills (playback) or the audio
    /// thread fills (capture).
    pub fifo_head: usize,
    /// Consumer index.
    pub fifo_tail: usize,
    pub eof: bool,
    /// First fault since the last open; taken once by the audio side.
    pub error: Option<SfError>,
    pub pending: Pending,
    pub info: FrameInfo,
    /// Remaining payload bytes (playback).
    pub byte_limit: usize,
    /// Worker currently holds an open file (diagnostic only).
    pub file_open: bool,
    pub vec_size: usize,
    pub sig_countdown: usize,
    pub sig_period: usize,
    /// Frames the capture worker has put on disk.
    pub frames_written: usize,
}

impl Shared {
    fn new(bufsize: usize) -> Shared {
        Shared {
            request: Request::Nothing,
            state: StreamState::Idle,
            buf: vec![0u8; bufsize],
            fifo_size: 0,
            fifo_head: 0,
            fifo_tail: 0,
            eof: false,
            error: None,
            pending: Pending::cleared(),
            info: FrameInfo::cleared(),
            byte_limit: MAX_BYTES,
            file_open: false,
            vec_size: MAXVECSIZE,
            sig_countdown: 0,
            sig_period: 0,
            frames_written: 0,
        }
    }
}

/// The mutex and both condition variables, shared by the control surface,
/// the perform adapter, and the worker.
pub(crate) struct Core {
    pub shared: Mutex<Shared>,
    /// Audio side -> worker.
    pub request_cond: Condvar,
    /// Worker -> audio side.
    pub answer_cond: Condvar,
}

impl Core {
    pub fn new(bufsize: usize) -> Core {
        Core {
            shared: Mutex::new(Shared::new(bufsize)),
            request_cond: Condvar::new(),
            answer_cond: Condvar::new(),
        }
    }

    /// Lock the shared state. A poisoned mutex is recovered: every
    /// critical section leaves the state consistent, so the data is still
    /// usable after a panic elsewhere.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Block on the "request" condition (worker side).
    pub fn wait_request<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, Shared>,
    ) -> std::sync::MutexGuard<'a, Shared> {
        self.request_cond
            .wait(guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Block on the "answer" condition (audio side).
    pub fn wait_answer<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, Shared>,
    ) -> std::sync::MutexGuard<'a, Shared> {
        self.answer_cond
            .wait(guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Timed wait on "answer"; used while tearing down so a dead worker
    /// cannot park the destructor forever.
    pub fn wait_answer_timeout<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, Shared>,
        timeout: std::time::Duration,
    ) -> std::sync::MutexGuard<'a, Shared> {
        self.answer_cond
            .wait_timeout(guard, timeout)
            .map(|(guard, _timed_out)| guard)
            .unwrap_or_else(|err| err.into_inner().0)
    }
}

/// Clamp a constructor buffer-size argument: zero or negative picks the
/// per-channel default, anything else lands in [MINBUFSIZE, MAXBUFSIZE].
pub(crate) fn clamp_bufsize(requested: Option<usize>, channels: usize) -> usize {
    match requested {
        None | Some(0) => DEFBUFPERCHAN * channels,
        Some(n) => n.clamp(MINBUFSIZE, MAXBUFSIZE),
    }
}

/// Clamp a constructor channel-count argument.
pub(crate) fn clamp_channels(channels: usize) -> usize {
    channels.clamp(1, crate::soundfile::MAX_CHANNELS)
}

/// Round a host tick size down to a power of two within [1, MAXVECSIZE],
/// keeping FIFO arithmetic wrap-free.
pub(crate) fn clamp_vecsize(n: usize) -> usize {
    let n = n.clamp(1, MAXVECSIZE);
    let mut p = 1;
    while p * 2 <= n {
        p *= 2;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bufsize_clamping() {
        assert_eq!(clamp_bufsize(None, 2), 2 * DEFBUFPERCHAN);
        assert_eq!(clamp_bufsize(Some(0), 1), DEFBUFPERCHAN);
        assert_eq!(clamp_bufsize(Some(1), 1), MINBUFSIZE);
        assert_eq!(clamp_bufsize(Some(usize::MAX), 1), MAXBUFSIZE);
        assert_eq!(clamp_bufsize(Some(MINBUFSIZE * 2), 1), MINBUFSIZE * 2);
    }

    #[test]
    fn test_channel_clamping() {
        assert_eq!(clamp_channels(0), 1);
        assert_eq!(clamp_channels(2), 2);
        assert_eq!(clamp_channels(1000), 64);
    }

    #[test]
    fn test_vecsize_rounds_down_to_power_of_two() {
        assert_eq!(clamp_vecsize(0), 1);
        assert_eq!(clamp_vecsize(48), 32);
        assert_eq!(clamp_vecsize(64), 64);
        assert_eq!(clamp_vecsize(129), 128);
    }
}
