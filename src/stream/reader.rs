//! Streaming playback: disk, through the FIFO, to signal outlets.
//!
//! The worker thread owns the open descriptor and fills the FIFO ahead of
//! the audio thread; `perform` decodes one tick at the tail each call.
//! When the file runs out the perform adapter reports any stored fault,
//! pushes a done pulse, and drops back to idle.

use std::sync::{Arc, MutexGuard};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::{
    clamp_bufsize, clamp_channels, clamp_vecsize, Core, FrameInfo, Request, Shared,
    StreamState, MAXVECSIZE, READSIZE,
};
use crate::codec;
use crate::env::AudioEnv;
use crate::format::{self, open_soundfile, OpenRequest};
use crate::soundfile::{HeaderSpec, SfError, SfResult, SoundFile, MAX_BYTES, MAX_CHANNELS};

/// Streaming soundfile player.
///
/// `open` hands a filename to the worker, `start` lets `perform` stream,
/// `stop` closes. A pulse arrives on the done channel when the file runs
/// out. Dropping the player quits and joins the worker.
pub struct StreamReader {
    core: Arc<Core>,
    channels: usize,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

fn open_usage() -> SfError {
    SfError::Usage(format!(
        "open [flags] filename [onset] [headersize] [channels] \
         [bytespersample] [endian (b or l)]\nflags: {} --",
        format::format_flags()
    ))
}

impl StreamReader {
    /// Create a player with `channels` signal outlets and an optional
    /// buffer size in bytes (clamped; `None` or 0 picks the default).
    pub fn new(
        env: Arc<dyn AudioEnv>,
        channels: usize,
        bufsize: Option<usize>,
    ) -> SfResult<StreamReader> {
        let channels = clamp_channels(channels);
        let bufsize = clamp_bufsize(bufsize, channels);
        let core = Arc::new(Core::new(bufsize));
        let (done_tx, done_rx) = bounded(1);
        let worker_core = Arc::clone(&core);
        let worker = std::thread::Builder::new()
            .name("readsf-io".to_string())
            .spawn(move || worker_main(worker_core, env))?;
        Ok(StreamReader {
            core,
            channels,
            done_tx,
            done_rx,
            worker: Some(worker),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Pulses once each time an open file has been played to the end.
    pub fn done_receiver(&self) -> &Receiver<()> {
        &self.done_rx
    }

    /// True while the worker holds a file open or has a request in
    /// flight. Diagnostic; the answer can be stale by the time it lands.
    pub fn is_active(&self) -> bool {
        let shared = self.core.lock();
        shared.file_open || shared.request != Request::Nothing
    }

    /// `open [flags] filename [onset] [headersize] [channels]
    /// [bytespersample] [endian]`: hand the worker a file to prebuffer.
    /// A second open supersedes an unfinished one. Headersize 0 means
    /// detect, positive means raw with that header, -1 means headerless.
    pub fn open(&self, args: &[String]) -> SfResult<()> {
        let mut forced: Option<Arc<dyn format::SoundFileFormat>> = None;
        let mut rest = args;
        while let Some(token) = rest.first() {
            let Some(flag) = token.strip_prefix('-') else {
                break;
            };
            if flag == "-" {
                rest = &rest[1..];
                break;
            }
            forced = Some(format::find_format(flag).ok_or_else(open_usage)?);
            rest = &rest[1..];
        }
        let filename = match rest.first() {
            Some(name) if !name.is_empty() => name.clone(),
            _ => return Err(open_usage()),
        };
        let number = |i: usize| rest.get(i).and_then(|t| t.parse::<f64>().ok());
        let onset = number(1).filter(|v| *v > 0.0).map(|v| v as usize).unwrap_or(0);
        let headersize = number(2).unwrap_or(0.0);
        let channels = number(3)
            .map(|v| v as usize)
            .filter(|c| *c >= 1)
            .unwrap_or(1)
            .min(MAX_CHANNELS);
        let bytes_per_sample = number(4)
            .map(|v| v as usize)
            .filter(|b| *b > 2)
            .unwrap_or(2)
            .min(4);
        let big_endian = match rest.get(5).map(|s| s.as_str()) {
            Some(e) if e.starts_with('b') => true,
            Some(e) if e.starts_with('l') => false,
            Some(e) if !e.is_empty() => {
                log::error!("readsf: endianness neither 'b' nor 'l'");
                codec::host_is_big_endian()
            }
            _ => codec::host_is_big_endian(),
        };
        let header = if headersize > 0.0 {
            HeaderSpec::Raw(headersize as usize)
        } else if headersize == 0.0 {
            HeaderSpec::Detect
        } else {
            HeaderSpec::Raw(0)
        };

        let mut shared = self.core.lock();
        shared.info = FrameInfo {
            channels,
            bytes_per_sample,
            big_endian,
            bytes_per_frame: channels * bytes_per_sample,
            sample_rate: 0,
        };
        shared.byte_limit = MAX_BYTES;
        if forced.is_some() && matches!(header, HeaderSpec::Raw(_)) {
            log::info!("readsf: format flag overridden by headersize");
            shared.pending.format = None;
        } else {
            shared.pending.format = forced;
        }
        shared.pending.filename = filename;
        shared.pending.onset = onset;
        shared.pending.header = header;
        shared.request = Request::Open;
        shared.fifo_head = 0;
        shared.fifo_tail = 0;
        shared.eof = false;
        shared.error = None;
        shared.state = StreamState::Startup;
        self.core.request_cond.notify_all();
        Ok(())
    }

    /// Let `perform` start pulling from the FIFO; requires a prior open.
    pub fn start(&self) -> SfResult<()> {
        let mut shared = self.core.lock();
        if shared.state == StreamState::Startup {
            shared.state = StreamState::Stream;
            Ok(())
        } else {
            Err(SfError::Usage(
                "start requested with no prior 'open'".to_string(),
            ))
        }
    }

    /// Drop to idle and have the worker close the file.
    pub fn stop(&self) {
        let mut shared = self.core.lock();
        shared.state = StreamState::Idle;
        shared.request = Request::Close;
        self.core.request_cond.notify_all();
    }

    /// Scalar control: nonzero starts, zero stops.
    pub fn control(&self, value: f32) {
        if value != 0.0 {
            if let Err(err) = self.start() {
                log::error!("readsf: {}", err);
            }
        } else {
            self.stop();
        }
    }

    /// The host's DSP tick size changed; rounded down to a power of two
    /// within [1, 128].
    pub fn set_vector_size(&self, vec_size: usize) {
        let mut shared = self.core.lock();
        shared.vec_size = clamp_vecsize(vec_size);
        let bpf = shared.info.bytes_per_frame;
        if shared.fifo_size > 0 && bpf > 0 {
            shared.sig_period = shared.fifo_size / (16 * bpf * shared.vec_size);
        }
    }

    /// Emit diagnostic state.
    pub fn print(&self) {
        let shared = self.core.lock();
        log::info!("state {:?}", shared.state);
        log::info!("fifo head {}", shared.fifo_head);
        log::info!("fifo tail {}", shared.fifo_tail);
        log::info!("fifo size {}", shared.fifo_size);
        log::info!("open {}", shared.file_open);
        log::info!("eof {}", shared.eof);
    }

    /// One DSP tick: decode a vector of frames into each outlet, or zeros
    /// when idle. Blocks only when the FIFO is starved.
    pub fn perform(&self, outlets: &mut [&mut [f32]]) {
        let mut shared = self.core.lock();
        if shared.state != StreamState::Stream {
            for out in outlets.iter_mut() {
                out.fill(0.0);
            }
            return;
        }

        let mut vec_size = shared.vec_size;
        let mut info = shared.info;
        let mut want = vec_size * info.bytes_per_frame;
        while !shared.eof
            && shared.fifo_head >= shared.fifo_tail
            && shared.fifo_head < (shared.fifo_tail + want).saturating_sub(1)
        {
            self.core.request_cond.notify_all();
            shared = self.core.wait_answer(shared);
            // the DSP graph may have been reconfigured while waiting
            vec_size = shared.vec_size;
            info = shared.info;
            want = vec_size * info.bytes_per_frame;
        }

        if shared.eof
            && shared.fifo_head >= shared.fifo_tail
            && shared.fifo_head < (shared.fifo_tail + want).saturating_sub(1)
        {
            // the file ran out: report any fault once, pulse done, emit
            // the partial tick, and go idle
            if let Some(err) = shared.error.take() {
                log::error!("readsf: {}: {}", shared.pending.filename, err);
            }
            let _ = self.done_tx.try_send(());
            shared.state = StreamState::Idle;
            let xfer = (shared.fifo_head - shared.fifo_tail + 1) / info.bytes_per_frame;
            let tail = shared.fifo_tail;
            for (ch, out) in outlets.iter_mut().enumerate() {
                let frames = if ch < info.channels {
                    xfer.min(out.len())
                } else {
                    0
                };
                if frames > 0 {
                    codec::decode_channel(
                        info.bytes_per_sample,
                        info.big_endian,
                        info.bytes_per_frame,
                        &shared.buf[tail + ch * info.bytes_per_sample..],
                        &mut out[..frames],
                    );
                }
                out[frames..].fill(0.0);
            }
            self.core.request_cond.notify_all();
            return;
        }

        let tail = shared.fifo_tail;
        let contiguous = (shared.fifo_size - tail) / info.bytes_per_frame;
        let frames = vec_size.min(contiguous);
        for (ch, out) in outlets.iter_mut().enumerate() {
            let n = frames.min(out.len());
            if ch < info.channels && n > 0 {
                codec::decode_channel(
                    info.bytes_per_sample,
                    info.big_endian,
                    info.bytes_per_frame,
                    &shared.buf[tail + ch * info.bytes_per_sample..],
                    &mut out[..n],
                );
                out[n..].fill(0.0);
            } else {
                out.fill(0.0);
            }
        }
        shared.fifo_tail += frames * info.bytes_per_frame;
        if shared.fifo_tail >= shared.fifo_size {
            shared.fifo_tail = 0;
        }
        if shared.sig_countdown <= 1 {
            self.core.request_cond.notify_all();
            shared.sig_countdown = shared.sig_period;
        } else {
            shared.sig_countdown -= 1;
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        {
            let mut shared = self.core.lock();
            shared.request = Request::Quit;
            self.core.request_cond.notify_all();
            while shared.request != Request::Nothing {
                if self.worker.as_ref().is_none_or(|w| w.is_finished()) {
                    break;
                }
                // re-signal on every wake to avoid a missed wakeup
                self.core.request_cond.notify_all();
                shared = self
                    .core
                    .wait_answer_timeout(shared, std::time::Duration::from_millis(50));
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("readsf: worker join failed");
            }
        }
    }
}

/// The worker: waits for requests, serves opens by feeding the FIFO until
/// EOF or supersession, and acknowledges Close/Quit.
fn worker_main(core: Arc<Core>, env: Arc<dyn AudioEnv>) {
    let mut sf = SoundFile::new();
    let mut scratch = vec![0u8; READSIZE];
    let mut shared = core.lock();
    loop {
        match shared.request {
            Request::Nothing | Request::Busy => {
                core.answer_cond.notify_all();
                shared = core.wait_request(shared);
            }
            Request::Open => {
                shared = serve_open(&core, env.as_ref(), shared, &mut sf, &mut scratch);
            }
            Request::Close => {
                shared = close_unlocked(&core, shared, &mut sf);
                if shared.request == Request::Close {
                    shared.request = Request::Nothing;
                }
                core.answer_cond.notify_all();
            }
            Request::Quit => {
                shared = close_unlocked(&core, shared, &mut sf);
                shared.request = Request::Nothing;
                core.answer_cond.notify_all();
                break;
            }
        }
    }
}

/// Close the worker's descriptor with the mutex released.
fn close_unlocked<'a>(
    core: &'a Core,
    shared: MutexGuard<'a, Shared>,
    sf: &mut SoundFile,
) -> MutexGuard<'a, Shared> {
    if !sf.is_open() {
        return shared;
    }
    drop(shared);
    sf.close();
    let mut shared = core.lock();
    shared.file_open = false;
    shared
}

/// Exit path of an Open: revert Busy, close, wake the audio side.
fn finish_serve<'a>(
    core: &'a Core,
    mut shared: MutexGuard<'a, Shared>,
    sf: &mut SoundFile,
) -> MutexGuard<'a, Shared> {
    if shared.request == Request::Busy {
        shared.request = Request::Nothing;
    }
    shared = close_unlocked(core, shared, sf);
    core.answer_cond.notify_all();
    shared
}

fn read_samples(sf: &mut SoundFile, buf: &mut [u8]) -> SfResult<usize> {
    match sf.format.clone() {
        Some(format) => format.read_samples(sf, buf),
        None => Ok(0),
    }
}

fn serve_open<'a>(
    core: &'a Core,
    env: &dyn AudioEnv,
    mut shared: MutexGuard<'a, Shared>,
    sf: &mut SoundFile,
    scratch: &mut [u8],
) -> MutexGuard<'a, Shared> {
    // mark busy so an ensuing open gets noticed
    shared.request = Request::Busy;
    shared.error = None;
    let filename = shared.pending.filename.clone();
    let request = OpenRequest {
        format: shared.pending.format.clone(),
        header: shared.pending.header,
        channels: shared.info.channels,
        bytes_per_sample: shared.info.bytes_per_sample,
        big_endian: shared.info.big_endian,
        sample_rate: shared.info.sample_rate,
        onset_frames: shared.pending.onset,
    };

    if sf.is_open() {
        shared = close_unlocked(core, shared, sf);
        if shared.request != Request::Busy {
            return finish_serve(core, shared, sf);
        }
    }

    drop(shared);
    let result = env
        .resolve_read(&filename)
        .ok_or_else(|| SfError::PathNotFound(filename.clone()))
        .and_then(|path| open_soundfile(&path, &request));
    let mut shared = core.lock();

    match result {
        Err(err) => {
            shared.error = Some(err);
            shared.eof = true;
            return finish_serve(core, shared, sf);
        }
        Ok(opened) => {
            *sf = opened;
            shared.file_open = true;
            shared.info = FrameInfo {
                channels: sf.channels,
                bytes_per_sample: sf.bytes_per_sample,
                big_endian: sf.big_endian,
                bytes_per_frame: sf.bytes_per_frame,
                sample_rate: sf.sample_rate,
            };
            shared.byte_limit = sf.byte_limit;
        }
    }
    if shared.request != Request::Busy {
        return finish_serve(core, shared, sf);
    }

    shared.fifo_head = 0;
    // the FIFO must hold a whole number of worst-case ticks
    let bpf = shared.info.bytes_per_frame;
    shared.fifo_size = shared.buf.len() - shared.buf.len() % (bpf * MAXVECSIZE);
    // have the audio side wake us sixteen times per buffer
    shared.sig_period = shared.fifo_size / (16 * bpf * shared.vec_size);
    shared.sig_countdown = shared.sig_period;

    loop {
        if shared.request != Request::Busy || shared.eof {
            break;
        }
        let fifo_size = shared.fifo_size;
        let head = shared.fifo_head;
        let tail = shared.fifo_tail;
        let want;
        if head >= tail {
            // reading to the end of the buffer with the tail at zero
            // would fill it completely, indistinguishable from empty
            if tail != 0 || fifo_size - head > READSIZE {
                want = (fifo_size - head).min(READSIZE).min(shared.byte_limit);
            } else {
                core.answer_cond.notify_all();
                shared = core.wait_request(shared);
                continue;
            }
        } else {
            if tail - head - 1 < READSIZE {
                core.answer_cond.notify_all();
                shared = core.wait_request(shared);
                continue;
            }
            want = READSIZE.min(shared.byte_limit);
        }

        drop(shared);
        let result = read_samples(sf, &mut scratch[..want]);
        shared = core.lock();
        if shared.request != Request::Busy {
            break;
        }
        match result {
            Err(err) => {
                shared.error = Some(err);
                shared.eof = true;
                break;
            }
            Ok(0) => {
                shared.eof = true;
                break;
            }
            Ok(n) => {
                let head = shared.fifo_head;
                shared.buf[head..head + n].copy_from_slice(&scratch[..n]);
                shared.fifo_head += n;
                if shared.fifo_head == fifo_size {
                    shared.fifo_head = 0;
                }
                shared.byte_limit = shared.byte_limit.saturating_sub(n);
                if shared.byte_limit == 0 {
                    shared.eof = true;
                    break;
                }
            }
        }
        // wake the audio side in case it is waiting for data
        core.answer_cond.notify_all();
    }

    finish_serve(core, shared, sf)
}
