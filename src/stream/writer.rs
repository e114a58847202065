//! Streaming capture: signal inlets, through the FIFO, to disk.
//!
//! `perform` encodes each tick at the FIFO head; the worker drains the
//! tail to disk in large writes. `stop` switches the request to Close and
//! the worker keeps draining until the FIFO is empty, then patches the
//! header with the real frame count and closes.

use std::fs::OpenOptions;
use std::sync::{Arc, MutexGuard};
use std::thread::JoinHandle;

use super::{
    clamp_bufsize, clamp_channels, clamp_vecsize, Core, FrameInfo, Request, Shared,
    StreamState, MAXVECSIZE, READSIZE, WRITESIZE,
};
use crate::codec;
use crate::env::AudioEnv;
use crate::filer;
use crate::format::{complete_filename, SoundFileFormat};
use crate::soundfile::{SfError, SfResult, SoundFile, MAX_FRAMES};

/// Streaming soundfile recorder.
///
/// `open` creates the file and writes its header off the audio thread,
/// `start` lets `perform` push ticks, `stop` drains and closes. Dropping
/// the recorder quits and joins the worker.
pub struct StreamWriter {
    core: Arc<Core>,
    env: Arc<dyn AudioEnv>,
    channels: usize,
    worker: Option<JoinHandle<()>>,
}

impl StreamWriter {
    /// Create a recorder for `channels` signal inlets and an optional
    /// buffer size in bytes (clamped; `None` or 0 picks the default).
    pub fn new(
        env: Arc<dyn AudioEnv>,
        channels: usize,
        bufsize: Option<usize>,
    ) -> SfResult<StreamWriter> {
        let channels = clamp_channels(channels);
        let bufsize = clamp_bufsize(bufsize, channels);
        let core = Arc::new(Core::new(bufsize));
        let worker_core = Arc::clone(&core);
        let worker_env = Arc::clone(&env);
        let worker = std::thread::Builder::new()
            .name("writesf-io".to_string())
            .spawn(move || worker_main(worker_core, worker_env))?;
        Ok(StreamWriter {
            core,
            env,
            channels,
            worker: Some(worker),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// True while the worker holds a file open or has a request in
    /// flight. Diagnostic; the answer can be stale by the time it lands.
    pub fn is_active(&self) -> bool {
        let shared = self.core.lock();
        shared.file_open || shared.request != Request::Nothing
    }

    /// `open [flags] filename` with the write-style flags; normalize,
    /// onset and nframes make no sense for a stream and are ignored with
    /// a complaint. Stops a running stream first, then waits until the
    /// worker is idle before installing the new request.
    pub fn open(&self, args: &[String]) -> SfResult<()> {
        {
            let shared = self.core.lock();
            if shared.state != StreamState::Idle {
                drop(shared);
                self.stop();
            }
        }
        let wa = filer::parse_write_args(args)?;
        if wa.normalize || wa.onset != 0 || wa.nframes != MAX_FRAMES {
            log::error!("writesf: normalize/onset/nframes arguments ignored");
        }
        if !wa.tables.is_empty() {
            log::error!("writesf: extra argument(s) ignored");
        }

        let mut shared = self.core.lock();
        while shared.request != Request::Nothing {
            self.core.request_cond.notify_all();
            shared = self.core.wait_answer(shared);
        }
        let bytes_per_frame = self.channels * wa.bytes_per_sample;
        shared.info = FrameInfo {
            channels: self.channels,
            bytes_per_sample: wa.bytes_per_sample,
            big_endian: wa.big_endian,
            bytes_per_frame,
            sample_rate: wa
                .sample_rate
                .unwrap_or_else(|| self.env.sample_rate() as u32),
        };
        shared.pending.filename = wa.filename;
        shared.pending.format = Some(wa.format);
        shared.pending.meta = wa.meta.into();
        shared.frames_written = 0;
        shared.request = Request::Open;
        shared.fifo_head = 0;
        shared.fifo_tail = 0;
        shared.eof = false;
        shared.error = None;
        shared.state = StreamState::Startup;
        shared.fifo_size = shared.buf.len() - shared.buf.len() % (bytes_per_frame * MAXVECSIZE);
        shared.sig_period = shared.fifo_size / (16 * bytes_per_frame * shared.vec_size);
        shared.sig_countdown = shared.sig_period;
        self.core.request_cond.notify_all();
        Ok(())
    }

    /// Queue a metadata group; only legal between `open` and `start`.
    /// The worker writes it right after the header, before any samples.
    pub fn meta(&self, args: &[String]) -> SfResult<()> {
        let mut shared = self.core.lock();
        match shared.state {
            StreamState::Idle => Err(SfError::Usage(
                "meta with no prior 'open'".to_string(),
            )),
            StreamState::Stream => Err(SfError::Usage("meta after 'start'".to_string())),
            StreamState::Startup => {
                shared.pending.meta.push_back(args.to_vec());
                self.core.request_cond.notify_all();
                Ok(())
            }
        }
    }

    /// Let `perform` start pushing into the FIFO; requires a prior open.
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

    /// Drop to idle; the worker drains the FIFO, patches the header with
    /// the real frame count, and closes.
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
                log::error!("writesf: {}", err);
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
        log::info!("frames written {}", shared.frames_written);
    }

    /// One DSP tick: encode a vector of frames from each inlet at the
    /// FIFO head. Blocks only when the FIFO is saturated; a saturated
    /// buffer is a fault to report, not a reason to drop out.
    pub fn perform(&self, inlets: &[&[f32]]) {
        let mut shared = self.core.lock();
        if shared.state != StreamState::Stream {
            return;
        }
        let mut vec_size = shared.vec_size;
        let mut info = shared.info;
        let mut want = vec_size * info.bytes_per_frame;
        loop {
            let mut room = shared.fifo_tail as i64 - shared.fifo_head as i64;
            if room <= 0 {
                room += shared.fifo_size as i64;
            }
            if room as usize >= want + 1 || shared.eof {
                break;
            }
            log::warn!(
                "writesf: waiting for disk write (head {}, tail {}, room {}, want {})",
                shared.fifo_head,
                shared.fifo_tail,
                room,
                want
            );
            self.core.request_cond.notify_all();
            shared = self.core.wait_answer(shared);
            vec_size = shared.vec_size;
            info = shared.info;
            want = vec_size * info.bytes_per_frame;
        }
        if shared.eof {
            // the worker hit a write fault; report once and go idle
            if let Some(err) = shared.error.take() {
                log::error!("writesf: {}: {}", shared.pending.filename, err);
            }
            shared.state = StreamState::Idle;
            return;
        }

        static SILENCE: [f32; MAXVECSIZE] = [0.0; MAXVECSIZE];
        let head = shared.fifo_head;
        let contiguous = (shared.fifo_size - head) / info.bytes_per_frame;
        let frames = vec_size.min(contiguous);
        for ch in 0..info.channels {
            let src = match inlets.get(ch) {
                Some(input) => &input[..frames.min(input.len())],
                // fewer inlets than file channels: that lane records silence
                None => &SILENCE[..frames],
            };
            codec::encode_channel(
                info.bytes_per_sample,
                info.big_endian,
                info.bytes_per_frame,
                src,
                &mut shared.buf[head + ch * info.bytes_per_sample..],
                1.0,
            );
        }
        shared.fifo_head = head + frames * info.bytes_per_frame;
        if shared.fifo_head >= shared.fifo_size {
            shared.fifo_head = 0;
        }
        if shared.sig_countdown <= 1 {
            self.core.request_cond.notify_all();
            shared.sig_countdown = shared.sig_period;
        } else {
            shared.sig_countdown -= 1;
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        {
            let mut shared = self.core.lock();
            shared.request = Request::Quit;
            self.core.request_cond.notify_all();
            while shared.request != Request::Nothing {
                if self.worker.as_ref().is_none_or(|w| w.is_finished()) {
                    break;
                }
                self.core.request_cond.notify_all();
                shared = self
                    .core
                    .wait_answer_timeout(shared, std::time::Duration::from_millis(50));
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("writesf: worker join failed");
            }
        }
    }
}

/// The worker: serves opens by creating the file and draining the FIFO,
/// and finalizes the header on Close/Quit.
fn worker_main(core: Arc<Core>, env: Arc<dyn AudioEnv>) {
    let mut sf = SoundFile::new();
    let mut open_name = String::new();
    let mut scratch = vec![0u8; READSIZE];
    let mut shared = core.lock();
    loop {
        match shared.request {
            Request::Nothing | Request::Busy => {
                core.answer_cond.notify_all();
                shared = core.wait_request(shared);
            }
            Request::Open => {
                shared = serve_open(
                    &core,
                    env.as_ref(),
                    shared,
                    &mut sf,
                    &mut open_name,
                    &mut scratch,
                );
            }
            Request::Close | Request::Quit => {
                let quit = shared.request == Request::Quit;
                shared = finalize_unlocked(&core, shared, &mut sf, &open_name);
                shared.request = Request::Nothing;
                core.answer_cond.notify_all();
                if quit {
                    break;
                }
            }
        }
    }
}

/// Patch the header with the frames that landed and close, with the mutex
/// released for the disk work.
fn finalize_unlocked<'a>(
    core: &'a Core,
    shared: MutexGuard<'a, Shared>,
    sf: &mut SoundFile,
    open_name: &str,
) -> MutexGuard<'a, Shared> {
    if !sf.is_open() {
        return shared;
    }
    let frames_written = shared.frames_written;
    drop(shared);
    filer::finish_write(sf, open_name, MAX_FRAMES, frames_written);
    sf.close();
    let mut shared = core.lock();
    shared.file_open = false;
    shared
}

fn create_soundfile(
    env: &dyn AudioEnv,
    format: &Arc<dyn SoundFileFormat>,
    info: FrameInfo,
    name: &str,
) -> SfResult<(SoundFile, String)> {
    let filename = complete_filename(&**format, name);
    let path = env.resolve_write(&filename);
    let mut sf = SoundFile::new();
    sf.format = Some(format.clone());
    sf.set_geometry(info.channels, info.bytes_per_sample);
    sf.big_endian = info.big_endian;
    sf.sample_rate = info.sample_rate;
    sf.file = Some(
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?,
    );
    format.write_header(&mut sf, 0)?;
    Ok((sf, filename))
}

fn write_samples(sf: &mut SoundFile, buf: &[u8]) -> SfResult<usize> {
    match sf.format.clone() {
        Some(format) => format.write_samples(sf, buf),
        None => Ok(0),
    }
}

fn serve_open<'a>(
    core: &'a Core,
    env: &dyn AudioEnv,
    mut shared: MutexGuard<'a, Shared>,
    sf: &mut SoundFile,
    open_name: &mut String,
    scratch: &mut [u8],
) -> MutexGuard<'a, Shared> {
    // mark busy so an ensuing open gets noticed
    shared.request = Request::Busy;
    shared.error = None;
    let filename = shared.pending.filename.clone();
    let format = match shared.pending.format.clone() {
        Some(format) => format,
        None => {
            shared.request = Request::Nothing;
            return shared;
        }
    };
    let info = shared.info;

    // a file still open here means the previous stream was never stopped;
    // finalize it before starting over
    if sf.is_open() {
        shared = finalize_unlocked(core, shared, sf, open_name);
        if shared.request != Request::Busy {
            return shared;
        }
    }

    drop(shared);
    let created = create_soundfile(env, &format, info, &filename);
    let mut shared = core.lock();
    match created {
        Err(err) => {
            shared.error = Some(err);
            shared.eof = true;
            shared.request = Request::Nothing;
            core.answer_cond.notify_all();
            return shared;
        }
        Ok((opened, name)) => {
            *sf = opened;
            *open_name = name;
            shared.file_open = true;
        }
    }
    if shared.request != Request::Busy {
        return shared;
    }
    shared.fifo_tail = 0;
    shared.frames_written = 0;

    // drain loop: keep writing while busy, and through a Close until the
    // FIFO is empty
    loop {
        // queued metadata goes out before any samples land
        while let Some(group) = shared.pending.meta.pop_front() {
            drop(shared);
            if let Err(err) = format.write_metadata(sf, &group) {
                log::error!("writesf: writing metadata failed: {}", err);
            }
            shared = core.lock();
        }
        let request = shared.request;
        let head = shared.fifo_head;
        let tail = shared.fifo_tail;
        let fifo_size = shared.fifo_size;
        let draining = request == Request::Close && head != tail;
        if !(request == Request::Busy || draining) {
            break;
        }
        // write when the span has wrapped, holds a full WRITESIZE, or a
        // close is draining the remainder
        let write_bytes;
        if head < tail || head >= tail + WRITESIZE || draining {
            write_bytes = ((if head < tail { fifo_size } else { head }) - tail).min(READSIZE);
        } else {
            core.answer_cond.notify_all();
            shared = core.wait_request(shared);
            continue;
        }

        scratch[..write_bytes].copy_from_slice(&shared.buf[tail..tail + write_bytes]);
        drop(shared);
        let result = write_samples(sf, &scratch[..write_bytes]);
        shared = core.lock();
        if shared.request != Request::Busy && shared.request != Request::Close {
            break;
        }
        match result {
            Err(err) => {
                shared.error = Some(err);
                shared.eof = true;
                break;
            }
            Ok(n) if n < write_bytes => {
                shared.error = Some(SfError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write",
                )));
                shared.eof = true;
                break;
            }
            Ok(n) => {
                shared.fifo_tail += n;
                if shared.fifo_tail == fifo_size {
                    shared.fifo_tail = 0;
                }
                shared.frames_written += n / info.bytes_per_frame;
            }
        }
        // wake the audio side in case it is waiting for room
        core.answer_cond.notify_all();
    }

    if shared.request == Request::Busy {
        shared.request = Request::Nothing;
    }
    core.answer_cond.notify_all();
    shared
}
