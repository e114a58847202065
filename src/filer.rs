//! Synchronous batch transfers between soundfiles and tables.
//!
//! The [`read`] and [`write`] entry points parse a left-to-right flag list
//! (the message-surface convention: `-flag` tokens, `--` terminator,
//! unknown `-name` flags looked up in the format registry), then move
//! sample frames between disk and the named tables in fixed-size chunks.
//! These calls block on disk and are not meant for realtime use; the
//! streaming objects in [`crate::stream`] cover that.

use std::fs::OpenOptions;
use std::sync::Arc;

use crate::codec;
use crate::env::AudioEnv;
use crate::format::{
    self, complete_filename, open_soundfile, OpenRequest, SoundFileFormat,
};
use crate::soundfile::{
    Endian, HeaderSpec, SfError, SfInfo, SfResult, SoundFile, MAX_CHANNELS, MAX_FRAMES,
};
use crate::table::TableSet;

/// Transfer chunk size in bytes; always a whole number of frames.
const SAMPBUF_SIZE: usize = 1024;

/// Most `-meta` groups accepted by one write command.
const MAX_WRITE_META: usize = 8;

/// Result of a batch read: frames transferred plus the info tuple (absent
/// for the ASCII fallback, which has no header to describe).
#[derive(Debug)]
pub struct ReadOutcome {
    pub frames: usize,
    pub info: Option<SfInfo>,
    pub metadata: Vec<(String, String)>,
}

/// Result of a batch write.
#[derive(Debug)]
pub struct WriteOutcome {
    pub frames: usize,
    pub info: SfInfo,
}

/// Names of the registered formats, in registry order.
pub fn list() -> Vec<String> {
    format::formats()
        .iter()
        .map(|f| f.name().to_string())
        .collect()
}

fn read_usage() -> SfError {
    SfError::Usage(format!(
        "read [flags] filename [tablename]...\n\
         flags: -skip <n> -resize -maxsize <n> -ascii -meta {} --\n\
         -raw <headerbytes> <channels> <bytespersample> <endian (b, l, or n)>",
        format::format_flags()
    ))
}

fn write_usage() -> SfError {
    SfError::Usage(format!(
        "write [flags] filename tablename...\n\
         flags: -skip <n> -nframes <n> -bytes <n> -rate <n> {} \n\
         -big -little -normalize -meta <key> [args...] --\n\
         (defaults to a 16 bit wave file)",
        format::format_flags()
    ))
}

/// Nonnegative count parsed the way the message surface parses numbers.
fn parse_count(token: &str) -> Option<usize> {
    let value: f64 = token.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value as usize)
}

struct ReadArgs {
    skip: usize,
    ascii: bool,
    raw: Option<OpenRequest>,
    resize: bool,
    maxsize: usize,
    meta: bool,
    format: Option<Arc<dyn SoundFileFormat>>,
    filename: String,
    tables: Vec<String>,
}

fn parse_read_args(args: &[String]) -> SfResult<ReadArgs> {
    let mut out = ReadArgs {
        skip: 0,
        ascii: false,
        raw: None,
        resize: false,
        maxsize: MAX_FRAMES,
        meta: false,
        format: None,
        filename: String::new(),
        tables: Vec::new(),
    };
    let mut rest = args;
    while let Some(token) = rest.first() {
        let Some(flag) = token.strip_prefix('-') else {
            break;
        };
        match flag {
            "skip" => {
                out.skip = rest
                    .get(1)
                    .and_then(|t| parse_count(t))
                    .ok_or_else(read_usage)?;
                rest = &rest[2..];
            }
            "ascii" => {
                if out.raw.is_some() {
                    log::info!("read: '-raw' overridden by '-ascii'");
                }
                out.ascii = true;
                rest = &rest[1..];
            }
            "raw" => {
                if out.ascii {
                    log::info!("read: '-raw' overridden by '-ascii'");
                }
                if rest.len() < 5 {
                    return Err(read_usage());
                }
                let header = rest.get(1).and_then(|t| parse_count(t)).ok_or_else(read_usage)?;
                let channels = rest.get(2).and_then(|t| parse_count(t)).ok_or_else(read_usage)?;
                let bytes = rest.get(3).and_then(|t| parse_count(t)).ok_or_else(read_usage)?;
                let endian = match rest[4].as_str() {
                    "b" => true,
                    "l" => false,
                    "n" => codec::host_is_big_endian(),
                    _ => return Err(read_usage()),
                };
                if channels < 1 || channels > MAX_CHANNELS || !(2..=4).contains(&bytes) {
                    return Err(read_usage());
                }
                out.raw = Some(OpenRequest {
                    format: None,
                    header: HeaderSpec::Raw(header),
                    channels,
                    bytes_per_sample: bytes,
                    big_endian: endian,
                    sample_rate: 0,
                    onset_frames: 0,
                });
                rest = &rest[5..];
            }
            "resize" => {
                out.resize = true;
                rest = &rest[1..];
            }
            "maxsize" => {
                out.maxsize = rest
                    .get(1)
                    .and_then(|t| parse_count(t))
                    .ok_or_else(read_usage)?
                    .min(MAX_FRAMES);
                out.resize = true; // maxsize implies resize
                rest = &rest[2..];
            }
            "meta" => {
                out.meta = true;
                rest = &rest[1..];
            }
            "-" => {
                rest = &rest[1..];
                break;
            }
            name => {
                out.format =
                    Some(format::find_format(name).ok_or_else(read_usage)?);
                rest = &rest[1..];
            }
        }
    }
    if rest.is_empty() || rest.len() > MAX_CHANNELS + 1 {
        return Err(read_usage());
    }
    out.filename = rest[0].clone();
    out.tables = rest[1..].to_vec();
    Ok(out)
}

/// `read [flags] filename [table...]`: transfer frames from a soundfile
/// into the named tables.
pub fn read(env: &dyn AudioEnv, tables: &mut TableSet, args: &[String]) -> SfResult<ReadOutcome> {
    let parsed = parse_read_args(args)?;
    let indices = tables.select(&parsed.tables)?;

    // settle the target length (the smallest table); mismatched tables
    // force a resize
    let mut resize = parsed.resize;
    let mut final_size: Option<usize> = None;
    for &idx in &indices {
        let len = tables.index(idx).len();
        if let Some(current) = final_size {
            if current != len && !resize {
                log::info!("read: arrays have different lengths; resizing...");
                resize = true;
            }
            final_size = Some(current.min(len));
        } else {
            final_size = Some(len);
        }
    }
    let mut final_size = final_size.unwrap_or(0);

    if parsed.ascii {
        let frames = read_ascii(env, tables, &parsed, &indices, resize, final_size)?;
        return Ok(ReadOutcome {
            frames,
            info: None,
            metadata: Vec::new(),
        });
    }

    let path = env
        .resolve_read(&parsed.filename)
        .ok_or_else(|| SfError::PathNotFound(parsed.filename.clone()))?;
    let raw = parsed.raw.is_some();
    let mut request = parsed.raw.unwrap_or_default();
    request.format = parsed.format;
    request.onset_frames = parsed.skip;
    if request.sample_rate == 0 {
        request.sample_rate = env.sample_rate() as u32;
    }
    let mut sf = open_soundfile(&path, &request)?;
    let frames_in_file = sf.frames_left();

    let format = sf
        .format
        .clone()
        .ok_or_else(|| SfError::BadHeader(parsed.filename.clone()))?;

    let mut metadata = Vec::new();
    if parsed.meta {
        match format.read_metadata(&mut sf) {
            Ok(pairs) => metadata = pairs,
            Err(err) => log::error!("read: reading metadata failed: {}", err),
        }
    }

    if resize {
        let mut target = frames_in_file;
        if target > parsed.maxsize {
            log::error!("read: truncated to {} elements", parsed.maxsize);
            target = parsed.maxsize;
        }
        // a raw file with no -maxsize has no knowable length to resize to
        if target >= MAX_FRAMES {
            return Err(SfError::ResizeFailed(parsed.filename.clone()));
        }
        final_size = target;
        for &idx in &indices {
            let table = tables.index(idx);
            table.resize(final_size);
        }
    }

    if indices.is_empty() && final_size == 0 {
        final_size = MAX_FRAMES;
    }
    if final_size > frames_in_file {
        final_size = frames_in_file;
    }

    // with no target tables the header already answers the question,
    // except for raw files which have to be scanned
    if indices.is_empty() && !raw && final_size != MAX_FRAMES {
        let outcome = ReadOutcome {
            frames: final_size,
            info: Some(sf.info()),
            metadata,
        };
        sf.close();
        return Ok(outcome);
    }

    let frames_read = transfer_in(&format, &mut sf, tables, &indices, final_size);

    // zero out the remainder of each table, and every table beyond the
    // file's channel count
    for (ch, &idx) in indices.iter().enumerate() {
        let table = tables.index(idx);
        let from = if ch < sf.channels { frames_read } else { 0 };
        let from = from.min(table.len());
        for sample in table.data_mut()[from..].iter_mut() {
            *sample = 0.0;
        }
        table.redraw();
    }

    let outcome = ReadOutcome {
        frames: frames_read,
        info: Some(sf.info()),
        metadata,
    };
    sf.close();
    Ok(outcome)
}

fn transfer_in(
    format: &Arc<dyn SoundFileFormat>,
    sf: &mut SoundFile,
    tables: &mut TableSet,
    indices: &[usize],
    final_size: usize,
) -> usize {
    let buf_frames = SAMPBUF_SIZE / sf.bytes_per_frame;
    let mut sampbuf = [0u8; SAMPBUF_SIZE];
    let mut frames_read = 0usize;
    while frames_read < final_size {
        let this = (final_size - frames_read).min(buf_frames);
        let wanted = this * sf.bytes_per_frame;
        let got = match format.read_samples(sf, &mut sampbuf[..wanted]) {
            Ok(n) => n,
            Err(err) => {
                log::error!("read: {}", err);
                break;
            }
        };
        let frames = got / sf.bytes_per_frame;
        if frames == 0 {
            break;
        }
        let channels = sf.channels.min(indices.len());
        for (ch, &idx) in indices.iter().take(channels).enumerate() {
            let table = tables.index(idx);
            let dst = &mut table.data_mut()[frames_read..frames_read + frames];
            codec::decode_channel(
                sf.bytes_per_sample,
                sf.big_endian,
                sf.bytes_per_frame,
                &sampbuf[ch * sf.bytes_per_sample..wanted],
                dst,
            );
        }
        frames_read += frames;
    }
    frames_read
}

/// Whitespace-separated float fallback: one value per table per row.
fn read_ascii(
    env: &dyn AudioEnv,
    tables: &mut TableSet,
    parsed: &ReadArgs,
    indices: &[usize],
    resize: bool,
    final_size: usize,
) -> SfResult<usize> {
    let path = env
        .resolve_read(&parsed.filename)
        .ok_or_else(|| SfError::PathNotFound(parsed.filename.clone()))?;
    let text = std::fs::read_to_string(&path)?;
    let values: Vec<f32> = text
        .split_whitespace()
        .map(|t| t.parse().unwrap_or(0.0))
        .collect();
    if indices.is_empty() {
        return Ok(0);
    }
    let mut frames = values.len() / indices.len();
    if frames < 1 {
        log::error!("read: {}: empty or very short file", parsed.filename);
        return Ok(0);
    }
    if resize {
        for &idx in indices {
            tables.index(idx).resize(frames);
        }
    } else if final_size < frames {
        frames = final_size;
    }
    for (ch, &idx) in indices.iter().enumerate() {
        let table = tables.index(idx);
        for (row, sample) in table.data_mut()[..frames].iter_mut().enumerate() {
            *sample = values[row * indices.len() + ch];
        }
        for sample in table.data_mut()[frames..].iter_mut() {
            *sample = 0.0;
        }
        table.redraw();
    }
    Ok(frames)
}

pub(crate) struct WriteArgs {
    pub filename: String,
    pub format: Arc<dyn SoundFileFormat>,
    pub sample_rate: Option<u32>,
    pub bytes_per_sample: usize,
    pub big_endian: bool,
    pub nframes: usize,
    pub onset: usize,
    pub normalize: bool,
    pub meta: Vec<Vec<String>>,
    pub tables: Vec<String>,
}

/// Parse write-style flags, shared with the streaming capture object
/// (which ignores normalize/onset/nframes and says so).
pub(crate) fn parse_write_args(args: &[String]) -> SfResult<WriteArgs> {
    let mut sample_rate: Option<u32> = None;
    let mut bytes_per_sample = 2usize;
    let mut requested: Option<Endian> = None;
    let mut nframes = MAX_FRAMES;
    let mut onset = 0usize;
    let mut normalize = false;
    let mut meta: Vec<Vec<String>> = Vec::new();
    let mut format: Option<Arc<dyn SoundFileFormat>> = None;

    let mut rest = args;
    while let Some(token) = rest.first() {
        let Some(flag) = token.strip_prefix('-') else {
            break;
        };
        match flag {
            "skip" => {
                onset = rest
                    .get(1)
                    .and_then(|t| parse_count(t))
                    .ok_or_else(write_usage)?;
                rest = &rest[2..];
            }
            "nframes" => {
                nframes = rest
                    .get(1)
                    .and_then(|t| parse_count(t))
                    .ok_or_else(write_usage)?;
                rest = &rest[2..];
            }
            "bytes" => {
                bytes_per_sample = rest
                    .get(1)
                    .and_then(|t| parse_count(t))
                    .filter(|b| (2..=4).contains(b))
                    .ok_or_else(write_usage)?;
                rest = &rest[2..];
            }
            "normalize" => {
                normalize = true;
                rest = &rest[1..];
            }
            "big" => {
                requested = Some(Endian::Big);
                rest = &rest[1..];
            }
            "little" => {
                requested = Some(Endian::Little);
                rest = &rest[1..];
            }
            "rate" | "r" => {
                let rate = rest
                    .get(1)
                    .and_then(|t| parse_count(t))
                    .filter(|r| *r > 0)
                    .ok_or_else(write_usage)?;
                sample_rate = Some(rate as u32);
                rest = &rest[2..];
            }
            "meta" => {
                let group: Vec<String> = rest[1..]
                    .iter()
                    .take_while(|t| !t.starts_with('-'))
                    .cloned()
                    .collect();
                let taken = group.len();
                if group.is_empty() {
                    log::error!("ignoring empty -meta flag");
                } else if meta.len() == MAX_WRITE_META {
                    log::error!("max -meta flags reached, ignoring");
                } else {
                    meta.push(group);
                }
                rest = &rest[1 + taken..];
            }
            "-" => {
                rest = &rest[1..];
                break;
            }
            name => {
                format = Some(format::find_format(name).ok_or_else(write_usage)?);
                rest = &rest[1..];
            }
        }
    }
    if rest.is_empty() {
        return Err(write_usage());
    }
    let filename = rest[0].clone();
    let tables = rest[1..].to_vec();

    // deduce the format from the filename extension, else default to the
    // first registered format
    let format = format
        .or_else(|| {
            format::formats()
                .into_iter()
                .find(|f| f.has_extension(&filename))
        })
        .unwrap_or_else(|| format::formats()[0].clone());

    // the format has the last word on endianness
    let big_endian = format.endianness(requested) == Endian::Big;
    if let Some(asked) = requested {
        if (asked == Endian::Big) != big_endian {
            log::error!(
                "{}: file forced to {} endian",
                format.name(),
                if big_endian { "big" } else { "little" }
            );
        }
    }

    Ok(WriteArgs {
        filename,
        format,
        sample_rate,
        bytes_per_sample,
        big_endian,
        nframes,
        onset,
        normalize,
        meta,
        tables,
    })
}

/// `write [flags] filename table...`: transfer frames from the named
/// tables into a new soundfile.
pub fn write(env: &dyn AudioEnv, tables: &mut TableSet, args: &[String]) -> SfResult<WriteOutcome> {
    let mut wa = parse_write_args(args)?;
    if wa.tables.is_empty() || wa.tables.len() > MAX_CHANNELS {
        return Err(write_usage());
    }
    let indices = tables.select(&wa.tables)?;

    let mut sf = SoundFile::new();
    sf.format = Some(wa.format.clone());
    sf.set_geometry(indices.len(), wa.bytes_per_sample);
    sf.big_endian = wa.big_endian;
    sf.sample_rate = wa
        .sample_rate
        .unwrap_or_else(|| env.sample_rate() as u32);

    for &idx in &indices {
        let available = tables.index(idx).len().saturating_sub(wa.onset);
        wa.nframes = wa.nframes.min(available);
    }
    if wa.nframes == 0 {
        return Err(SfError::Usage(format!(
            "write: no samples at onset {}",
            wa.onset
        )));
    }

    // peak over the onset-to-end window of every channel
    let mut biggest = 0f32;
    for &idx in &indices {
        for &sample in &tables.index(idx).data()[wa.onset..wa.onset + wa.nframes] {
            biggest = biggest.max(sample.abs());
        }
    }

    let filename = complete_filename(&*wa.format, &wa.filename);
    let path = env.resolve_write(&filename);
    sf.file = Some(
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?,
    );
    wa.format.write_header(&mut sf, wa.nframes)?;

    if !wa.normalize {
        if sf.bytes_per_sample != 4 && biggest > 1.0 {
            log::info!("{}: reducing max amplitude {} to 1", filename, biggest);
            wa.normalize = true;
        } else {
            log::info!("{}: biggest amplitude = {}", filename, biggest);
        }
    }
    let normal = if wa.normalize && biggest > 0.0 {
        32767.0 / (32768.0 * biggest)
    } else {
        1.0
    };

    for group in &wa.meta {
        if let Err(err) = wa.format.write_metadata(&mut sf, group) {
            log::error!("write: writing {} metadata failed: {}", wa.format.name(), err);
        }
    }

    let buf_frames = SAMPBUF_SIZE / sf.bytes_per_frame;
    let mut sampbuf = [0u8; SAMPBUF_SIZE];
    let mut frames_written = 0usize;
    let mut onset = wa.onset;
    while frames_written < wa.nframes {
        let this = (wa.nframes - frames_written).min(buf_frames);
        let data_size = this * sf.bytes_per_frame;
        for (ch, &idx) in indices.iter().enumerate() {
            let table = tables.index(idx);
            let src = &table.data()[onset..onset + this];
            codec::encode_channel(
                sf.bytes_per_sample,
                sf.big_endian,
                sf.bytes_per_frame,
                src,
                &mut sampbuf[ch * sf.bytes_per_sample..data_size],
                normal,
            );
        }
        let written = match wa.format.write_samples(&mut sf, &sampbuf[..data_size]) {
            Ok(n) => n,
            Err(err) => {
                log::error!("{}: {}", filename, err);
                break;
            }
        };
        if written < data_size {
            log::error!("{}: short write", filename);
            frames_written += written / sf.bytes_per_frame;
            break;
        }
        frames_written += this;
        onset += this;
    }

    finish_write(&mut sf, &filename, wa.nframes, frames_written);
    let outcome = WriteOutcome {
        frames: frames_written,
        info: sf.info(),
    };
    sf.close();
    Ok(outcome)
}

/// Patch the header when fewer frames landed than were declared; used by
/// the batch writer and the streaming capture worker.
pub(crate) fn finish_write(
    sf: &mut SoundFile,
    filename: &str,
    nframes: usize,
    frames_written: usize,
) {
    if frames_written >= nframes {
        return;
    }
    if nframes < MAX_FRAMES {
        log::error!(
            "write: {} out of {} frames written",
            frames_written,
            nframes
        );
    }
    let format = match sf.format.clone() {
        Some(f) => f,
        None => return,
    };
    if let Err(err) = format.update_header(sf, frames_written) {
        log::error!("write: {}: {}", filename, err);
    }
}
