//! Streaming engine integration tests.
//!
//! These drive real worker threads against files in a temporary
//! directory, playing the role of the audio thread: repeated `perform`
//! ticks with a fixed vector size. The batch engine writes the fixtures
//! and verifies the capture results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sndfiler::{filer, DirEnv, StreamReader, StreamWriter, Table, TableSet};

const TICK: usize = 64;

fn strs(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

fn setup() -> (tempfile::TempDir, Arc<DirEnv>) {
    let dir = tempfile::tempdir().unwrap();
    let env = Arc::new(DirEnv::new(dir.path()).with_sample_rate(48000.0));
    (dir, env)
}

/// Write a stereo 16-bit fixture with a per-frame ramp and return the
/// decoded reference signal (what any correct reader must produce).
fn write_ramp_fixture(env: &Arc<DirEnv>, name: &str, frames: usize) -> (Vec<f32>, Vec<f32>) {
    let mut tables = TableSet::new();
    let mut left = Table::new("l", frames);
    let mut right = Table::new("r", frames);
    for i in 0..frames {
        left.data_mut()[i] = i as f32 / frames as f32;
        right.data_mut()[i] = -(i as f32) / frames as f32;
    }
    tables.insert(left);
    tables.insert(right);
    filer::write(&**env, &mut tables, &strs(&[name, "l", "r"])).unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("l", 0));
    back.insert(Table::new("r", 0));
    filer::read(&**env, &mut back, &strs(&["-resize", name, "l", "r"])).unwrap();
    (
        back.get("l").unwrap().data().to_vec(),
        back.get("r").unwrap().data().to_vec(),
    )
}

fn wait_until_inactive(active: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while active() {
        assert!(Instant::now() < deadline, "worker did not settle");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_playback_delivers_every_frame_and_fires_done_once() {
    let (_dir, env) = setup();
    let frames = 8000;
    let (ref_l, ref_r) = write_ramp_fixture(&env, "play.wav", frames);

    let reader = StreamReader::new(env.clone(), 2, None).unwrap();
    reader.set_vector_size(TICK);
    reader.open(&strs(&["play.wav"])).unwrap();
    reader.start().unwrap();

    let mut got_l = Vec::new();
    let mut got_r = Vec::new();
    let mut done_count = 0;
    let mut left = vec![0.0f32; TICK];
    let mut right = vec![0.0f32; TICK];
    for _tick in 0..(frames / TICK + 4) {
        {
            let mut outs: Vec<&mut [f32]> = vec![&mut left, &mut right];
            reader.perform(&mut outs);
        }
        if reader.done_receiver().try_recv().is_ok() {
            done_count += 1;
        } else if done_count == 0 {
            got_l.extend_from_slice(&left);
            got_r.extend_from_slice(&right);
        }
    }

    assert_eq!(done_count, 1, "done must fire exactly once");
    assert_eq!(got_l.len(), frames);
    assert_eq!(got_l, ref_l);
    assert_eq!(got_r, ref_r);

    // after the done pulse the object idles and emits silence
    let mut outs: Vec<&mut [f32]> = vec![&mut left, &mut right];
    reader.perform(&mut outs);
    assert!(left.iter().all(|&s| s == 0.0));
    assert!(reader.done_receiver().try_recv().is_err());
}

#[test]
fn test_second_open_supersedes_first() {
    let (_dir, env) = setup();
    write_ramp_fixture(&env, "first.wav", 4000);

    // a recognizable DC level marks the second file
    let mut tables = TableSet::new();
    let mut l = Table::new("l", 1024);
    let mut r = Table::new("r", 1024);
    l.data_mut().fill(0.25);
    r.data_mut().fill(0.25);
    tables.insert(l);
    tables.insert(r);
    filer::write(&*env, &mut tables, &strs(&["second.wav", "l", "r"])).unwrap();

    let reader = StreamReader::new(env.clone(), 2, None).unwrap();
    reader.set_vector_size(TICK);
    reader.open(&strs(&["first.wav"])).unwrap();
    reader.open(&strs(&["second.wav"])).unwrap();
    reader.start().unwrap();

    let mut left = vec![0.0f32; TICK];
    let mut right = vec![0.0f32; TICK];
    {
        let mut outs: Vec<&mut [f32]> = vec![&mut left, &mut right];
        reader.perform(&mut outs);
    }
    for &sample in &left {
        assert!((sample - 0.25).abs() <= 1.0 / 32768.0);
    }

    // drain the rest; the abandoned first open must not surface an error
    let mut done = false;
    for _ in 0..(1024 / TICK + 4) {
        let mut outs: Vec<&mut [f32]> = vec![&mut left, &mut right];
        reader.perform(&mut outs);
        if reader.done_receiver().try_recv().is_ok() {
            done = true;
        }
    }
    assert!(done);
}

#[test]
fn test_open_missing_file_reports_and_idles() {
    let (_dir, env) = setup();
    let reader = StreamReader::new(env.clone(), 1, None).unwrap();
    reader.set_vector_size(TICK);
    reader.open(&strs(&["nope.wav"])).unwrap();
    reader.start().unwrap();

    let mut out = vec![0.9f32; TICK];
    {
        let mut outs: Vec<&mut [f32]> = vec![&mut out];
        reader.perform(&mut outs);
    }
    // the failed open surfaces as an immediate done with silence
    assert!(reader.done_receiver().try_recv().is_ok());
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn test_start_without_open_errors() {
    let (_dir, env) = setup();
    let reader = StreamReader::new(env.clone(), 1, None).unwrap();
    assert!(reader.start().is_err());
    let writer = StreamWriter::new(env.clone(), 1, None).unwrap();
    assert!(writer.start().is_err());
}

#[test]
fn test_raw_streaming_playback() {
    let (dir, env) = setup();
    // headerless little-endian 16-bit mono ramp
    let frames = 2048;
    let mut bytes = Vec::new();
    for i in 0..frames {
        bytes.extend_from_slice(&((i * 8) as i16).to_le_bytes());
    }
    std::fs::write(dir.path().join("raw.pcm"), &bytes).unwrap();

    let reader = StreamReader::new(env.clone(), 1, None).unwrap();
    reader.set_vector_size(TICK);
    // onset 0, headersize -1 (headerless), 1 channel, 2 bytes, little
    reader
        .open(&strs(&["raw.pcm", "0", "-1", "1", "2", "l"]))
        .unwrap();
    reader.start().unwrap();

    let mut out = vec![0.0f32; TICK];
    let mut collected = Vec::new();
    let mut done = false;
    for _ in 0..(frames / TICK + 4) {
        {
            let mut outs: Vec<&mut [f32]> = vec![&mut out];
            reader.perform(&mut outs);
        }
        if reader.done_receiver().try_recv().is_ok() {
            done = true;
        } else if !done {
            collected.extend_from_slice(&out);
        }
    }
    assert!(done);
    assert_eq!(collected.len(), frames);
    for (i, &sample) in collected.iter().enumerate() {
        let expect = (i * 8) as f32 / 32768.0;
        assert!((sample - expect).abs() <= 1.0 / 32768.0, "frame {}", i);
    }
}

#[test]
fn test_capture_roundtrip() {
    let (_dir, env) = setup();
    let writer = StreamWriter::new(env.clone(), 1, None).unwrap();
    writer.set_vector_size(TICK);
    writer.open(&strs(&["cap.wav"])).unwrap();
    writer.start().unwrap();

    let ticks = 100;
    for tick in 0..ticks {
        let mut input = vec![0.0f32; TICK];
        for (i, sample) in input.iter_mut().enumerate() {
            *sample = ((tick * TICK + i) as f32) / (ticks * TICK) as f32 * 0.5;
        }
        writer.perform(&[&input]);
    }
    writer.stop();
    wait_until_inactive(|| writer.is_active());

    let mut back = TableSet::new();
    back.insert(Table::new("o", 0));
    let read = filer::read(&*env, &mut back, &strs(&["-resize", "cap.wav", "o"])).unwrap();
    assert_eq!(read.frames, ticks * TICK);
    let data = back.get("o").unwrap().data();
    for (i, &sample) in data.iter().enumerate() {
        let expect = (i as f32) / (ticks * TICK) as f32 * 0.5;
        assert!((sample - expect).abs() <= 1.0 / 32768.0, "frame {}", i);
    }
}

#[test]
fn test_capture_metadata_before_start() {
    let (_dir, env) = setup();
    let writer = StreamWriter::new(env.clone(), 1, None).unwrap();
    writer.set_vector_size(TICK);
    writer.open(&strs(&["meta.wav"])).unwrap();
    writer.meta(&strs(&["IART", "stream", "test"])).unwrap();
    writer.start().unwrap();
    // metadata after start is refused
    assert!(writer.meta(&strs(&["ICMT", "late"])).is_err());

    let input = vec![0.1f32; TICK];
    for _ in 0..4 {
        writer.perform(&[&input]);
    }
    writer.stop();
    wait_until_inactive(|| writer.is_active());

    let mut back = TableSet::new();
    back.insert(Table::new("o", 0));
    let read = filer::read(&*env, &mut back, &strs(&["-meta", "-resize", "meta.wav", "o"]))
        .unwrap();
    assert_eq!(read.frames, 4 * TICK);
    assert_eq!(
        read.metadata,
        vec![("IART".to_string(), "stream test".to_string())]
    );
}

#[test]
fn test_capture_stop_before_start_leaves_empty_file() {
    let (dir, env) = setup();
    let writer = StreamWriter::new(env.clone(), 1, None).unwrap();
    writer.open(&strs(&["empty.wav"])).unwrap();
    // a stop can supersede an open the worker has not picked up yet, so
    // let the create land before stopping
    let path = dir.path().join("empty.wav");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "worker never created the file");
        std::thread::sleep(Duration::from_millis(5));
    }
    writer.stop();
    wait_until_inactive(|| writer.is_active());

    let mut back = TableSet::new();
    let read = filer::read(&*env, &mut back, &strs(&["empty.wav"])).unwrap();
    assert_eq!(read.frames, 0);
}

#[test]
fn test_drop_joins_worker_in_every_state() {
    let (_dir, env) = setup();

    // idle
    let reader = StreamReader::new(env.clone(), 1, None).unwrap();
    drop(reader);

    // mid-open
    write_ramp_fixture(&env, "d.wav", 4000);
    let reader = StreamReader::new(env.clone(), 2, None).unwrap();
    reader.open(&strs(&["d.wav"])).unwrap();
    drop(reader);

    // streaming
    let reader = StreamReader::new(env.clone(), 2, None).unwrap();
    reader.set_vector_size(TICK);
    reader.open(&strs(&["d.wav"])).unwrap();
    reader.start().unwrap();
    let mut l = vec![0.0f32; TICK];
    let mut r = vec![0.0f32; TICK];
    {
        let mut outs: Vec<&mut [f32]> = vec![&mut l, &mut r];
        reader.perform(&mut outs);
    }
    drop(reader);

    // capture mid-stream
    let writer = StreamWriter::new(env.clone(), 1, None).unwrap();
    writer.set_vector_size(TICK);
    writer.open(&strs(&["dw.wav"])).unwrap();
    writer.start().unwrap();
    let input = vec![0.2f32; TICK];
    writer.perform(&[&input]);
    drop(writer);
}

#[test]
fn test_stop_then_reopen_streams_again() {
    let (_dir, env) = setup();
    write_ramp_fixture(&env, "a.wav", 2048);
    let (dc_l, _dc_r) = {
        let mut tables = TableSet::new();
        let mut l = Table::new("l", 2048);
        let mut r = Table::new("r", 2048);
        l.data_mut().fill(-0.125);
        r.data_mut().fill(0.125);
        tables.insert(l);
        tables.insert(r);
        filer::write(&*env, &mut tables, &strs(&["b.wav", "l", "r"])).unwrap();
        (-0.125f32, 0.125f32)
    };

    let reader = StreamReader::new(env.clone(), 2, None).unwrap();
    reader.set_vector_size(TICK);
    reader.open(&strs(&["a.wav"])).unwrap();
    reader.start().unwrap();
    let mut l = vec![0.0f32; TICK];
    let mut r = vec![0.0f32; TICK];
    for _ in 0..4 {
        let mut outs: Vec<&mut [f32]> = vec![&mut l, &mut r];
        reader.perform(&mut outs);
    }
    reader.stop();
    wait_until_inactive(|| reader.is_active());

    reader.open(&strs(&["b.wav"])).unwrap();
    reader.start().unwrap();
    {
        let mut outs: Vec<&mut [f32]> = vec![&mut l, &mut r];
        reader.perform(&mut outs);
    }
    for &sample in &l {
        assert!((sample - dc_l).abs() <= 1.0 / 32768.0);
    }
}
