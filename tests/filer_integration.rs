//! Batch reader/writer integration tests.
//!
//! These run the full command surface against real files in a temporary
//! directory: write a known signal, read it back, and check the frames,
//! the info tuple, and the on-disk bytes where the spec pins them down.

use std::sync::Arc;

use sndfiler::{filer, DirEnv, SfError, Table, TableSet};

fn strs(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

fn setup() -> (tempfile::TempDir, Arc<DirEnv>) {
    let dir = tempfile::tempdir().unwrap();
    let env = Arc::new(DirEnv::new(dir.path()).with_sample_rate(48000.0));
    (dir, env)
}

#[test]
fn test_write_read_roundtrip_16bit_stereo() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    let mut left = Table::new("left", 1000);
    let mut right = Table::new("right", 1000);
    left.data_mut().fill(0.5);
    right.data_mut().fill(-0.5);
    tables.insert(left);
    tables.insert(right);

    let written = filer::write(&*env, &mut tables, &strs(&["dc.wav", "left", "right"])).unwrap();
    assert_eq!(written.frames, 1000);

    let mut back = TableSet::new();
    back.insert(Table::new("a", 1000));
    back.insert(Table::new("b", 1000));
    let read = filer::read(&*env, &mut back, &strs(&["dc.wav", "a", "b"])).unwrap();
    assert_eq!(read.frames, 1000);
    let info = read.info.unwrap();
    assert_eq!(info.sample_rate, 48000);
    assert_eq!(info.channels, 2);
    assert_eq!(info.bytes_per_sample, 2);
    assert_eq!(info.endian, 'l');
    assert_eq!(info.header_size, 44);

    for &sample in back.get("a").unwrap().data() {
        assert!((sample - 0.5).abs() <= 1.0 / 32768.0);
    }
    for &sample in back.get("b").unwrap().data() {
        assert!((sample + 0.5).abs() <= 1.0 / 32768.0);
    }
    assert!(back.get_mut("a").unwrap().take_dirty());
}

#[test]
fn test_raw_read_float_ramp() {
    let (dir, env) = setup();
    let mut bytes = Vec::new();
    for i in 0..128 {
        bytes.extend_from_slice(&(i as f32 / 128.0).to_le_bytes());
    }
    std::fs::write(dir.path().join("ramp.f32"), &bytes).unwrap();

    let mut tables = TableSet::new();
    tables.insert(Table::new("t", 128));
    let read = filer::read(
        &*env,
        &mut tables,
        &strs(&["-raw", "0", "1", "4", "l", "ramp.f32", "t"]),
    )
    .unwrap();
    assert_eq!(read.frames, 128);
    let table = tables.get_mut("t").unwrap();
    for (i, &sample) in table.data().iter().enumerate() {
        assert_eq!(sample.to_bits(), (i as f32 / 128.0).to_bits());
    }
    assert!(table.take_dirty());
}

#[test]
fn test_normalize_peak_two_hits_full_scale() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    let mut t = Table::new("t", 64);
    t.data_mut().fill(1.0);
    t.data_mut()[0] = 2.0;
    t.data_mut()[1] = -2.0;
    tables.insert(t);

    filer::write(&*env, &mut tables, &strs(&["-normalize", "n.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("o", 64));
    filer::read(&*env, &mut back, &strs(&["n.wav", "o"])).unwrap();
    let data = back.get("o").unwrap().data();
    assert!((data[0] - 32767.0 / 32768.0).abs() < 1e-6);
    assert!((data[1] + 32767.0 / 32768.0).abs() < 1e-6);
}

#[test]
fn test_24bit_big_endian_exact_bytes() {
    let (dir, env) = setup();
    let mut tables = TableSet::new();
    let mut t = Table::new("t", 3);
    t.data_mut().copy_from_slice(&[1.0, 0.0, -1.0]);
    tables.insert(t);

    let written = filer::write(
        &*env,
        &mut tables,
        &strs(&["-bytes", "3", "-big", "-aiff", "sat", "t"]),
    )
    .unwrap();
    assert_eq!(written.frames, 3);
    assert_eq!(written.info.endian, 'b');

    let bytes = std::fs::read(dir.path().join("sat.aif")).unwrap();
    let payload = &bytes[written.info.header_size..written.info.header_size + 9];
    assert_eq!(
        payload,
        &[0x7f, 0xff, 0xff, 0x00, 0x00, 0x00, 0x80, 0x00, 0x01]
    );
}

#[test]
fn test_skip_and_nframes_window() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    let mut t = Table::new("t", 100);
    for (i, sample) in t.data_mut().iter_mut().enumerate() {
        *sample = i as f32 / 200.0;
    }
    tables.insert(t);
    // write frames 10..30
    let written = filer::write(
        &*env,
        &mut tables,
        &strs(&["-skip", "10", "-nframes", "20", "w.wav", "t"]),
    )
    .unwrap();
    assert_eq!(written.frames, 20);

    let mut back = TableSet::new();
    back.insert(Table::new("o", 0));
    let read = filer::read(&*env, &mut back, &strs(&["-resize", "w.wav", "o"])).unwrap();
    assert_eq!(read.frames, 20);
    let data = back.get("o").unwrap().data();
    assert!((data[0] - 10.0 / 200.0).abs() <= 1.0 / 32768.0);
    assert!((data[19] - 29.0 / 200.0).abs() <= 1.0 / 32768.0);
}

#[test]
fn test_read_skip_offsets_into_file() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    let mut t = Table::new("t", 50);
    for (i, sample) in t.data_mut().iter_mut().enumerate() {
        *sample = i as f32 / 100.0;
    }
    tables.insert(t);
    filer::write(&*env, &mut tables, &strs(&["s.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("o", 0));
    let read = filer::read(
        &*env,
        &mut back,
        &strs(&["-skip", "30", "-resize", "s.wav", "o"]),
    )
    .unwrap();
    assert_eq!(read.frames, 20);
    let data = back.get("o").unwrap().data();
    assert!((data[0] - 30.0 / 100.0).abs() <= 1.0 / 32768.0);
}

#[test]
fn test_maxsize_truncates() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    tables.insert(Table::new("t", 500));
    filer::write(&*env, &mut tables, &strs(&["long.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("o", 0));
    let read = filer::read(
        &*env,
        &mut back,
        &strs(&["-maxsize", "100", "long.wav", "o"]),
    )
    .unwrap();
    assert_eq!(read.frames, 100);
    assert_eq!(back.get("o").unwrap().len(), 100);
}

#[test]
fn test_resize_clears_save_flag() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    tables.insert(Table::new("t", 64));
    filer::write(&*env, &mut tables, &strs(&["r.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    let mut o = Table::new("o", 16);
    o.set_save_in_patch(true);
    back.insert(o);
    filer::read(&*env, &mut back, &strs(&["-resize", "r.wav", "o"])).unwrap();
    assert_eq!(back.get("o").unwrap().len(), 64);
    assert!(!back.get("o").unwrap().save_in_patch());
}

#[test]
fn test_excess_tables_are_silenced() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    let mut t = Table::new("t", 32);
    t.data_mut().fill(0.25);
    tables.insert(t);
    filer::write(&*env, &mut tables, &strs(&["mono.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("a", 32));
    let mut b = Table::new("b", 32);
    b.data_mut().fill(0.9); // stale content must be cleared
    back.insert(b);
    let read = filer::read(&*env, &mut back, &strs(&["mono.wav", "a", "b"])).unwrap();
    assert_eq!(read.frames, 32);
    assert!(back.get("b").unwrap().data().iter().all(|&s| s == 0.0));
}

#[test]
fn test_short_file_zero_fills_tail() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    let mut t = Table::new("t", 10);
    t.data_mut().fill(0.5);
    tables.insert(t);
    filer::write(&*env, &mut tables, &strs(&["short.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    let mut o = Table::new("o", 40);
    o.data_mut().fill(0.9);
    back.insert(o);
    let read = filer::read(&*env, &mut back, &strs(&["short.wav", "o"])).unwrap();
    assert_eq!(read.frames, 10);
    let data = back.get("o").unwrap().data();
    assert!(data[10..].iter().all(|&s| s == 0.0));
}

#[test]
fn test_read_without_tables_reports_length() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    tables.insert(Table::new("t", 777));
    filer::write(&*env, &mut tables, &strs(&["len.wav", "t"])).unwrap();

    let mut none = TableSet::new();
    let read = filer::read(&*env, &mut none, &strs(&["len.wav"])).unwrap();
    assert_eq!(read.frames, 777);
}

#[test]
fn test_ascii_read() {
    let (dir, env) = setup();
    std::fs::write(dir.path().join("vals.txt"), "0.0 0.5\n-0.5 1.0\n0.25 -0.25\n").unwrap();
    let mut tables = TableSet::new();
    tables.insert(Table::new("a", 0));
    tables.insert(Table::new("b", 0));
    let read = filer::read(
        &*env,
        &mut tables,
        &strs(&["-ascii", "-resize", "vals.txt", "a", "b"]),
    )
    .unwrap();
    assert_eq!(read.frames, 3);
    assert!(read.info.is_none());
    assert_eq!(tables.get("a").unwrap().data(), &[0.0, -0.5, 0.25]);
    assert_eq!(tables.get("b").unwrap().data(), &[0.5, 1.0, -0.25]);
}

#[test]
fn test_metadata_passthrough() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    tables.insert(Table::new("t", 16));
    filer::write(
        &*env,
        &mut tables,
        &strs(&["-meta", "ICMT", "take", "one", "m.wav", "t"]),
    )
    .unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("o", 16));
    let read = filer::read(&*env, &mut back, &strs(&["-meta", "m.wav", "o"])).unwrap();
    assert_eq!(read.frames, 16);
    assert_eq!(
        read.metadata,
        vec![("ICMT".to_string(), "take one".to_string())]
    );
}

#[test]
fn test_format_roundtrips_all_containers() {
    let (_dir, env) = setup();
    for (flag, file, endian) in [
        ("-wave", "all.wav", 'l'),
        ("-aiff", "all.aif", 'b'),
        ("-caf", "all.caf", 'b'),
        ("-next", "all.snd", 'b'),
    ] {
        let mut tables = TableSet::new();
        let mut t = Table::new("t", 200);
        for (i, sample) in t.data_mut().iter_mut().enumerate() {
            *sample = ((i as f32) / 100.0).sin() * 0.8;
        }
        let reference = t.data().to_vec();
        tables.insert(t);
        let written =
            filer::write(&*env, &mut tables, &strs(&[flag, "-bytes", "3", file, "t"])).unwrap();
        assert_eq!(written.frames, 200, "{}", flag);
        assert_eq!(written.info.endian, endian, "{}", flag);

        let mut back = TableSet::new();
        back.insert(Table::new("o", 0));
        let read = filer::read(&*env, &mut back, &strs(&["-resize", file, "o"])).unwrap();
        assert_eq!(read.frames, 200, "{}", flag);
        let info = read.info.unwrap();
        assert_eq!(info.bytes_per_sample, 3, "{}", flag);
        for (a, b) in reference.iter().zip(back.get("o").unwrap().data()) {
            assert!((a - b).abs() <= 1.0 / 8_388_608.0, "{}", flag);
        }
    }
}

#[test]
fn test_float_roundtrip_bitexact_through_wave() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    let mut t = Table::new("t", 256);
    for (i, sample) in t.data_mut().iter_mut().enumerate() {
        *sample = ((i as f32) / 10.0).sin() * 0.99;
    }
    let reference = t.data().to_vec();
    tables.insert(t);
    filer::write(&*env, &mut tables, &strs(&["-bytes", "4", "f.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("o", 0));
    filer::read(&*env, &mut back, &strs(&["-resize", "f.wav", "o"])).unwrap();
    for (a, b) in reference.iter().zip(back.get("o").unwrap().data()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn test_bad_header_reported() {
    let (dir, env) = setup();
    std::fs::write(dir.path().join("junk.wav"), b"this is not audio").unwrap();
    let mut tables = TableSet::new();
    tables.insert(Table::new("t", 8));
    let err = filer::read(&*env, &mut tables, &strs(&["junk.wav", "t"]));
    assert!(matches!(err, Err(SfError::BadHeader(_))));
}

#[test]
fn test_forced_format_mismatch_rejected() {
    let (_dir, env) = setup();
    let mut tables = TableSet::new();
    tables.insert(Table::new("t", 8));
    filer::write(&*env, &mut tables, &strs(&["w.wav", "t"])).unwrap();

    let mut back = TableSet::new();
    back.insert(Table::new("o", 8));
    let err = filer::read(&*env, &mut back, &strs(&["-aiff", "w.wav", "o"]));
    assert!(matches!(err, Err(SfError::BadHeader(_))));
}
