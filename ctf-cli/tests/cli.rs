//! Binary-level tests: run the `ctf` executable against generated traces
//! and check stdout/stderr.

use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

const UUID_STR: &str = "2a6422d0-6cee-11e0-8c08-cb07d7b3a564";
const UUID_BYTES: [u8; 16] = [
    0x2a, 0x64, 0x22, 0xd0, 0x6c, 0xee, 0x11, 0xe0, 0x8c, 0x08, 0xcb, 0x07, 0xd7, 0xb3, 0xa5, 0x64,
];
const CTF_MAGIC: u32 = 0xC1FC_1FC1;

fn metadata_text() -> String {
    format!(
        r#"/* CTF 1.8 */

typealias integer {{ size = 8; align = 8; signed = false; }} := uint8_t;
typealias integer {{ size = 32; align = 8; signed = false; }} := uint32_t;
typealias integer {{ size = 64; align = 8; signed = false; }} := uint64_t;

trace {{
    major = 1;
    minor = 8;
    uuid = "{UUID_STR}";
    byte_order = le;
    packet.header := struct {{
        uint32_t magic;
        uint8_t  uuid[16];
        uint32_t stream_id;
    }};
}};

clock {{
    name = monotonic;
    freq = 1000000000;
}};

stream {{
    id = 0;
    event.header := struct {{
        uint32_t id;
        uint64_t timestamp;
    }};
    packet.context := struct {{
        uint64_t content_size;
        uint64_t packet_size;
        uint64_t timestamp_begin;
        uint64_t timestamp_end;
        uint64_t events_discarded;
    }};
}};

event {{
    name = "probe";
    id = 0;
    stream_id = 0;
    fields := struct {{
        uint32_t x;
    }};
}};
"#
    )
}

/// One packet with 16-byte events `(id, timestamp, x)`
fn packet(events: &[(u32, u64, u32)], ts_range: (u64, u64), events_discarded: u64) -> Vec<u8> {
    let content_len = 24 + 40 + events.len() * 16;
    let mut buf = Vec::with_capacity(content_len);
    buf.extend_from_slice(&CTF_MAGIC.to_le_bytes());
    buf.extend_from_slice(&UUID_BYTES);
    buf.extend_from_slice(&0u32.to_le_bytes()); // stream_id
    buf.extend_from_slice(&(content_len as u64 * 8).to_le_bytes());
    buf.extend_from_slice(&(content_len as u64 * 8).to_le_bytes());
    buf.extend_from_slice(&ts_range.0.to_le_bytes());
    buf.extend_from_slice(&ts_range.1.to_le_bytes());
    buf.extend_from_slice(&events_discarded.to_le_bytes());
    for &(id, timestamp, x) in events {
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(&x.to_le_bytes());
    }
    buf
}

fn write_trace(dir: &Path, stream_data: Vec<u8>) {
    fs::write(dir.join("metadata"), metadata_text()).unwrap();
    fs::write(dir.join("stream_0"), stream_data).unwrap();
}

fn ctf() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ctf"))
}

#[test]
fn test_cli__info__then_trace_summary() {
    let dir = TempDir::new().unwrap();
    write_trace(dir.path(), packet(&[(0, 100, 1)], (100, 105), 0));

    let output = ctf().arg("info").arg(dir.path()).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains(UUID_STR));
    assert!(stdout.contains("byte order: le"));
    assert!(stdout.contains("monotonic"));
    assert!(stdout.contains("[0] probe"));
    assert!(stdout.contains("1 packets"));
}

#[test]
fn test_cli__events__then_decoded_payloads() {
    let dir = TempDir::new().unwrap();
    write_trace(dir.path(), packet(&[(0, 100, 0xDEADBEEF), (0, 200, 7)], (100, 205), 0));

    let output = ctf()
        .arg("events")
        .arg(dir.path())
        .arg("--clock-seconds")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 2);
    assert!(stdout.contains("probe: { x = 3735928559 }"));
    assert!(stdout.contains("probe: { x = 7 }"));
    assert!(stdout.contains("[  0.000000100]"));
}

#[test]
fn test_cli__events_with_limit__then_truncated() {
    let dir = TempDir::new().unwrap();
    write_trace(
        dir.path(),
        packet(&[(0, 1, 1), (0, 2, 2), (0, 3, 3)], (1, 3), 0),
    );

    let output = ctf()
        .arg("events")
        .arg(dir.path())
        .arg("--limit")
        .arg("2")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 2);
}

#[test]
fn test_cli__trailing_discards__then_single_stderr_warning() {
    // Two packets, cumulative discard counters 0 then 3: the trailing
    // delta is reported exactly once at end of stream.
    let dir = TempDir::new().unwrap();
    let mut data = packet(&[(0, 10, 1)], (10, 15), 0);
    data.extend_from_slice(&packet(&[(0, 20, 2)], (20, 25), 3));
    write_trace(dir.path(), data);

    let output = ctf()
        .arg("events")
        .arg(dir.path())
        .arg("--clock-seconds")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stderr = String::from_utf8(output.stderr).unwrap();
    let warnings: Vec<&str> = stderr
        .lines()
        .filter(|line| line.contains("Tracer discarded"))
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("3 events"));
    assert!(warnings[0].contains("] and ["));
}

#[test]
fn test_cli__missing_trace__then_failure() {
    let output = ctf().arg("info").arg("/no/such/trace").output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("failed to open trace"));
}
