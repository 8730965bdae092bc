#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use jlog::log::RecordKind;
use jlog::primitives::io::{FileIo, StdFileIo};
use jlog::{LogManager, LogOptions, LogRecord};
use serde_json::Value;
use tempfile::TempDir;

fn workspace() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let device = dir.path().join("log.img");
    let config = dir.path().join("cli.toml");
    (dir, device, config)
}

fn json(config: &Path, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(config)
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

fn format_device(config: &Path, device: &Path, pages: &str) {
    cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(config)
        .arg("format")
        .arg(device)
        .args(["--pages", pages])
        .assert()
        .success();
}

#[test]
fn format_then_inspect_reports_a_clean_log() {
    let (_dir, device, config) = workspace();
    format_device(&config, &device, "32");

    let device_arg = device.to_str().unwrap();
    let sb = json(&config, &["inspect", device_arg]);
    assert_eq!(sb["state"], "clean");
    assert_eq!(sb["pages"], 32);
    assert_eq!(sb["block_size"], 4096);
    assert_eq!(sb["end_page"], 2);
    assert_eq!(sb["end_offset"], 16);
    assert_eq!(sb["active"].as_array().map(Vec::len), Some(0));

    let end = json(&config, &["locate-end", device_arg]);
    assert_eq!(end["page"], 2);
    assert_eq!(end["sequence"], 29);
    assert_eq!(end["eor"], 16);
}

#[test]
fn dump_decodes_records_written_by_the_library() {
    let (_dir, device, config) = workspace();
    format_device(&config, &device, "32");

    {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&device).unwrap());
        let manager = LogManager::new().unwrap();
        let log = manager.open(io, LogOptions::external(32)).unwrap();
        for arg in [7, 8, 9] {
            log.append(None, LogRecord::new(RecordKind::UpdateMap).with_arg(arg), None)
                .unwrap();
        }
        log.shutdown().unwrap();
    }

    let device_arg = device.to_str().unwrap();
    let report = json(&config, &["dump", device_arg, "--from", "29:16"]);
    assert!(report["error"].is_null());
    let records = report["records"].as_array().unwrap();
    let kinds: Vec<_> = records.iter().map(|r| r["kind"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        ["checkpoint", "update-map", "update-map", "update-map", "checkpoint"]
    );
    assert_eq!(records[1]["arg"], 7);
    assert_eq!(records[1]["start"], "29:48");
    assert!(records[1].get("data").is_none());

    let limited = json(&config, &["dump", device_arg, "--limit", "2", "--hex"]);
    let records = limited["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["data"], "");

    let inspected = json(&config, &["inspect", device_arg]);
    assert_eq!(inspected["serial"], 1);
    assert_eq!(inspected["end_offset"], 16 + 32 * 5);
}

#[test]
fn dump_rejects_a_malformed_start() {
    let (_dir, device, config) = workspace();
    format_device(&config, &device, "16");
    cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(&config)
        .arg("dump")
        .arg(&device)
        .args(["--from", "not-an-lsn"])
        .assert()
        .failure();
}

#[test]
fn inspect_of_an_unformatted_device_fails() {
    let (_dir, device, config) = workspace();
    std::fs::write(&device, vec![0u8; 8192]).unwrap();
    cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(&config)
        .arg("inspect")
        .arg(&device)
        .assert()
        .failure();
}

#[test]
fn profiles_supply_device_and_geometry() {
    let (_dir, device, config) = workspace();
    cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(&config)
        .args(["profile", "set", "small", "--pages", "16", "--device"])
        .arg(&device)
        .arg("--default")
        .assert()
        .success();

    let listed = json(&config, &["profile", "list"]);
    assert_eq!(listed["default"], "small");
    assert_eq!(listed["profiles"][0]["name"], "small");
    assert_eq!(listed["profiles"][0]["pages"], 16);

    cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(&config)
        .arg("format")
        .assert()
        .success();
    let sb = json(&config, &["inspect"]);
    assert_eq!(sb["pages"], 16);

    cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(&config)
        .args(["profile", "delete", "small"])
        .assert()
        .success();
    let listed = json(&config, &["profile", "list"]);
    assert!(listed["default"].is_null());
    assert_eq!(listed["profiles"].as_array().map(Vec::len), Some(0));

    cargo_bin_cmd!("jlog")
        .arg("--config")
        .arg(&config)
        .args(["--profile", "small", "inspect"])
        .assert()
        .failure();
}
