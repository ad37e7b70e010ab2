//! Exercises the command-line driver end to end.

use std::fs::OpenOptions;
use std::path::PathBuf;

use assert_cmd::Command;
use tempfile::TempDir;

fn image(dir: &TempDir, sectors: u64) -> PathBuf {
    let path = dir.path().join("disk.img");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .unwrap();
    file.set_len(sectors * 1024).unwrap();
    path
}

fn ssfs() -> Command {
    Command::cargo_bin("ssfs").unwrap()
}

#[test]
fn full_command_cycle() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, 64);

    ssfs().arg("format").arg(&path).arg("32").assert().success();
    ssfs().arg("mount").arg(&path).assert().success();

    ssfs()
        .arg("create")
        .arg(&path)
        .assert()
        .success()
        .stdout("0\n");

    ssfs()
        .args(["write"])
        .arg(&path)
        .args(["0", "hello", "5", "0"])
        .assert()
        .success()
        .stdout("5 bytes written\n");

    ssfs()
        .arg("stat")
        .arg(&path)
        .arg("0")
        .assert()
        .success()
        .stdout("5\n");

    ssfs()
        .arg("read")
        .arg(&path)
        .args(["0", "5", "0"])
        .assert()
        .success()
        .stdout("68656c6c6f\n5 bytes read\n");

    ssfs()
        .arg("blocks")
        .arg(&path)
        .arg("0")
        .assert()
        .success()
        .stdout("2\n");

    ssfs().arg("delete").arg(&path).arg("0").assert().success();

    // deleted: stat now fails with the "unused inode" code
    ssfs()
        .arg("stat")
        .arg(&path)
        .arg("0")
        .assert()
        .failure()
        .code(12);
}

#[test]
fn unmount_without_a_mount_fails() {
    ssfs().arg("unmount").assert().failure().code(1);
}

#[test]
fn missing_image_reports_not_exist() {
    let dir = TempDir::new().unwrap();
    ssfs()
        .arg("stat")
        .arg(dir.path().join("missing.img"))
        .arg("0")
        .assert()
        .failure()
        .code(3);
}

#[test]
fn negative_ranges_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, 64);
    ssfs().arg("format").arg(&path).arg("1").assert().success();
    ssfs().arg("create").arg(&path).assert().success();

    ssfs()
        .arg("read")
        .arg(&path)
        .args(["0", "-1", "0"])
        .assert()
        .failure()
        .code(15);

    ssfs()
        .arg("write")
        .arg(&path)
        .args(["0", "abc", "3", "-4"])
        .assert()
        .failure()
        .code(15);
}

#[test]
fn script_mode_runs_clean() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, 64);
    ssfs().arg("script").arg(&path).assert().success();
}
