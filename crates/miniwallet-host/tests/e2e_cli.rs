use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("fixtures")
        .join("miniapps")
}

fn run(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_miniwallet"))
        .env("MINIWALLET_HOME", home)
        .env("MINIWALLET_KDF_PROFILE", "light")
        .env_remove("MINIWALLET_PASSWORD")
        .env_remove("MINIWALLET_SCAN_TTL_SECS")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("run miniwallet {args:?} failed: {e}"))
}

fn run_ok(home: &Path, args: &[&str]) -> String {
    let out = run(home, args);
    assert!(
        out.status.success(),
        "miniwallet {args:?} failed: status={:?}, stdout={}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn json_lines(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap_or_else(|e| panic!("bad json line {line}: {e}")))
        .collect()
}

#[test]
fn e2e_bundled_install_scan_and_uninstall() {
    let home = unique_temp_dir("miniwallet-e2e-bundled");
    let _cleanup = CleanupDir(home.clone());
    let bundle = fixtures_dir();

    let report = json_lines(&run_ok(&home, &["install-bundled", "--from", bundle.to_str().unwrap()]));
    let installed = report[0]["installed"].as_array().unwrap();
    assert_eq!(installed.len(), 2, "report: {report:?}");

    // 再次安装：版本未变化，全部跳过
    let again = json_lines(&run_ok(&home, &["install-bundled", "--from", bundle.to_str().unwrap()]));
    assert_eq!(again[0]["skipped"].as_array().unwrap().len(), 2);

    assert_eq!(run_ok(&home, &["list"]).lines().collect::<Vec<_>>(), vec!["eth-wallet", "notes"]);

    let apps = json_lines(&run_ok(&home, &["scan", "--force"]));
    assert_eq!(apps.len(), 2);
    let wallet = apps.iter().find(|a| a["app_id"] == "eth-wallet").unwrap();
    assert_eq!(wallet["entry_point"], "index.html");
    assert_eq!(wallet["balance"], "0 ETH");
    assert!(wallet["icon_path"].as_str().unwrap().ends_with("app_icon.png"));
    let notes = apps.iter().find(|a| a["app_id"] == "notes").unwrap();
    assert_eq!(notes["entry_point"], "home.html");
    assert!(notes["balance"].is_null());

    let first = json_lines(&run_ok(&home, &["uninstall", "notes"]));
    assert_eq!(first[0]["removed"], true);
    let second = json_lines(&run_ok(&home, &["uninstall", "notes"]));
    assert_eq!(second[0]["removed"], false);

    run_ok(&home, &["uninstall", "eth-wallet"]);
    let empty = run_ok(&home, &["scan"]);
    assert!(empty.contains("尚未安装任何小程序"), "stdout: {empty}");
}

#[test]
fn e2e_install_single_archive() {
    let home = unique_temp_dir("miniwallet-e2e-archive");
    let _cleanup = CleanupDir(home.clone());

    let archive = home.join("x.zip");
    let file = std::fs::File::create(&archive).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("manifest.json", options).unwrap();
    zip.write_all(br#"{"app_id":"x","name":"X","version":"1.0","type":"blockchain","pages":["index"]}"#)
        .unwrap();
    zip.start_file("index.html", options).unwrap();
    zip.write_all(b"<html></html>").unwrap();
    zip.finish().unwrap();

    let installed = json_lines(&run_ok(&home, &["install", "x", "--archive", archive.to_str().unwrap()]));
    assert_eq!(installed[0]["version"], "1.0");

    let apps = json_lines(&run_ok(&home, &["scan"]));
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0]["app_id"], "x");
    assert_eq!(apps[0]["entry_point"], "index.html");

    let broken = home.join("broken.zip");
    std::fs::write(&broken, b"not a zip").unwrap();
    let out = run(&home, &["install", "y", "--archive", broken.to_str().unwrap()]);
    assert!(!out.status.success());
    assert_eq!(run_ok(&home, &["list"]).trim(), "x");
}

#[test]
fn e2e_password_lifecycle() {
    let home = unique_temp_dir("miniwallet-e2e-password");
    let _cleanup = CleanupDir(home.clone());

    let status = json_lines(&run_ok(&home, &["password", "status"]));
    assert_eq!(status[0]["has_password"], false);

    run_ok(&home, &["password", "set", "--password", "hunter2"]);
    run_ok(&home, &["password", "verify", "--password", "hunter2"]);

    let wrong = run(&home, &["password", "verify", "--password", "wrong"]);
    assert_eq!(wrong.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&wrong.stderr).contains("密码错误"));

    let prefs = std::fs::read_to_string(home.join("prefs.json")).unwrap();
    assert!(!prefs.contains("hunter2"));

    run_ok(&home, &["password", "clear"]);
    let status = json_lines(&run_ok(&home, &["password", "status"]));
    assert_eq!(status[0]["has_password"], false);
}

#[test]
fn e2e_keystore_encrypt_decrypt() {
    let home = unique_temp_dir("miniwallet-e2e-keystore");
    let _cleanup = CleanupDir(home.clone());
    let key = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    let encrypted = json_lines(&run_ok(
        &home,
        &[
            "keystore",
            "encrypt",
            "--address",
            "0x2C7536E3605D9C16a7a3D7b1898e529396a65c23",
            "--private-key",
            key,
            "--password",
            "testpassword",
        ],
    ));
    let path = encrypted[0]["path"].as_str().unwrap().to_string();
    assert!(Path::new(&path).exists());
    assert_eq!(encrypted[0]["address"], "2c7536e3605d9c16a7a3d7b1898e529396a65c23");

    let decrypted = json_lines(&run_ok(
        &home,
        &["keystore", "decrypt", "--file", &path, "--password", "testpassword", "--reveal"],
    ));
    assert_eq!(decrypted[0]["private_key"], key);

    let wrong = run(&home, &["keystore", "decrypt", "--file", &path, "--password", "nope"]);
    assert_eq!(wrong.status.code(), Some(2));
}

struct CleanupDir(PathBuf);

impl Drop for CleanupDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
