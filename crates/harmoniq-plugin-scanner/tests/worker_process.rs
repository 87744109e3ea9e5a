use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use crossbeam_channel::{unbounded, Receiver, Sender};
use harmoniq_plugin_db::PluginId;
use harmoniq_plugin_scanner::fake::{fake_formats, FAKE_FORMAT};
use harmoniq_plugin_scanner::{PluginScanner, ScanListener, ScannerConfig, EXECUTABLE_ENV};

fn fake_worker_executable() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_harmoniq-plugin-scanner-fake-worker"))
}

struct Finished(Sender<()>);

impl ScanListener for Finished {
    fn scan_finished(&self) {
        let _ = self.0.send(());
    }
}

fn fake_scanner(data_dir: &Path, plugins: &Path) -> (PluginScanner, Receiver<()>) {
    let mut config = ScannerConfig::with_data_dir(data_dir);
    config.executable = fake_worker_executable();
    config.add_search_path(FAKE_FORMAT, plugins);
    let scanner = PluginScanner::new(config, fake_formats());
    let (done_tx, done) = unbounded();
    scanner.add_listener(Arc::new(Finished(done_tx)));
    (scanner, done)
}

fn write_plugins(dir: &Path, files: &[(&str, &str)]) -> Vec<String> {
    fs::create_dir_all(dir).unwrap();
    files
        .iter()
        .map(|(name, contents)| {
            let path = dir.join(name);
            fs::write(&path, contents).unwrap();
            path.display().to_string()
        })
        .collect()
}

#[test]
fn crashing_plugin_costs_one_relaunch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugins = dir.path().join("plugins");
    let files = write_plugins(
        &plugins,
        &[("a.fake", "ok"), ("b.fake", "crash"), ("c.fake", "ok")],
    );
    let (scanner, done) = fake_scanner(dir.path(), &plugins);

    assert!(scanner.start(&[FAKE_FORMAT.to_string()]));
    done.recv_timeout(Duration::from_secs(30))
        .expect("scan should finish");

    let registry = scanner.registry();
    assert!(registry.contains(&PluginId::new(FAKE_FORMAT, files[0].clone())));
    assert!(registry.contains(&PluginId::new(FAKE_FORMAT, files[2].clone())));
    assert!(registry.is_blacklisted(&files[1]));
    assert_eq!(scanner.relaunch_count(), 1);
    assert!(!scanner.is_scanning());
    assert!(!scanner.config().pedal().exists());
}

#[test]
fn hung_plugin_is_killed_and_blacklisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugins = dir.path().join("plugins");
    let files = write_plugins(&plugins, &[("a.fake", "hang"), ("b.fake", "ok")]);
    let mut config = ScannerConfig::with_data_dir(dir.path());
    config.executable = fake_worker_executable();
    config.hang_timeout = Duration::from_millis(500);
    config.add_search_path(FAKE_FORMAT, &plugins);
    let scanner = PluginScanner::new(config, fake_formats());
    let (done_tx, done) = unbounded();
    scanner.add_listener(Arc::new(Finished(done_tx)));

    assert!(scanner.start(&[]));
    done.recv_timeout(Duration::from_secs(30))
        .expect("scan should finish");

    let registry = scanner.registry();
    assert!(registry.is_blacklisted(&files[0]));
    assert!(registry.contains(&PluginId::new(FAKE_FORMAT, files[1].clone())));
    assert_eq!(scanner.relaunch_count(), 1);
}

#[test]
fn results_survive_in_plugins_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugins = dir.path().join("plugins");
    let files = write_plugins(&plugins, &[("a.fake", "ok"), ("b.fake", "fail")]);

    {
        let (scanner, done) = fake_scanner(dir.path(), &plugins);
        assert!(scanner.start(&[]));
        done.recv_timeout(Duration::from_secs(30))
            .expect("scan should finish");
    }

    let (scanner, _done) = fake_scanner(dir.path(), &plugins);
    let registry = scanner.registry();
    assert!(registry.contains(&PluginId::new(FAKE_FORMAT, files[0].clone())));
    assert!(registry.is_blacklisted(&files[1]));
}

#[test]
fn cli_lists_discovered_bundles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundles = dir.path().join("bundles");
    fs::create_dir_all(&bundles).unwrap();
    fs::write(bundles.join("Shiny.hqplug"), b"\x7fELF").unwrap();
    fs::write(
        bundles.join("manifest.json"),
        r#"{"name": "Shiny Synth", "vendor": "Harmoniq Test Rig", "is_instrument": true}"#,
    )
    .unwrap();

    let assert = Command::cargo_bin("harmoniq-plugin-scanner")
        .expect("binary")
        .env_remove(EXECUTABLE_ENV)
        .arg("--data-dir")
        .arg(dir.path().join("data"))
        .args(["--format", "Harmoniq", "--path"])
        .arg(format!("Harmoniq={}", bundles.display()))
        .timeout(Duration::from_secs(60))
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(
        stdout.contains("Shiny Synth (Harmoniq)"),
        "unexpected output: {stdout}"
    );
    assert!(dir.path().join("data/plugins.json").is_file());
}

#[test]
fn cli_lists_unverified_candidates_without_scanning() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundles = dir.path().join("bundles");
    fs::create_dir_all(&bundles).unwrap();
    fs::write(bundles.join("Pending.hqplug"), b"\x7fELF").unwrap();

    let assert = Command::cargo_bin("harmoniq-plugin-scanner")
        .expect("binary")
        .arg("--data-dir")
        .arg(dir.path().join("data"))
        .arg("--unverified")
        .arg("--path")
        .arg(format!("Harmoniq={}", bundles.display()))
        .timeout(Duration::from_secs(60))
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(
        stdout.contains("Pending (Harmoniq)"),
        "unexpected output: {stdout}"
    );
    assert!(!dir.path().join("data/Temp/ScannerPluginList.json").exists());
}
