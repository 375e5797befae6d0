//! Shutdown ladder against real subprocesses. Unix only: relies on `/bin/sh`
//! and POSIX signals.

#![cfg(unix)]

use lmngen_lib::server::{LaunchConfig, OsSpawner, ServerError, ServerState, StopOutcome, Supervisor};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(executable: &Path) -> LaunchConfig {
    LaunchConfig {
        executable: executable.display().to_string(),
        model_path: PathBuf::from("/models/fake.gguf"),
        address: "127.0.0.1".into(),
        port: 5175,
        threads: 2,
        gpu_layers: 0,
        batch_size: 512,
        context_size: 0,
    }
}

#[test]
fn ladder_against_real_processes() {
    let tmp = tempfile::tempdir().unwrap();
    let polite = script(tmp.path(), "polite.sh", "trap 'exit 0' INT\nwhile :; do sleep 0.05; done");
    let stubborn = script(
        tmp.path(),
        "stubborn.sh",
        "trap '' INT TERM\necho started\nwhile :; do sleep 0.05; done",
    );

    let mut sup = Supervisor::new(Box::new(OsSpawner)).with_rung_timeout(Duration::from_millis(500));

    sup.launch(&config(&polite)).unwrap();
    assert_eq!(sup.state(), ServerState::Running);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(sup.stop(), StopOutcome::Interrupted);

    let handle = sup.launch(&config(&stubborn)).unwrap();
    assert!(handle.pid > 0);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(sup.handle().unwrap().recent_output(), vec!["started".to_string()]);
    assert_eq!(sup.stop(), StopOutcome::Killed);
    assert_eq!(sup.state(), ServerState::Stopped);
}

#[test]
fn process_that_already_exited_is_noticed() {
    let tmp = tempfile::tempdir().unwrap();
    let quitter = script(tmp.path(), "quitter.sh", "exit 3");

    let mut sup = Supervisor::new(Box::new(OsSpawner));
    sup.launch(&config(&quitter)).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    assert!(!sup.check_alive());
    assert_eq!(sup.state(), ServerState::Stopped);
    assert_eq!(sup.stop(), StopOutcome::NotRunning);
}

#[test]
fn missing_executable_is_reported() {
    let mut sup = Supervisor::new(Box::new(OsSpawner));
    let err = sup
        .launch(&config(Path::new("/definitely/not/here/llama-server")))
        .unwrap_err();
    assert!(matches!(err, ServerError::ExecutableNotFound(_)));
    assert_eq!(sup.state(), ServerState::Stopped);
}
