use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
    thread,
};

use midframe_core::logging::{install_panic_hook, PanicHookInstallPlan, CRASH_DIR_NAME, LOG_DIR_NAME};
use tempfile::tempdir;

const CHILD_MODE: &str = "MIDFRAME_CRASH_CHILD_MODE";
const CHILD_DATA_DIR: &str = "MIDFRAME_CRASH_CHILD_DATA_DIR";

fn spawn_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .args(["crash_child", "--exact", "--nocapture"])
        .env(CHILD_MODE, mode)
        .env(CHILD_DATA_DIR, data_dir)
        .output()
        .expect("run crash child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME)
}

// Entry point for the child process; a no-op in the normal test run.
#[test]
fn crash_child() {
    let Ok(mode) = std::env::var(CHILD_MODE) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR).expect("child data dir"));

    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::Installed { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "worker" => {
            let worker = thread::Builder::new()
                .name("tile-worker".to_string())
                .spawn(|| panic!("tile 3 exploded"))
                .expect("spawn worker");
            let _ = worker.join();
            panic!("worker panicked");
        }
        "unwritable" => {
            let dir = crash_dir(&data_dir);
            fs::remove_dir_all(&dir).expect("remove crash dir");
            fs::write(&dir, b"not a directory").expect("block crash dir");
            panic!("crash dir blocked");
        }
        other => panic!("unknown crash child mode: {other}"),
    }
}

#[test]
fn worker_panic_leaves_named_artifact() {
    let data_dir = tempdir().unwrap();
    let output = spawn_child("worker", data_dir.path());
    assert!(!output.status.success());

    let artifacts: Vec<String> = fs::read_dir(crash_dir(data_dir.path()))
        .unwrap()
        .map(|entry| fs::read_to_string(entry.unwrap().path()).unwrap())
        .collect();
    assert_eq!(artifacts.len(), 2, "one artifact per panic");

    let worker = artifacts
        .iter()
        .find(|text| text.contains("thread=tile-worker"))
        .expect("artifact from the worker thread");
    assert!(worker.contains("payload=tile 3 exploded"));
    assert!(worker.contains("location="));
    assert!(worker.contains("backtrace_policy="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_without_repanicking() {
    let data_dir = tempdir().unwrap();
    let output = spawn_child("unwritable", data_dir.path());
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("crash dir blocked"));
    assert!(stderr.contains("Warning: failed to write crash artifact under"));
    assert!(!stderr.contains("panicked while panicking"));
}
