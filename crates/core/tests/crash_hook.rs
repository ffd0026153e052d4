use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::tempdir;
use tilerp_core::logging::{install_panic_hook, PanicHookStatus, CRASH_DIR_NAME, LOG_DIR_NAME};

const CHILD_MODE_ENV: &str = "TILERP_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "TILERP_PANIC_CHILD_DATA_DIR";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("test_panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME)
}

#[test]
fn test_panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir =
        PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir must be set"));

    assert!(matches!(
        install_panic_hook(Some(data_dir.as_path())),
        PanicHookStatus::Installed { .. } | PanicHookStatus::AlreadyInstalled { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(data_dir.as_path())),
        PanicHookStatus::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "write_success" => panic!("intentional panic during tile loop"),
        "write_failure" => {
            let dir = crash_dir(&data_dir);
            if dir.exists() {
                fs::remove_dir_all(&dir).expect("remove crash directory");
            }
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("intentional panic with unwritable crash dir");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn test_crash_hook_writes_crash_file() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let mut artifacts: Vec<PathBuf> = fs::read_dir(crash_dir(data_dir.path()))
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect();
    artifacts.sort();
    let newest = artifacts.last().expect("expected crash artifact");
    let contents = fs::read_to_string(newest).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=intentional panic during tile loop"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace_policy="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn test_crash_hook_unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("intentional panic with unwritable crash dir"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
