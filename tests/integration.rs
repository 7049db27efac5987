use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn fidx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("fidx");
    path
}

fn setup_test_env(handlers: &[&str]) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("notes")).unwrap();
    fs::write(files_dir.join("alpha.md"), "# Alpha\n\nNotes about cargo and crates.\n").unwrap();
    fs::write(files_dir.join("notes/beta.txt"), "Beta plain text file.\n").unwrap();
    fs::write(files_dir.join("report.pdf"), "%PDF-1.4 cut short").unwrap();

    let handlers = handlers
        .iter()
        .map(|h| format!("\"{}\"", h))
        .collect::<Vec<_>>()
        .join(", ");
    let config_content = format!(
        r#"[db]
dir = "{root}/data"

[crawler]
workers = 2
handlers = [{handlers}]

[[data_sources]]
path = "{root}/files"
ignore_patterns = ["**/*.tmp"]
"#,
        root = root.display(),
        handlers = handlers,
    );

    let config_path = config_dir.join("fidx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_fidx(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = fidx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run fidx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_init_creates_one_database_per_schema() {
    let (tmp, config_path) = setup_test_env(&["AudioHandler"]);

    let (stdout, stderr, code) = run_fidx(&config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("schema: core"));
    assert!(stdout.contains("schema: audio"));

    let data = tmp.path().join("data");
    assert!(data.join("index.db").exists());
    assert!(data.join("core.db").exists());
    assert!(data.join("audio.db").exists());
    assert!(!data.join("document.db").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(&[]);

    let (_, _, first) = run_fidx(&config_path, &["init"]);
    assert_eq!(first, Some(0), "First init failed");

    let (_, _, second) = run_fidx(&config_path, &["init"]);
    assert_eq!(second, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_plan_lists_steps() {
    let (_tmp, config_path) = setup_test_env(&["DocumentHandler", "AudioHandler"]);

    let (stdout, stderr, code) = run_fidx(&config_path, &["plan"]);
    assert_eq!(code, Some(0), "plan failed: {}", stderr);
    let step1 = stdout.find("step 1").expect("no step 1");
    let step2 = stdout.find("step 2").expect("no step 2");
    let core = stdout.find("CoreHandler").unwrap();
    let audio = stdout.find("AudioHandler").unwrap();
    assert!(step1 < core && core < step2 && step2 < audio, "{}", stdout);
}

#[test]
fn test_plan_without_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, code) = run_fidx(&tmp.path().join("missing.toml"), &["plan"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("CoreHandler"));
}

#[test]
fn test_run_reports_partial_success() {
    let (_tmp, config_path) = setup_test_env(&["DocumentHandler"]);

    let (stdout, stderr, code) = run_fidx(&config_path, &["run"]);
    assert_eq!(code, Some(0), "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("data sources: 1"), "{}", stdout);
    // Three core items plus the (broken) pdf for the document handler.
    assert!(stdout.contains("work items: 4"), "{}", stdout);
    assert!(stdout.contains("report.pdf"), "{}", stdout);
    assert!(stdout.contains("partial success: 1 failures"), "{}", stdout);
}

#[test]
fn test_run_complete_and_repeatable() {
    let (_tmp, config_path) = setup_test_env(&[]);

    for _ in 0..2 {
        let (stdout, stderr, code) = run_fidx(&config_path, &["run"]);
        assert_eq!(code, Some(0), "run failed: stdout={}, stderr={}", stdout, stderr);
        assert!(stdout.contains("work items: 3"), "{}", stdout);
        assert!(stdout.contains("succeeded: 3"), "{}", stdout);
        assert!(stdout.trim_end().ends_with("complete"), "{}", stdout);
    }
}

#[test]
fn test_unknown_handler_exits_2() {
    let (_tmp, config_path) = setup_test_env(&["VideoHandler"]);

    let (_, stderr, code) = run_fidx(&config_path, &["run"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("VideoHandler"), "{}", stderr);
}

#[test]
fn test_missing_config_exits_2() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_fidx(&tmp.path().join("missing.toml"), &["run"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}

#[test]
fn test_unopenable_store_exits_2() {
    let (tmp, config_path) = setup_test_env(&[]);
    fs::write(tmp.path().join("data"), "not a directory").unwrap();

    let (_, stderr, code) = run_fidx(&config_path, &["run"]);
    assert_eq!(code, Some(2), "{}", stderr);
    assert!(stderr.contains("index store"), "{}", stderr);
}

#[test]
fn test_sources_health() {
    let (_tmp, config_path) = setup_test_env(&[]);

    let (stdout, _, code) = run_fidx(&config_path, &["sources"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("DATA SOURCE"));
    assert!(stdout.contains("local"));
    assert!(stdout.contains("OK"));
}

#[test]
fn test_completions() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, code) = run_fidx(&tmp.path().join("missing.toml"), &["completions", "bash"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("fidx"));
}
