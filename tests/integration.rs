use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn reclaw_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("reclaw");
    path
}

fn conversation(id: &str, source: &str, created_at: &str, text: &str) -> String {
    format!(
        r#"{{
  "id": "{id}",
  "source": "{source}",
  "title": "Conversation {id}",
  "createdAt": "{created_at}",
  "messages": [
    {{"role": "human", "content": "{text}", "timestamp": "{created_at}"}},
    {{"role": "assistant", "content": "Noted.", "timestamp": "{created_at}"}}
  ]
}}"#
    )
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let exports = root.join("exports");
    fs::create_dir_all(exports.join("claude")).unwrap();
    fs::write(
        exports.join("chatgpt.json"),
        format!(
            "[{}, {}]",
            conversation("c1", "chatgpt", "2026-02-21T09:00:00Z", "I am moving the CLI to Rust"),
            conversation("c2", "chatgpt", "2026-02-22T10:00:00Z", "Planning a trip to Lisbon"),
        ),
    )
    .unwrap();
    fs::write(
        exports.join("claude").join("export.json"),
        format!(
            r#"{{"conversations": [{}]}}"#,
            conversation("k1", "claude", "2026-02-22T18:30:00Z", "Reviewing the parser design"),
        ),
    )
    .unwrap();

    let config_path = root.join("reclaw.toml");
    fs::write(
        &config_path,
        "[run]\nmode = \"openclaw\"\nmax_parallel_jobs = 2\n\n[scheduler]\npoll_interval_ms = 10\n",
    )
    .unwrap();

    (tmp, config_path)
}

fn run_reclaw(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = reclaw_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run reclaw binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_plan_groups_by_day() {
    let (tmp, config) = setup_test_env();
    let exports = tmp.path().join("exports");

    let (stdout, stderr, success) =
        run_reclaw(&config, &["plan", "--input", exports.to_str().unwrap()]);
    assert!(success, "plan failed: {}", stderr);
    assert!(stdout.contains("input files: 2"));
    assert!(stdout.contains("conversations: 3"));
    assert!(stdout.contains("batches: 2"));
    assert!(stdout.contains("date-2026-02-21-"));
    assert!(stdout.contains("2 conversations  [chatgpt,claude]"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_plan_provider_filter() {
    let (tmp, config) = setup_test_env();
    let exports = tmp.path().join("exports");

    let (stdout, _, success) = run_reclaw(
        &config,
        &["plan", "--input", exports.to_str().unwrap(), "--provider", "claude"],
    );
    assert!(success);
    assert!(stdout.contains("conversations: 1"));
    assert!(stdout.contains("batches: 1"));
    assert!(!stdout.contains("date-2026-02-21-"));
}

#[test]
fn test_plan_rejects_unknown_provider() {
    let (tmp, config) = setup_test_env();
    let exports = tmp.path().join("exports");

    let (_, stderr, success) = run_reclaw(
        &config,
        &["plan", "--input", exports.to_str().unwrap(), "--provider", "bard"],
    );
    assert!(!success);
    assert!(stderr.contains("bard"));
}

#[test]
fn test_extract_dry_run_writes_nothing() {
    let (tmp, config) = setup_test_env();
    let exports = tmp.path().join("exports");
    let target = tmp.path().join("workspace");

    let (stdout, stderr, success) = run_reclaw(
        &config,
        &[
            "extract",
            "--input",
            exports.to_str().unwrap(),
            "--target",
            target.to_str().unwrap(),
            "--progress",
            "off",
            "--dry-run",
        ],
    );
    assert!(success, "extract --dry-run failed: {}", stderr);
    assert!(stdout.contains("extract openclaw (dry-run)"));
    assert!(stdout.contains("batches: 2"));
    assert!(stdout.contains("pending: 2"));
    assert!(stdout.contains("skipped: 0"));
    assert!(!target.exists(), "dry run must not create the target");
}

#[test]
fn test_extract_rejects_zero_parallelism() {
    let (tmp, config) = setup_test_env();
    let exports = tmp.path().join("exports");
    let target = tmp.path().join("workspace");

    let (_, stderr, success) = run_reclaw(
        &config,
        &[
            "extract",
            "--input",
            exports.to_str().unwrap(),
            "--target",
            target.to_str().unwrap(),
            "--parallel",
            "0",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("--parallel"));
}

#[test]
fn test_invalid_config_is_reported() {
    let (tmp, _) = setup_test_env();
    let exports = tmp.path().join("exports");
    let bad = tmp.path().join("bad.toml");
    fs::write(&bad, "[scheduler]\njob_timeout_secs = 100\nwait_timeout_secs = 10\n").unwrap();

    let (_, _, success) = run_reclaw(&bad, &["plan", "--input", exports.to_str().unwrap()]);
    assert!(!success);
}

/// Stand-in for the scheduler CLI: every batch job finishes immediately with a
/// JSON reply carrying a tagged summary, and the synthesis job rewrites both
/// managed documents.
#[cfg(unix)]
fn write_fake_scheduler(root: &Path, workspace: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        r#"#!/bin/sh
case "$1 $2" in
  "cron add")
    name=""
    while [ $# -gt 0 ]; do
      if [ "$1" = "--name" ]; then name="$2"; fi
      shift
    done
    if [ "$name" = "reclaw-memory-synthesis" ]; then
      n=$(cat "{ws}/.synthesis-count" 2>/dev/null || echo 0)
      n=$((n + 1))
      echo "$n" > "{ws}/.synthesis-count"
      printf '%s\n' '# Memory' '<!-- reclaw-memory:start -->' '- Moving the CLI to Rust' "- Synthesis pass $n" '<!-- reclaw-memory:end -->' > "{ws}/MEMORY.md"
      printf '%s\n' '# User' '<!-- reclaw-user:start -->' '- Likes travel' "- Synthesis pass $n" '<!-- reclaw-user:end -->' > "{ws}/USER.md"
      printf '%s\n' '{{"id": "synthesis"}}'
    else
      printf '%s\n' '{{"id": "batch"}}'
    fi
    ;;
  "cron runs")
    printf '%s\n' '{{"entries": [{{"action": "finished", "status": "ok", "ts": 1, "summary": "{{\"summary\": \"Decision: Adopt Rust for the CLI\\nInterest: Distributed systems\"}}"}}]}}'
    ;;
  "cron rm")
    printf '%s\n' '{{}}'
    ;;
  *)
    exit 1
    ;;
esac
"#,
        ws = workspace.display()
    );
    let path = root.join("fake-openclaw");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[test]
fn test_extract_end_to_end_and_resume() {
    let (tmp, _) = setup_test_env();
    let exports = tmp.path().join("exports");
    let target = tmp.path().join("workspace");
    fs::create_dir_all(&target).unwrap();
    let scheduler = write_fake_scheduler(tmp.path(), &target);

    let config = tmp.path().join("e2e.toml");
    fs::write(
        &config,
        format!(
            "[run]\nmax_parallel_jobs = 2\n\n[scheduler]\ncommand = \"{}\"\npoll_interval_ms = 10\n",
            scheduler.display()
        ),
    )
    .unwrap();

    let args = [
        "extract",
        "--input",
        exports.to_str().unwrap(),
        "--target",
        target.to_str().unwrap(),
        "--progress",
        "off",
    ];
    let (stdout, stderr, success) = run_reclaw(&config, &args);
    assert!(success, "extract failed: {}\n{}", stdout, stderr);
    assert!(stdout.contains("processed: 2"));
    assert!(stdout.contains("failed: 0"));

    let note = fs::read_to_string(target.join("memory").join("2026-02-22.md")).unwrap();
    assert!(note.contains("<!-- reclaw-import:start -->"));
    assert!(note.contains("Adopt Rust for the CLI"));
    assert!(note.contains("claude:k1"));
    assert!(target.join(".reclaw").join("state.json").exists());
    assert!(fs::read_to_string(target.join("MEMORY.md"))
        .unwrap()
        .contains("Moving the CLI to Rust"));

    // Every batch is already in state; only the merge and synthesis rerun.
    let (stdout, stderr, success) = run_reclaw(&config, &args);
    assert!(success, "resumed extract failed: {}\n{}", stdout, stderr);
    assert!(stdout.contains("skipped: 2"));
    assert!(stdout.contains("processed: 0"));
    assert!(stdout.contains("files written: 0"));
    assert!(stdout.contains("MEMORY.md.bak"));
    assert!(fs::read_to_string(target.join("USER.md"))
        .unwrap()
        .contains("Synthesis pass 2"));
}
