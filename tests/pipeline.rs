//! End-to-end extraction runs against an in-process stand-in for the
//! `openclaw` scheduler CLI.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use reclaw::models::{
    ExtractionMode, MessageRole, NormalizedConversation, NormalizedMessage, Provider,
};
use reclaw::pipeline::{run_extraction, ExtractionOptions, PipelineResult};
use reclaw::planner::ProviderConversations;
use reclaw::process::{ProcessOutput, ProcessRunner};
use reclaw::progress::NoProgress;
use reclaw::scheduler::JobScheduler;
use reclaw::state::decode_state;

const SYNTHESIS: &str = "reclaw-memory-synthesis";

/// Shared across fakes so every synthesis pass writes new content.
static SYNTHESIS_PASSES: AtomicUsize = AtomicUsize::new(0);

/// Answers `cron add/runs/rm` by argument rather than by call order, so any
/// number of workers can share it.
#[derive(Default)]
struct FakeOpenclaw {
    workspace: PathBuf,
    /// Job names containing one of these never schedule.
    refuse_schedule: HashSet<String>,
    /// Jobs whose name contains one of these finish with an error.
    fail_run: HashSet<String>,
    /// When false the synthesis job leaves MEMORY.md and USER.md alone.
    rewrite_docs: bool,
    poll_delay: Duration,
    next_id: AtomicUsize,
    jobs: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeOpenclaw {
    fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            rewrite_docs: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn scheduled_names(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|args| args[0] == "cron" && args[1] == "add")
            .filter_map(|args| flag_value(args, "--name"))
            .collect()
    }

    fn cancelled(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|args| args[0] == "cron" && args[1] == "rm")
            .map(|args| args[2].clone())
            .collect()
    }

    fn rewrite_managed_docs(&self) {
        let pass = SYNTHESIS_PASSES.fetch_add(1, Ordering::SeqCst) + 1;
        fs::create_dir_all(&self.workspace).unwrap();
        fs::write(
            self.workspace.join("MEMORY.md"),
            format!(
                "# Memory\n\n<!-- reclaw-memory:start -->\n- Ships tools in Rust\n- pass {}\n<!-- reclaw-memory:end -->\n",
                pass
            ),
        )
        .unwrap();
        fs::write(
            self.workspace.join("USER.md"),
            format!(
                "# User\n\n<!-- reclaw-user:start -->\n- Prefers terse answers\n- pass {}\n<!-- reclaw-user:end -->\n",
                pass
            ),
        )
        .unwrap();
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[async_trait]
impl ProcessRunner for FakeOpenclaw {
    async fn run(&self, _command: &str, args: &[String]) -> Result<ProcessOutput> {
        self.calls.lock().unwrap().push(args.to_vec());
        match (args[0].as_str(), args[1].as_str()) {
            ("cron", "add") => {
                let name = flag_value(args, "--name").unwrap_or_default();
                if self.refuse_schedule.iter().any(|s| name.contains(s.as_str())) {
                    return Ok(ProcessOutput::failed(1, "gateway unavailable"));
                }
                if name == SYNTHESIS && self.rewrite_docs {
                    self.rewrite_managed_docs();
                }
                let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                self.jobs.lock().unwrap().insert(id.clone(), name);
                Ok(ProcessOutput::ok(json!({ "id": id }).to_string()))
            }
            ("cron", "runs") => {
                tokio::time::sleep(self.poll_delay).await;
                let name = self
                    .jobs
                    .lock()
                    .unwrap()
                    .get(&args[3])
                    .cloned()
                    .unwrap_or_default();
                let entry = if self.fail_run.iter().any(|s| name.contains(s.as_str())) {
                    json!({"action": "finished", "status": "error", "ts": 1, "error": "model overloaded"})
                } else if name == SYNTHESIS {
                    json!({"action": "finished", "status": "ok", "ts": 1, "summary": "updated"})
                } else {
                    let reply = json!({
                        "summary": "Decision: Adopt Rust for the importer\nProject: Reclaw\nInterest: Sailing\nTodo: Benchmark the planner"
                    });
                    json!({"action": "finished", "status": "ok", "ts": 1, "summary": reply.to_string()})
                };
                Ok(ProcessOutput::ok(
                    json!({ "entries": [{"action": "started", "ts": 0}, entry] }).to_string(),
                ))
            }
            ("cron", "rm") => Ok(ProcessOutput::ok("{}")),
            _ => Ok(ProcessOutput::failed(2, "unknown command")),
        }
    }
}

fn conversation(id: &str, source: Provider, created_at: &str) -> NormalizedConversation {
    NormalizedConversation {
        id: id.to_string(),
        source,
        title: format!("Conversation {}", id),
        created_at: created_at.to_string(),
        updated_at: created_at.to_string(),
        message_count: 2,
        model: None,
        messages: vec![
            NormalizedMessage {
                role: MessageRole::Human,
                content: "Should the importer be written in Rust?".to_string(),
                timestamp: Some(created_at.to_string()),
                model: None,
            },
            NormalizedMessage {
                role: MessageRole::Assistant,
                content: "Yes, the concurrency story fits.".to_string(),
                timestamp: Some(created_at.to_string()),
                model: None,
            },
        ],
    }
}

/// One chatgpt conversation per day, starting 2026-02-01.
fn corpus(days: usize) -> ProviderConversations {
    let conversations: Vec<NormalizedConversation> = (1..=days)
        .map(|day| {
            conversation(
                &format!("c{}", day),
                Provider::Chatgpt,
                &format!("2026-02-{:02}T10:00:00.000Z", day),
            )
        })
        .collect();
    BTreeMap::from([(Provider::Chatgpt, conversations)])
}

fn scheduler(fake: &Arc<FakeOpenclaw>) -> Arc<JobScheduler> {
    let runner: Arc<dyn ProcessRunner> = fake.clone();
    Arc::new(JobScheduler::new(runner, "openclaw").with_poll_interval(Duration::from_millis(5)))
}

fn options(tmp: &TempDir, mode: ExtractionMode) -> ExtractionOptions {
    let mut options = ExtractionOptions::new(mode, tmp.path().join("workspace"));
    options.wait_timeout = Duration::from_secs(10);
    options
}

async fn run(
    conversations: &ProviderConversations,
    options: &ExtractionOptions,
    fake: &Arc<FakeOpenclaw>,
) -> Result<PipelineResult> {
    run_extraction(
        conversations,
        &[Provider::Chatgpt],
        options,
        scheduler(fake),
        Arc::new(NoProgress),
    )
    .await
}

fn completed_in_state(path: &Path) -> usize {
    decode_state(&fs::read_to_string(path).unwrap())
        .unwrap()
        .completed
        .len()
}

#[tokio::test]
async fn single_batch_writes_note_state_and_docs() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Openclaw);
    let fake = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let conversations = BTreeMap::from([(
        Provider::Chatgpt,
        vec![conversation("abc", Provider::Chatgpt, "2026-02-22T10:00:00.000Z")],
    )]);

    let result = run(&conversations, &options, &fake).await.unwrap();

    assert_eq!(result.total_batches, 1);
    assert_eq!(result.processed_batches, 1);
    assert_eq!(result.skipped_batches, 0);
    assert_eq!(result.failed_batches, 0);
    assert_eq!(result.conversation_count, 1);

    let note_path = options.target_path.join("memory").join("2026-02-22.md");
    assert_eq!(result.output_files, vec![note_path.clone()]);
    let note = fs::read_to_string(&note_path).unwrap();
    assert!(note.starts_with("# 2026-02-22\n"));
    assert!(note.contains("- Adopt Rust for the importer"));
    assert!(note.contains("- Project: Reclaw"));
    assert!(note.contains("- Benchmark the planner"));
    assert!(note.contains("- chatgpt:abc (2026-02-22T10:00:00.000Z)"));

    assert_eq!(completed_in_state(&result.state_path), 1);
    assert!(result.memory_file_path.exists());
    assert!(result.user_file_path.exists());
    assert!(result.backup_paths.is_empty());

    let names = fake.scheduled_names();
    assert_eq!(names.len(), 2);
    assert!(names[0].starts_with("reclaw-date-2026-02-22-"));
    assert_eq!(names[1], SYNTHESIS);
    // The batch job went out in the legacy dialect.
    assert!(fake.calls()[0].contains(&"+0s".to_string()));
}

#[tokio::test]
async fn rerun_skips_completed_batches() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Openclaw);
    let conversations = corpus(3);

    let first = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let result = run(&conversations, &options, &first).await.unwrap();
    assert_eq!(result.processed_batches, 3);

    let second = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let resumed = run(&conversations, &options, &second).await.unwrap();
    assert_eq!(resumed.run_key, result.run_key);
    assert_eq!(resumed.skipped_batches, 3);
    assert_eq!(resumed.processed_batches, 0);
    assert!(resumed.output_files.is_empty());
    assert_eq!(second.scheduled_names(), vec![SYNTHESIS.to_string()]);
    // MEMORY.md and USER.md existed this time.
    assert_eq!(resumed.backup_paths.len(), 2);
}

#[tokio::test]
async fn parallel_workers_persist_every_batch() {
    let tmp = TempDir::new().unwrap();
    let mut options = options(&tmp, ExtractionMode::Openclaw);
    options.max_parallel_jobs = 4;
    let mut fake = FakeOpenclaw::new(&options.memory_workspace_path);
    fake.poll_delay = Duration::from_millis(15);
    let fake = Arc::new(fake);

    let result = run(&corpus(9), &options, &fake).await.unwrap();

    assert_eq!(result.processed_batches, 9);
    assert_eq!(result.output_files.len(), 9);
    assert_eq!(completed_in_state(&result.state_path), 9);
    let leftovers: Vec<_> = fs::read_dir(result.state_path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("state.json")]);

    // Every batch was scheduled exactly once.
    let mut names = fake.scheduled_names();
    names.retain(|n| n != SYNTHESIS);
    let unique: HashSet<_> = names.iter().collect();
    assert_eq!(names.len(), 9);
    assert_eq!(unique.len(), 9);
}

#[tokio::test]
async fn schedule_failure_in_both_dialects_fails_only_that_batch() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Openclaw);
    let conversations = corpus(2);

    let mut fake = FakeOpenclaw::new(&options.memory_workspace_path);
    fake.refuse_schedule.insert("2026-02-01".to_string());
    let fake = Arc::new(fake);
    let result = run(&conversations, &options, &fake).await.unwrap();

    assert_eq!(result.processed_batches, 1);
    assert_eq!(result.failed_batches, 1);
    let error = &result.failed_batch_errors[0];
    assert!(error.starts_with("date-2026-02-01-"), "{}", error);
    assert!(error.contains("legacy: gateway unavailable"), "{}", error);
    assert!(error.contains("compatible: gateway unavailable"), "{}", error);
    assert_eq!(completed_in_state(&result.state_path), 1);

    // Both dialects were tried for the refused batch.
    let refused = fake
        .scheduled_names()
        .into_iter()
        .filter(|n| n.contains("2026-02-01"))
        .count();
    assert_eq!(refused, 2);

    // The failed batch is retried on the next run.
    let healthy = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let retried = run(&conversations, &options, &healthy).await.unwrap();
    assert_eq!(retried.skipped_batches, 1);
    assert_eq!(retried.processed_batches, 1);
    assert_eq!(retried.failed_batches, 0);
}

#[tokio::test]
async fn failed_job_is_cancelled() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Openclaw);

    let mut fake = FakeOpenclaw::new(&options.memory_workspace_path);
    fake.fail_run.insert("2026-02-02".to_string());
    let fake = Arc::new(fake);
    let result = run(&corpus(2), &options, &fake).await.unwrap();

    assert_eq!(result.failed_batches, 1);
    assert!(result.failed_batch_errors[0].contains("model overloaded"));
    assert_eq!(fake.cancelled().len(), 1);
}

#[tokio::test]
async fn every_batch_failing_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Openclaw);

    let mut fake = FakeOpenclaw::new(&options.memory_workspace_path);
    fake.refuse_schedule.insert("reclaw-date-".to_string());
    let fake = Arc::new(fake);
    let err = run(&corpus(2), &options, &fake).await.unwrap_err();

    let message = format!("{:#}", err);
    assert!(message.contains("All 2 batches failed"), "{}", message);
    assert!(message.contains("date-2026-02-01-"), "{}", message);
    assert!(!options.target_path.join("memory").exists());
    assert!(!fake.scheduled_names().contains(&SYNTHESIS.to_string()));
}

#[tokio::test]
async fn unchanged_managed_docs_fail_verification() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Openclaw);
    let mut fake = FakeOpenclaw::new(&options.memory_workspace_path);
    fake.rewrite_docs = false;
    let fake = Arc::new(fake);

    let err = run(&corpus(1), &options, &fake).await.unwrap_err();

    let message = format!("{:#}", err);
    assert!(message.contains("MEMORY.md was not created"), "{}", message);
    assert!(message.contains("USER.md was not created"), "{}", message);
    // Batch results and notes survive for the next attempt.
    assert!(options.target_path.join("memory").join("2026-02-01.md").exists());
    assert_eq!(completed_in_state(&options.state_path), 1);
}

#[tokio::test]
async fn journal_merge_is_idempotent_across_runs() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Zettelclaw);
    let conversations = corpus(2);

    let first = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let result = run(&conversations, &options, &first).await.unwrap();
    let journal = options.target_path.join("03 Journal").join("2026-02-01.md");
    assert!(result.output_files.contains(&journal));
    let before = fs::read_to_string(&journal).unwrap();
    assert!(before.starts_with("---\ntype: journal\n"));
    assert!(before.contains("## Log"));
    assert!(before.contains("- [ ] Benchmark the planner"));
    assert!(before.contains("## Sessions"));

    let second = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let rerun = run(&conversations, &options, &second).await.unwrap();
    assert!(rerun.output_files.is_empty());
    assert_eq!(fs::read_to_string(&journal).unwrap(), before);
}

#[tokio::test]
async fn changing_the_model_starts_a_new_run() {
    let tmp = TempDir::new().unwrap();
    let mut options = options(&tmp, ExtractionMode::Openclaw);
    let conversations = corpus(2);

    let first = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let original = run(&conversations, &options, &first).await.unwrap();

    options.model = Some("anthropic/claude-sonnet".to_string());
    let second = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));
    let fresh = run(&conversations, &options, &second).await.unwrap();

    assert_ne!(fresh.run_key, original.run_key);
    assert_eq!(fresh.skipped_batches, 0);
    assert_eq!(fresh.processed_batches, 2);
    let state = decode_state(&fs::read_to_string(&fresh.state_path).unwrap()).unwrap();
    assert_eq!(state.run_key, fresh.run_key);
    assert_eq!(state.model, "anthropic/claude-sonnet");
    assert!(second.calls()[0].contains(&"anthropic/claude-sonnet".to_string()));
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let tmp = TempDir::new().unwrap();
    let mut options = options(&tmp, ExtractionMode::Openclaw);
    options.dry_run = true;
    let fake = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));

    let result = run(&corpus(3), &options, &fake).await.unwrap();

    assert!(result.dry_run);
    assert_eq!(result.total_batches, 3);
    assert_eq!(result.processed_batches, 0);
    assert!(fake.calls().is_empty());
    assert!(!options.target_path.exists());
}

#[tokio::test]
async fn empty_selection_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let options = options(&tmp, ExtractionMode::Openclaw);
    let fake = Arc::new(FakeOpenclaw::new(&options.memory_workspace_path));

    let err = run_extraction(
        &corpus(2),
        &[Provider::Grok],
        &options,
        scheduler(&fake),
        Arc::new(NoProgress),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("No conversations"));
}
