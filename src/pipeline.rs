//! Extraction pipeline: plan, resume, fan out, merge.
//!
//! `run_extraction` is the end-to-end driver behind `reclaw extract`:
//!
//! 1. Plan one batch per day and fingerprint the run.
//! 2. Load state for that fingerprint; completed batches are skipped.
//! 3. A fixed pool of workers drains the pending queue. Each batch is
//!    scheduled as a subagent job, awaited, and parsed. Successes are
//!    recorded in shared state and handed to the [`StateWriter`] actor.
//! 4. Once every worker has joined, the writer is closed and all results for
//!    the planned batches are merged into notes (or journals) and the
//!    managed MEMORY/USER documents.
//!
//! A failed batch never aborts the run. It is reported in
//! [`PipelineResult::failed_batch_errors`] and retried on the next run, since
//! it is never recorded as completed.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::aggregate::{aggregate_insights, output_path_for};
use crate::config::{RunConfig, SchedulerConfig};
use crate::daily_notes::{write_daily_notes, NoteOptions};
use crate::journal::merge_journals;
use crate::managed_docs::{update_managed_docs, BackupMode, DocUpdateOptions, MEMORY_FILE, USER_FILE};
use crate::models::{
    BatchExtractionResult, ConversationBatch, ConversationRef, ExtractionMode, Provider,
};
use crate::planner::{plan, ProviderConversations};
use crate::progress::{ExtractionEvent, ProgressReporter};
use crate::prompt::{build_prompt, PromptOptions, DEFAULT_MAX_PROMPT_CHARS};
use crate::response::parse_response;
use crate::scheduler::JobScheduler;
use crate::state::{compute_run_key, load_state, ReclawState, StateSaver, StateWriter};

/// Everything that shapes one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub mode: ExtractionMode,
    pub model: Option<String>,
    /// Root that receives dated notes or journal entries.
    pub target_path: PathBuf,
    /// Directory holding MEMORY.md and USER.md.
    pub memory_workspace_path: PathBuf,
    pub state_path: PathBuf,
    pub max_parallel_jobs: usize,
    pub max_prompt_chars: usize,
    pub include_session_refs: bool,
    pub allow_untagged_facts: bool,
    pub backup_mode: BackupMode,
    pub job_timeout: Duration,
    pub wait_timeout: Duration,
    pub dry_run: bool,
}

impl ExtractionOptions {
    /// Defaults for `target`, which also serves as the memory workspace.
    pub fn new(mode: ExtractionMode, target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        Self {
            mode,
            model: None,
            memory_workspace_path: target.clone(),
            state_path: target.join(".reclaw").join("state.json"),
            target_path: target,
            max_parallel_jobs: 4,
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            include_session_refs: true,
            allow_untagged_facts: true,
            backup_mode: BackupMode::Single,
            job_timeout: Duration::from_secs(1800),
            wait_timeout: Duration::from_secs(1900),
            dry_run: false,
        }
    }

    /// Options from the `[run]` and `[scheduler]` config sections. A relative
    /// `state_path` is resolved against `target`.
    pub fn from_config(
        run: &RunConfig,
        scheduler: &SchedulerConfig,
        target: impl Into<PathBuf>,
    ) -> Self {
        let mut options = Self::new(run.mode, target);
        options.model = run.model.clone();
        options.state_path = if run.state_path.is_absolute() {
            run.state_path.clone()
        } else {
            options.target_path.join(&run.state_path)
        };
        options.max_parallel_jobs = run.max_parallel_jobs;
        options.max_prompt_chars = run.max_prompt_chars;
        options.include_session_refs = run.include_session_refs;
        options.allow_untagged_facts = run.allow_untagged_facts;
        options.backup_mode = run.backup_mode;
        options.job_timeout = scheduler.job_timeout();
        options.wait_timeout = scheduler.wait_timeout();
        options
    }

    fn note_options(&self) -> NoteOptions {
        NoteOptions {
            include_session_refs: self.include_session_refs,
            allow_untagged_facts: self.allow_untagged_facts,
        }
    }
}

/// Outcome of [`run_extraction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    pub run_key: String,
    pub state_path: PathBuf,
    pub total_batches: usize,
    pub processed_batches: usize,
    pub skipped_batches: usize,
    pub failed_batches: usize,
    /// `<batch id>: <error>` per failed batch, in plan order.
    pub failed_batch_errors: Vec<String>,
    pub conversation_count: usize,
    pub output_files: Vec<PathBuf>,
    pub memory_file_path: PathBuf,
    pub user_file_path: PathBuf,
    pub backup_paths: Vec<PathBuf>,
    pub dry_run: bool,
}

/// Shared by every worker of one run.
struct WorkerContext {
    scheduler: Arc<JobScheduler>,
    options: ExtractionOptions,
    progress: Arc<dyn ProgressReporter>,
    queue: Mutex<VecDeque<ConversationBatch>>,
    state: Mutex<ReclawState>,
    failures: Mutex<Vec<(usize, String)>>,
    pending_batches: usize,
    pending_conversations: usize,
    settled_batches: AtomicUsize,
    settled_conversations: AtomicUsize,
    failed: AtomicUsize,
    active: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool size for `pending` batches.
pub fn worker_count(max_parallel_jobs: usize, pending: usize) -> usize {
    max_parallel_jobs.min(pending).max(1)
}

/// Run a full extraction over `conversations` for the `selected` providers.
pub async fn run_extraction(
    conversations: &ProviderConversations,
    selected: &[Provider],
    options: &ExtractionOptions,
    scheduler: Arc<JobScheduler>,
    progress: Arc<dyn ProgressReporter>,
) -> Result<PipelineResult> {
    let batch_plan = plan(conversations, selected);
    if batch_plan.batches.is_empty() {
        bail!("No conversations found for the selected providers");
    }

    let run_key = compute_run_key(
        options.mode,
        options.model.as_deref(),
        &options.target_path,
        selected,
        &batch_plan.batches,
    );
    let fresh = ReclawState::new(
        run_key.clone(),
        options.mode,
        options.model.as_deref(),
        &options.target_path,
        &options.memory_workspace_path,
    );
    let state = load_state(&options.state_path, fresh)?;

    let (completed, pending): (Vec<_>, Vec<_>) = batch_plan
        .batches
        .iter()
        .cloned()
        .partition(|batch| state.is_completed(&batch.id));
    let pending_conversations: usize = pending.iter().map(|b| b.conversation_count()).sum();

    progress.report(ExtractionEvent::Planned {
        total_batches: batch_plan.batches.len() as u64,
        pending_batches: pending.len() as u64,
        skipped_batches: completed.len() as u64,
        conversations: batch_plan.conversation_count as u64,
    });
    log::info!(
        "run {}: {} batches planned, {} pending, {} already completed",
        run_key.get(..12).unwrap_or(&run_key),
        batch_plan.batches.len(),
        pending.len(),
        completed.len()
    );

    let mut result = PipelineResult {
        run_key,
        state_path: options.state_path.clone(),
        total_batches: batch_plan.batches.len(),
        processed_batches: 0,
        skipped_batches: completed.len(),
        failed_batches: 0,
        failed_batch_errors: Vec::new(),
        conversation_count: batch_plan.conversation_count,
        output_files: Vec::new(),
        memory_file_path: options.memory_workspace_path.join(MEMORY_FILE),
        user_file_path: options.memory_workspace_path.join(USER_FILE),
        backup_paths: Vec::new(),
        dry_run: options.dry_run,
    };
    if options.dry_run {
        return Ok(result);
    }

    let workers = worker_count(options.max_parallel_jobs, pending.len());
    let ctx = Arc::new(WorkerContext {
        scheduler: Arc::clone(&scheduler),
        options: options.clone(),
        progress: Arc::clone(&progress),
        pending_batches: pending.len(),
        pending_conversations,
        queue: Mutex::new(pending.into_iter().collect()),
        state: Mutex::new(state),
        failures: Mutex::new(Vec::new()),
        settled_batches: AtomicUsize::new(0),
        settled_conversations: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
        active: AtomicUsize::new(0),
    });

    let writer = StateWriter::spawn(options.state_path.clone());
    let mut set = JoinSet::new();
    for _ in 0..workers {
        let ctx = Arc::clone(&ctx);
        let saver = writer.saver();
        set.spawn(async move { worker_loop(ctx, saver).await });
    }
    while let Some(joined) = set.join_next().await {
        joined.context("Extraction worker panicked")?;
    }
    writer
        .close()
        .await
        .with_context(|| format!("Failed to save state: {}", options.state_path.display()))?;

    let mut failures = std::mem::take(&mut *lock(&ctx.failures));
    failures.sort_by_key(|(index, _)| *index);
    result.failed_batch_errors = failures.into_iter().map(|(_, e)| e).collect();
    result.failed_batches = result.failed_batch_errors.len();
    result.processed_batches = ctx.settled_batches.load(Ordering::SeqCst) - result.failed_batches;

    let results: Vec<BatchExtractionResult> = {
        let state = lock(&ctx.state);
        batch_plan
            .batches
            .iter()
            .filter_map(|batch| state.completed.get(&batch.id).cloned())
            .collect()
    };
    if results.is_empty() {
        match result.failed_batch_errors.first() {
            Some(first) => bail!(
                "All {} batches failed; first error: {}",
                result.failed_batches,
                first
            ),
            None => bail!("No batch produced a result"),
        }
    }

    let dates: BTreeSet<&str> = results.iter().map(|r| r.date.as_str()).collect();
    progress.report(ExtractionEvent::Merging {
        mode: options.mode.to_string(),
        dates: dates.len() as u64,
    });

    let insights = aggregate_insights(&results, options.allow_untagged_facts);
    result.output_files = match options.mode {
        ExtractionMode::Openclaw => {
            write_daily_notes(&options.target_path, &results, options.note_options())?
        }
        ExtractionMode::Zettelclaw => {
            merge_journals(&options.target_path, &results, options.note_options())?
        }
    };

    let outcome = update_managed_docs(
        &scheduler,
        &insights,
        &results,
        &DocUpdateOptions {
            workspace: &options.memory_workspace_path,
            mode: options.mode,
            model: options.model.as_deref(),
            backup_mode: options.backup_mode,
            job_timeout: options.job_timeout,
            wait_timeout: options.wait_timeout,
        },
    )
    .await?;
    result.memory_file_path = outcome.memory_file_path;
    result.user_file_path = outcome.user_file_path;
    result.backup_paths = outcome.backup_paths;

    Ok(result)
}

async fn worker_loop(ctx: Arc<WorkerContext>, saver: StateSaver) {
    loop {
        let next = lock(&ctx.queue).pop_front();
        let Some(batch) = next else {
            break;
        };

        ctx.active.fetch_add(1, Ordering::SeqCst);
        let outcome = execute_batch(&ctx.scheduler, &batch, &ctx.options).await;
        let active = ctx.active.fetch_sub(1, Ordering::SeqCst) - 1;

        let succeeded = match outcome {
            Ok(extracted) => {
                let snapshot = {
                    let mut state = lock(&ctx.state);
                    state.record(extracted);
                    state.clone()
                };
                saver.save(snapshot);
                true
            }
            Err(e) => {
                let message = format!("{}: {:#}", batch.id, e);
                log::warn!("batch failed: {}", message);
                lock(&ctx.failures).push((batch_order(&batch), message));
                ctx.failed.fetch_add(1, Ordering::SeqCst);
                false
            }
        };

        let settled = ctx.settled_batches.fetch_add(1, Ordering::SeqCst) + 1;
        let settled_conversations = ctx
            .settled_conversations
            .fetch_add(batch.conversation_count(), Ordering::SeqCst)
            + batch.conversation_count();
        ctx.progress.report(ExtractionEvent::BatchSettled {
            batch_id: batch.id.clone(),
            succeeded,
            settled_batches: settled as u64,
            pending_batches: ctx.pending_batches as u64,
            settled_conversations: settled_conversations as u64,
            pending_conversations: ctx.pending_conversations as u64,
            failed: ctx.failed.load(Ordering::SeqCst) as u64,
            active_workers: active as u64,
        });
    }
}

/// Batches are one per day and dates sort lexically, so the date orders them.
fn batch_order(batch: &ConversationBatch) -> usize {
    batch
        .date
        .bytes()
        .filter(u8::is_ascii_digit)
        .fold(0usize, |acc, b| acc.saturating_mul(10).saturating_add((b - b'0') as usize))
}

/// Prompt, schedule, await, and parse one batch.
pub async fn execute_batch(
    scheduler: &JobScheduler,
    batch: &ConversationBatch,
    options: &ExtractionOptions,
) -> Result<BatchExtractionResult> {
    let output_path = output_path_for(options.mode, &options.target_path, &batch.date);
    let prompt = build_prompt(
        batch,
        &PromptOptions {
            mode: options.mode,
            output_path: &output_path,
            memory_workspace_path: &options.memory_workspace_path,
            max_prompt_chars: options.max_prompt_chars,
        },
    )
    .context("Failed to render extraction prompt")?;

    let session = format!("reclaw-{}", batch.id);
    let job = scheduler
        .schedule(
            &prompt,
            options.model.as_deref(),
            Some(&session),
            options.job_timeout.as_secs(),
        )
        .await?;
    log::debug!("batch {} scheduled as job {} ({})", batch.id, job.job_id, job.mode);

    let raw = match scheduler.await_result(&job.job_id, options.wait_timeout).await {
        Ok(raw) => raw,
        Err(e) => {
            scheduler.cancel(&job.job_id).await;
            return Err(e.into());
        }
    };

    Ok(BatchExtractionResult {
        batch_id: batch.id.clone(),
        providers: batch.providers.clone(),
        date: batch.date.clone(),
        conversation_ids: batch.conversations.iter().map(|c| c.id.clone()).collect(),
        conversation_refs: batch
            .conversations
            .iter()
            .map(|c| ConversationRef {
                provider: c.source,
                id: c.id.clone(),
                timestamp: Some(c.created_at.clone()).filter(|ts| !ts.is_empty()),
            })
            .collect(),
        conversation_count: batch.conversation_count(),
        extraction: parse_response(&raw),
    })
}
