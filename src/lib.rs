//! # Reclaw
//!
//! Migrates ChatGPT, Claude, and Grok chat exports into durable Markdown
//! memory.
//!
//! Conversations are batched per calendar day. Each batch is summarized by an
//! LLM subagent reached through the `openclaw cron` job scheduler, and the
//! results are merged into dated notes (or journal entries) plus the managed
//! sections of `MEMORY.md` and `USER.md`. Progress is resumable: completed
//! batches are recorded in a state file keyed by a fingerprint of the run.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │  input   │──▶│ planner  │──▶│   pipeline   │──▶│  aggregate   │
//! │ exports  │   │ per day  │   │ worker pool  │   │ notes/journal│
//! └──────────┘   └──────────┘   └──────┬───────┘   │ MEMORY/USER  │
//!                                      │           └──────────────┘
//!                          ┌───────────┴──────────┐
//!                          ▼                      ▼
//!                    ┌───────────┐          ┌──────────┐
//!                    │ scheduler │          │  state   │
//!                    │ (openclaw)│          │  writer  │
//!                    └───────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! reclaw plan --input exports/
//! reclaw extract --input exports/ --target ~/vault --mode zettelclaw
//! reclaw import-sessions --input exports/ --workspace ~/vault
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`input`] | Normalized conversation loading |
//! | [`planner`] | Per-day batch planning |
//! | [`state`] | Resumable run state and its writer |
//! | [`pipeline`] | Extraction driver |
//! | [`scheduler`] | `openclaw cron` client |
//! | [`prompt`] | Prompt templates |
//! | [`response`] | Subagent response parsing and cleaning |
//! | [`signals`] | Tagged signal extraction |
//! | [`aggregate`] | Per-day rollups and the run digest |
//! | [`daily_notes`] | Dated notes (openclaw mode) |
//! | [`journal`] | Journal notes (zettelclaw mode) |
//! | [`managed_docs`] | MEMORY.md / USER.md synthesis |
//! | [`sessions`] | Session-history import |
//! | [`archive`] | Export archive unpacking |
//! | [`process`] | External process boundary |
//! | [`progress`] | Progress reporting |

pub mod aggregate;
pub mod archive;
pub mod config;
pub mod daily_notes;
pub mod input;
pub mod journal;
pub mod managed_docs;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod response;
pub mod scheduler;
pub mod sessions;
pub mod signals;
pub mod state;
pub mod util;
pub mod validate;
