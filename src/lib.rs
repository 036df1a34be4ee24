//! # doc-harness
//!
//! An incremental, cache-aware documentation generator for source
//! repositories.
//!
//! doc-harness scans a repository, summarizes each file through an
//! OpenAI-compatible chat service, and assembles the summaries into a
//! Markdown documentation tree. Between runs it keeps a content ledger so
//! that only changed files are summarized again and only sections whose
//! inputs changed are rebuilt. Every service response is cached, so a run
//! over an unchanged tree makes no remote calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │ Scanner  │──▶│  Ledger  │──▶│ Scheduler │──▶│ Artifact │
//! │ walk+tag │   │   diff   │   │ summaries │   │  store   │
//! └──────────┘   └──────────┘   └─────┬─────┘   └────┬─────┘
//!                                     │              │
//!                               ┌─────▼─────┐   ┌────▼─────┐
//!                               │ LLM client│◀──│ Renderer │◀── Policy
//!                               │ + cache   │   │ sections │
//!                               └───────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types: file records, diff partition, task errors |
//! | [`scanner`] | Repository walk, type and domain classification |
//! | [`ledger`] | Content hashing, diffing and the persisted snapshot |
//! | [`response_cache`] | Persistent request → response cache |
//! | [`tokenizer`] | Token counting and splitting |
//! | [`error`] | Service error taxonomy |
//! | [`llm`] | Chat client with retry, backoff and timeouts |
//! | [`summarize`] | Per-file summary prompts and chunk merging |
//! | [`compressor`] | Hierarchical context compression |
//! | [`scheduler`] | Bounded-concurrency summarization and reclamation |
//! | [`artifacts`] | Summary and page storage |
//! | [`policy`] | Which sections to rebuild and why |
//! | [`facts`] | Dependency and test discovery from manifests |
//! | [`render`] | Section rendering and pagination |
//! | [`output`] | Page writes, manifest, cleanup, README |
//! | [`pipeline`] | One generation run end to end |
//! | [`progress`] | Progress reporting on stderr |

pub mod artifacts;
pub mod compressor;
pub mod config;
pub mod error;
pub mod facts;
pub mod ledger;
pub mod llm;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod render;
pub mod response_cache;
pub mod scanner;
pub mod scheduler;
pub mod summarize;
pub mod tokenizer;
