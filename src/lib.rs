//! Lexical retrieval core for manual (markdown/JSON) content.
//!
//! This crate implements the manual-search subsystem end to end:
//! - [`canonical`] — Unicode NFKC normalization ahead of tokenization
//! - [`tokenizer`] — ASCII/CJK-bigram tokenization
//! - [`document`] — manual loading, per-node storage, content validation
//! - [`index`] — the per-manual BM25 sparse index
//! - [`signals`] — per-candidate scoring signals (phrase, proximity, exact, ...)
//! - [`gates`] — multi-gate candidate selection (`g0`, `g_req`) with a
//!   required-term document-frequency guard
//! - [`decompose`] — comparative-query splitting into sub-queries
//! - [`fusion`] — Reciprocal Rank Fusion across rankings
//! - [`diversity`] — per-path decay rerank and dynamic cutoff
//! - [`cache`] — the TTL+LRU semantic cache keyed by request shape
//! - [`trace`] — the TTL+LRU trace store backing `hits` paging
//! - [`stats`] — the append-only adaptive-usage JSON-Lines sink
//! - [`collab`] — the `Clock`/`IdGenerator` collaborator seams
//! - [`pipeline`] — [`pipeline::Pipeline`], the orchestrator tying all of the
//!   above together behind `find`/`hits`/`invalidate`
//!
//! [`error`] and [`config`] underpin every other module: a flat error
//! catalogue mapped to a small set of public string codes, and an
//! env-driven configuration struct with a documented precedence chain.

#![forbid(unsafe_code)]

pub mod cache;
pub mod canonical;
pub mod collab;
pub mod config;
pub mod decompose;
pub mod diversity;
pub mod document;
pub mod error;
pub mod fusion;
pub mod gates;
pub mod index;
pub mod manual;
pub mod pipeline;
pub mod signals;
pub mod stats;
pub mod tokenizer;
pub mod trace;

pub use cache::{CacheConfig, CacheMetrics, SemCacheKeyInput, SemCacheMode, SemanticCache, compute_key};
pub use canonical::normalize;
pub use collab::{Clock, CounterIdGenerator, IdGenerator, SystemClock};
#[cfg(any(test, feature = "test-support"))]
pub use collab::{FixedClock, SequentialIdGenerator};
pub use config::SearchConfig;
pub use decompose::decompose;
pub use diversity::{CutoffReason, DiversityConfig, DiversityInput, DiversityResult, diversify};
pub use document::{DocumentSource, DocumentStore, FileKind, FsDocumentSource, Node};
pub use error::{SearchCoreError, SearchResult};
pub use fusion::{FusedHit, Ranking, fuse_rrf, fuse_rrf_default};
pub use gates::{Candidate, GateKind, GateOutcome, RequiredEffectStatus, RequiredTermDfDecision, select_gate};
pub use index::SparseIndex;
pub use manual::{Manual, RESERVED_ROOT_MANUAL_ID};
pub use pipeline::{
    AppliedDiagnostics, Budget, CandidateItem, ClaimGraph, CompactFindResponse, FindParams,
    FindResponse, HitsKind, HitsParams, HitsResponse, IntegrationStatus, NodeRef, Pipeline,
    RequiredTermDfFilteredView, Summary, TracePayload,
};
pub use signals::{Signal, SignalHit};
pub use stats::{AdaptiveStats, StatsRecord};
pub use tokenizer::{Token, TokenKind, tokenize};
pub use trace::TraceStore;
