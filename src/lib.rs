//! Registrex - multi-tenant job extraction platform for Quebec government
//! registries.
//!
//! The platform polls per-environment work queues, claims jobs with
//! distributed-safe semantics, dispatches them to extraction executors or
//! the OCR pipeline, tracks worker liveness, and self-heals from crashes
//! and stalls.

pub mod capacity;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod limiter;
pub mod llm;
pub mod models;
pub mod monitor;
pub mod ocr;
pub mod queue;
pub mod storage;
pub mod supervisor;
pub mod utils;
pub mod worker;
