//! Proxy records and everything that keeps them current
//!
//! This module provides functionality for:
//! - Tracking proxy records with time-decayed validity
//! - Classifying liveness and anonymity from probe responses
//! - Validating and judging records in bounded-parallel batches
//! - Syncing records to durable storage under a retention policy
//! - Harvesting candidates from plain-text lists

pub mod checker;
pub mod classifier;
pub mod geo;
pub mod models;
pub mod parser;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod store;

pub use checker::{CycleReport, HttpProber, Prober, RecordOutcome, Validator, ValidatorConfig};
pub use classifier::{JudgeVerdict, LivenessVerdict};
pub use geo::GeoLocator;
pub use models::{
    Anonymity, CheckCounters, Protocol, ProxyRecord, RetentionPolicy, StoredRecord,
};
pub use parser::ProxyParser;
pub use scheduler::BatchScheduler;
pub use source::{ListLocation, ListSource, ProxySource};
pub use storage::{MemoryStorage, ProxyStorage, SqliteStorage};
pub use store::ProxyStore;
