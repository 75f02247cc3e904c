//! Core domain types and traits for the buildq job coordinator.
//!
//! This crate contains:
//! - Build identifiers, payloads and build configurations
//! - The queued job envelope and failure records
//! - Collaborator traits: broker, key/value store, executor, status API

pub mod broker;
pub mod build;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod status;
pub mod store;

pub use broker::{Broker, WorkerRegistration};
pub use build::{Annotations, BuildConfig, StopConfig};
pub use error::{Error, Result};
pub use executor::{ExecutionReceipt, Executor};
pub use id::BuildId;
pub use job::{BuildPayload, FailedJob, Job, JobKind};
pub use status::{BuildStatus, StatusApi, StatusApiError};
pub use store::KvStore;
