//! KDL configuration parsing for buildq.
//!
//! This crate handles parsing of the service configuration file
//! (`buildq.kdl`) and the environment overrides applied on top of it.

pub mod error;
pub mod service;

pub use error::{ConfigError, ConfigResult};
pub use service::{
    DockerSettings, ExecutorSettings, KubernetesSettings, RedisSettings, RetrySettings,
    SchedulerSettings, ServiceConfig, StatusApiSettings, WorkerSettings, load_service_config,
    parse_service_config,
};
