//! Service configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use std::path::Path;
use std::time::Duration;

/// Everything a buildq worker process needs to start.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub redis: RedisSettings,
    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub executor: ExecutorSettings,
    pub status_api: StatusApiSettings,
}

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub tls: bool,
    pub database: u32,
    /// Prefix applied to queue names and the build config key.
    pub prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            tls: false,
            database: 0,
            prefix: String::new(),
        }
    }
}

impl RedisSettings {
    /// Name of the queue build jobs are consumed from.
    pub fn queue_name(&self) -> String {
        format!("{}builds", self.prefix)
    }

    /// Hash holding build configurations keyed by build ID.
    pub fn build_configs_key(&self) -> String {
        format!("{}buildConfigs", self.prefix)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
    /// How often the pool re-evaluates its size.
    pub check_interval_ms: u64,
    pub max_event_loop_delay_ms: u64,
    /// `None` waits for in-flight jobs indefinitely.
    pub drain_timeout_ms: Option<u64>,
    pub stale_worker_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 10,
            poll_interval_ms: 1000,
            check_interval_ms: 1000,
            max_event_loop_delay_ms: 10,
            drain_timeout_ms: Some(30_000),
            stale_worker_timeout_ms: 60_000,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn max_event_loop_delay(&self) -> Duration {
        Duration::from_millis(self.max_event_loop_delay_ms)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn stale_worker_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_worker_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Run the delayed-job scheduler in this process.
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub leader_lock_timeout_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
            leader_lock_timeout_ms: 180_000,
        }
    }
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn leader_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_lock_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub limit: u32,
    pub delay_seconds: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            limit: 3,
            delay_seconds: 5,
        }
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Executor used when a build does not ask for one.
    pub default: String,
    pub docker: Option<DockerSettings>,
    pub kubernetes: Option<KubernetesSettings>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default: "docker".to_string(),
            docker: Some(DockerSettings::default()),
            kubernetes: None,
        }
    }
}

impl ExecutorSettings {
    /// Names of the executors that have a configuration block.
    pub fn configured(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.docker.is_some() {
            names.push("docker");
        }
        if self.kubernetes.is_some() {
            names.push("k8s");
        }
        names
    }
}

#[derive(Debug, Clone, Default)]
pub struct DockerSettings {
    /// Docker host (e.g., `unix:///var/run/docker.sock`); local defaults when unset.
    pub host: Option<String>,
    pub network: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KubernetesSettings {
    pub namespace: String,
    pub service_account: Option<String>,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            service_account: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusApiSettings {
    pub timeout_ms: u64,
}

impl Default for StatusApiSettings {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl StatusApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Load the service configuration.
///
/// Without a path the defaults are used. `BUILDQ_REDIS_*` environment
/// variables are applied on top and the result is validated.
pub fn load_service_config(path: Option<&Path>) -> ConfigResult<ServiceConfig> {
    let mut config = match path {
        Some(path) => parse_service_config(&std::fs::read_to_string(path)?)?,
        None => ServiceConfig::default(),
    };
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse a service configuration from KDL text.
pub fn parse_service_config(kdl: &str) -> ConfigResult<ServiceConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = ServiceConfig::default();
    let mut seen: Vec<&str> = Vec::new();

    for node in doc.nodes() {
        let name = node.name().value();
        let section = match name {
            "redis" => "redis",
            "worker" => "worker",
            "scheduler" => "scheduler",
            "retry" => "retry",
            "executor" => "executor",
            "status-api" => "status-api",
            _ => continue, // Ignore unknown nodes
        };
        if seen.contains(&section) {
            return Err(ConfigError::Duplicate(section.to_string()));
        }
        seen.push(section);

        match section {
            "redis" => parse_redis(node, &mut config.redis)?,
            "worker" => parse_worker(node, &mut config.worker)?,
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "retry" => parse_retry(node, &mut config.retry)?,
            "executor" => config.executor = parse_executor(node)?,
            _ => {
                if let Some(ms) = get_u64_prop(node, "timeout-ms")? {
                    config.status_api.timeout_ms = ms;
                }
            }
        }
    }

    config.validate()?;
    Ok(config)
}

impl ServiceConfig {
    /// Apply `BUILDQ_REDIS_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string());

        if let Some(host) = var("BUILDQ_REDIS_HOST").filter(|v| !v.is_empty()) {
            self.redis.host = host;
        }
        if let Some(port) = var("BUILDQ_REDIS_PORT") {
            self.redis.port = port
                .parse()
                .map_err(|_| ConfigError::invalid("BUILDQ_REDIS_PORT", port.clone()))?;
        }
        if let Some(password) = var("BUILDQ_REDIS_PASSWORD") {
            self.redis.password = Some(password).filter(|v| !v.is_empty());
        }
        if let Some(tls) = var("BUILDQ_REDIS_TLS") {
            self.redis.tls = parse_bool(&tls)
                .ok_or_else(|| ConfigError::invalid("BUILDQ_REDIS_TLS", tls.clone()))?;
        }
        if let Some(database) = var("BUILDQ_REDIS_DATABASE") {
            self.redis.database = database
                .parse()
                .map_err(|_| ConfigError::invalid("BUILDQ_REDIS_DATABASE", database.clone()))?;
        }
        if let Some(prefix) = var("BUILDQ_REDIS_PREFIX") {
            self.redis.prefix = prefix;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        let worker = &self.worker;
        if worker.min_concurrency == 0 {
            return Err(ConfigError::invalid(
                "worker.min-concurrency",
                "must be at least 1",
            ));
        }
        if worker.max_concurrency < worker.min_concurrency {
            return Err(ConfigError::invalid(
                "worker.max-concurrency",
                format!(
                    "{} is below min-concurrency {}",
                    worker.max_concurrency, worker.min_concurrency
                ),
            ));
        }
        if worker.poll_interval_ms == 0 || worker.check_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "worker",
                "poll and check intervals must be positive",
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "scheduler.poll-interval-ms",
                "must be positive",
            ));
        }
        if self.scheduler.leader_lock_timeout_ms <= self.scheduler.poll_interval_ms {
            return Err(ConfigError::invalid(
                "scheduler.leader-lock-timeout-ms",
                "must exceed the poll interval",
            ));
        }
        let configured = self.executor.configured();
        if !configured.contains(&self.executor.default.as_str()) {
            return Err(ConfigError::invalid(
                "executor.default",
                format!(
                    "'{}' is not one of the configured executors {:?}",
                    self.executor.default, configured
                ),
            ));
        }
        Ok(())
    }
}

fn parse_redis(node: &KdlNode, redis: &mut RedisSettings) -> ConfigResult<()> {
    if let Some(host) = get_string_prop(node, "host") {
        redis.host = host;
    }
    if let Some(port) = get_u64_prop(node, "port")? {
        redis.port =
            u16::try_from(port).map_err(|_| ConfigError::invalid("redis.port", port.to_string()))?;
    }
    redis.password = get_string_prop(node, "password").filter(|p| !p.is_empty());
    if let Some(tls) = get_bool_prop(node, "tls")? {
        redis.tls = tls;
    }
    if let Some(database) = get_u64_prop(node, "database")? {
        redis.database = u32::try_from(database)
            .map_err(|_| ConfigError::invalid("redis.database", database.to_string()))?;
    }
    if let Some(prefix) = get_string_prop(node, "prefix") {
        redis.prefix = prefix;
    }
    Ok(())
}

fn parse_worker(node: &KdlNode, worker: &mut WorkerSettings) -> ConfigResult<()> {
    if let Some(min) = get_u64_prop(node, "min-concurrency")? {
        worker.min_concurrency = min as usize;
    }
    if let Some(max) = get_u64_prop(node, "max-concurrency")? {
        worker.max_concurrency = max as usize;
    }
    if let Some(ms) = get_u64_prop(node, "poll-interval-ms")? {
        worker.poll_interval_ms = ms;
    }
    if let Some(ms) = get_u64_prop(node, "check-interval-ms")? {
        worker.check_interval_ms = ms;
    }
    if let Some(ms) = get_u64_prop(node, "max-event-loop-delay-ms")? {
        worker.max_event_loop_delay_ms = ms;
    }
    if let Some(ms) = get_u64_prop(node, "drain-timeout-ms")? {
        // 0 disables the bound.
        worker.drain_timeout_ms = Some(ms).filter(|ms| *ms > 0);
    }
    if let Some(ms) = get_u64_prop(node, "stale-worker-timeout-ms")? {
        worker.stale_worker_timeout_ms = ms;
    }
    Ok(())
}

fn parse_scheduler(node: &KdlNode, scheduler: &mut SchedulerSettings) -> ConfigResult<()> {
    if let Some(enabled) = get_bool_prop(node, "enabled")? {
        scheduler.enabled = enabled;
    }
    if let Some(ms) = get_u64_prop(node, "poll-interval-ms")? {
        scheduler.poll_interval_ms = ms;
    }
    if let Some(ms) = get_u64_prop(node, "leader-lock-timeout-ms")? {
        scheduler.leader_lock_timeout_ms = ms;
    }
    Ok(())
}

fn parse_retry(node: &KdlNode, retry: &mut RetrySettings) -> ConfigResult<()> {
    if let Some(limit) = get_u64_prop(node, "limit")? {
        retry.limit =
            u32::try_from(limit).map_err(|_| ConfigError::invalid("retry.limit", limit.to_string()))?;
    }
    if let Some(delay) = get_u64_prop(node, "delay-seconds")? {
        retry.delay_seconds = delay;
    }
    Ok(())
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorSettings> {
    let mut executor = ExecutorSettings {
        default: String::new(),
        docker: None,
        kubernetes: None,
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "docker" => {
                    executor.docker = Some(DockerSettings {
                        host: get_string_prop(child, "host"),
                        network: get_string_prop(child, "network"),
                    });
                }
                "k8s" | "kubernetes" => {
                    let mut settings = KubernetesSettings::default();
                    if let Some(namespace) = get_string_prop(child, "namespace") {
                        settings.namespace = namespace;
                    }
                    settings.service_account = get_string_prop(child, "service-account");
                    executor.kubernetes = Some(settings);
                }
                other => {
                    return Err(ConfigError::invalid(
                        "executor",
                        format!("unknown executor type: {}", other),
                    ));
                }
            }
        }
    }

    executor.default = match get_string_prop(node, "default") {
        Some(name) if name == "kubernetes" => "k8s".to_string(),
        Some(name) => name,
        None => executor
            .configured()
            .first()
            .map(|s| s.to_string())
            .ok_or_else(|| ConfigError::MissingField("executor.default".to_string()))?,
    };

    Ok(executor)
}

// Helper functions for extracting values from KDL nodes

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<bool>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(name, format!("expected a boolean, got {:?}", value))),
    }
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|v| u64::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(
                    name,
                    format!("expected a non-negative integer, got {:?}", value),
                )
            }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}
