//! Redis key layout.

/// Default namespace shared with resque-compatible tooling.
pub const DEFAULT_NAMESPACE: &str = "resque";

/// Builds namespaced keys for queue data.
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn queue(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    pub fn queues(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    pub fn delayed_schedule(&self) -> String {
        format!("{}:delayed_queue_schedule", self.namespace)
    }

    pub fn delayed(&self, timestamp: i64) -> String {
        format!("{}:delayed:{}", self.namespace, timestamp)
    }

    pub fn leader_lock(&self) -> String {
        format!("{}:resque_scheduler_master_lock", self.namespace)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    pub fn failed(&self) -> String {
        format!("{}:failed", self.namespace)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = Keys::default();
        assert_eq!(keys.queue("beta_builds"), "resque:queue:beta_builds");
        assert_eq!(keys.queues(), "resque:queues");
        assert_eq!(keys.delayed_schedule(), "resque:delayed_queue_schedule");
        assert_eq!(keys.delayed(1700000000), "resque:delayed:1700000000");
        assert_eq!(keys.leader_lock(), "resque:resque_scheduler_master_lock");
        assert_eq!(keys.workers(), "resque:workers");
        assert_eq!(keys.failed(), "resque:failed");
    }

    #[test]
    fn test_custom_namespace() {
        let keys = Keys::new("ci");
        assert_eq!(keys.queue("builds"), "ci:queue:builds");
    }
}
