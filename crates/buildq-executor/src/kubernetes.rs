//! Kubernetes executor implementation.

use async_trait::async_trait;
use buildq_config::KubernetesSettings;
use buildq_core::{BuildConfig, BuildId, Error, ExecutionReceipt, Executor, Result, StopConfig};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use serde_json::json;
use tracing::info;

/// Kubernetes-based build executor. Each build runs as one pod.
pub struct KubernetesExecutor {
    client: Client,
    namespace: String,
    service_account: Option<String>,
}

impl KubernetesExecutor {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(client, namespace))
    }

    pub async fn from_settings(settings: &KubernetesSettings) -> Result<Self> {
        let mut executor = Self::new(settings.namespace.clone()).await?;
        executor.service_account = settings.service_account.clone();
        Ok(executor)
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service_account: None,
        }
    }

    fn pod_name(build_id: BuildId) -> String {
        format!("build-{}", build_id)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Pod manifest for a build.
    fn pod_manifest(config: &BuildConfig, service_account: Option<&str>) -> Result<Pod> {
        let image = config.container.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("build {} has no container image", config.build_id))
        })?;

        let mut env = vec![json!({ "name": "BUILDQ_BUILD_ID", "value": config.build_id.to_string() })];
        if let Some(api_uri) = &config.api_uri {
            env.push(json!({ "name": "BUILDQ_API_URI", "value": api_uri }));
        }
        if let Some(token) = &config.token {
            env.push(json!({ "name": "BUILDQ_TOKEN", "value": token }));
        }

        let mut spec = json!({
            "restartPolicy": "Never",
            "containers": [{
                "name": "build",
                "image": image,
                "env": env,
            }],
        });
        if let Some(account) = service_account {
            spec["serviceAccountName"] = json!(account);
        }

        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": Self::pod_name(config.build_id),
                "labels": {
                    "app": "buildq",
                    "buildq.build-id": config.build_id.to_string(),
                },
            },
            "spec": spec,
        });

        Ok(serde_json::from_value(manifest)?)
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    fn name(&self) -> &str {
        "k8s"
    }

    async fn start(&self, config: &BuildConfig) -> Result<ExecutionReceipt> {
        let pod = Self::pod_manifest(config, self.service_account.as_deref())?;
        let name = Self::pod_name(config.build_id);

        info!(pod = %name, namespace = %self.namespace, "Creating pod");
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create pod: {}", e)))?;

        Ok(ExecutionReceipt::new(self.name(), Some(name)))
    }

    async fn stop(&self, config: &StopConfig) -> Result<ExecutionReceipt> {
        let name = Self::pod_name(config.build_id);

        match self.pods().delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(pod = %name, namespace = %self.namespace, "Deleted pod"),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                info!(pod = %name, "Pod already gone");
            }
            Err(e) => {
                return Err(Error::ExecutionFailed(format!(
                    "Failed to delete pod: {}",
                    e
                )));
            }
        }

        Ok(ExecutionReceipt::new(self.name(), Some(name)))
    }
}
