//! Local Docker executor implementation.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use buildq_config::DockerSettings;
use buildq_core::{BuildConfig, BuildId, Error, ExecutionReceipt, Executor, Result, StopConfig};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker executor for development and small deployments.
///
/// Each build runs in a container named after its build ID, so a stop
/// request can find it without any other state.
pub struct DockerExecutor {
    docker: Docker,
    network: Option<String>,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    pub fn from_settings(settings: &DockerSettings) -> Result<Self> {
        let docker = match &settings.host {
            Some(host) => Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            docker,
            network: settings.network.clone(),
        })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            network: None,
        }
    }

    fn container_name(build_id: BuildId) -> String {
        format!("build-{}", build_id)
    }

    fn container_env(config: &BuildConfig) -> Vec<String> {
        let mut env = vec![format!("BUILDQ_BUILD_ID={}", config.build_id)];
        if let Some(api_uri) = &config.api_uri {
            env.push(format!("BUILDQ_API_URI={}", api_uri));
        }
        if let Some(token) = &config.token {
            env.push(format!("BUILDQ_TOKEN={}", token));
        }
        env
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    /// Force-remove a container. Returns false if it did not exist.
    async fn remove_container(&self, name: &str) -> std::result::Result<bool, DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn is_status(error: &DockerError, code: u16) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &str {
        "docker"
    }

    async fn start(&self, config: &BuildConfig) -> Result<ExecutionReceipt> {
        let image = config.container.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("build {} has no container image", config.build_id))
        })?;
        let container_name = Self::container_name(config.build_id);

        self.pull_image(image).await;

        let labels = HashMap::from([("buildq.build-id".to_string(), config.build_id.to_string())]);
        let host_config = HostConfig {
            network_mode: self.network.clone(),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.to_string()),
            env: Some(Self::container_env(config)),
            labels: Some(labels),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, "Creating container");
        let created = match self
            .docker
            .create_container(Some(create_options.clone()), container_config.clone())
            .await
        {
            Err(e) if is_status(&e, 409) => {
                // A container from an earlier attempt still holds the name.
                warn!(container = %container_name, "Replacing leftover container");
                self.remove_container(&container_name)
                    .await
                    .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))?;
                self.docker
                    .create_container(Some(create_options), container_config)
                    .await
            }
            other => other,
        };
        let container =
            created.map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove_container(&container_name).await {
                warn!(container = %container_name, error = %cleanup, "Failed to clean up container");
            }
            return Err(Error::ExecutionFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        Ok(ExecutionReceipt::new(self.name(), Some(container.id)))
    }

    async fn stop(&self, config: &StopConfig) -> Result<ExecutionReceipt> {
        let container_name = Self::container_name(config.build_id);

        match self.remove_container(&container_name).await {
            Ok(true) => info!(container = %container_name, "Removed container"),
            Ok(false) => info!(container = %container_name, "Container already gone"),
            Err(e) => {
                return Err(Error::ExecutionFailed(format!(
                    "Failed to remove container: {}",
                    e
                )));
            }
        }

        Ok(ExecutionReceipt::new(self.name(), Some(container_name)))
    }
}
