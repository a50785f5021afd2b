// Thin wrapper over the Docker daemon. All container-runtime access goes
// through this one client handle; the daemon's own locking handles
// concurrent calls. When the daemon is unreachable the gateway still
// serves routed traffic — lifecycle operations return 503.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::ImportImageOptions;
use bollard::models::{DeviceRequest, HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited(i64),
    Missing,
}

/// Everything needed to create one engine container.
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub container_port: u16,
    pub host_port: u16,
    pub gpu_ordinals: Vec<i32>,
    pub binds: Vec<String>,
    pub network: String,
    /// Healthcheck grace period = the model's startup timeout.
    pub start_period: Duration,
}

pub struct DockerClient {
    inner: Option<Docker>,
}

fn runtime_err(e: bollard::errors::Error) -> ApiError {
    ApiError::internal(format!("container runtime: {e}"))
}

impl DockerClient {
    pub fn connect() -> Self {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => Self { inner: Some(docker) },
            Err(e) => {
                tracing::error!("Docker daemon unavailable — lifecycle operations disabled: {e}");
                Self { inner: None }
            }
        }
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub fn disconnected() -> Self {
        Self { inner: None }
    }

    pub fn available(&self) -> bool {
        self.inner.is_some()
    }

    fn handle(&self) -> Result<&Docker, ApiError> {
        self.inner
            .as_ref()
            .ok_or_else(|| ApiError::unavailable("Container runtime is unavailable"))
    }

    /// Create (but do not start) an engine container. Restart policy is
    /// always "no": a dead model must stay dead until an admin acts.
    pub async fn create_model_container(&self, spec: &ContainerSpec) -> Result<(), ApiError> {
        let docker = self.handle()?;

        let port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let device_requests = if spec.gpu_ordinals.is_empty() {
            None
        } else {
            Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(spec.gpu_ordinals.iter().map(|g| g.to_string()).collect()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        };

        let healthcheck = HealthConfig {
            test: Some(vec![
                "CMD-SHELL".to_string(),
                format!(
                    "curl -fsS http://localhost:{port}/health || wget -qO- http://localhost:{port}/health || exit 1",
                    port = spec.container_port
                ),
            ]),
            interval: Some(10_000_000_000),
            timeout: Some(5_000_000_000),
            retries: Some(3),
            start_period: Some(spec.start_period.as_nanos() as i64),
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            healthcheck: Some(healthcheck),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                port_bindings: Some(port_bindings),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::NO),
                    maximum_retry_count: None,
                }),
                device_requests,
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(runtime_err)?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), ApiError> {
        self.handle()?
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    /// Stop and remove; both are idempotent against an already-gone
    /// container.
    pub async fn stop_and_remove(&self, name: &str) -> Result<(), ApiError> {
        let docker = self.handle()?;
        let _ = docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await;
        match docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    pub async fn inspect_status(&self, name: &str) -> Result<ContainerStatus, ApiError> {
        let docker = self.handle()?;
        match docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let state = info.state.unwrap_or_default();
                if state.running.unwrap_or(false) {
                    Ok(ContainerStatus::Running)
                } else {
                    Ok(ContainerStatus::Exited(state.exit_code.unwrap_or(-1)))
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(ContainerStatus::Missing)
            }
            Err(e) => Err(runtime_err(e)),
        }
    }

    pub async fn logs_tail(&self, name: &str, tail: usize) -> Result<String, ApiError> {
        let docker = self.handle()?;
        let mut stream = docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(e) => {
                    tracing::warn!(container = %name, "log read error: {e}");
                    break;
                }
            }
        }
        Ok(out)
    }

    pub async fn image_present(&self, image: &str) -> Result<bool, ApiError> {
        let docker = self.handle()?;
        match docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(false)
            }
            Err(e) => Err(runtime_err(e)),
        }
    }

    /// Stream an image to a tarball on disk (deployment export).
    pub async fn export_image(&self, image: &str, dest: &std::path::Path) -> Result<(), ApiError> {
        let docker = self.handle()?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| ApiError::internal(format!("create {}: {e}", dest.display())))?;
        let mut stream = docker.export_image(image);
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(runtime_err)?;
            file.write_all(&bytes)
                .await
                .map_err(|e| ApiError::internal(format!("write {}: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::internal(format!("flush {}: {e}", dest.display())))?;
        Ok(())
    }

    /// Load an image tarball produced by export (deployment import).
    pub async fn load_image(&self, tar_path: &std::path::Path) -> Result<(), ApiError> {
        let docker = self.handle()?;
        let bytes = tokio::fs::read(tar_path)
            .await
            .map_err(|e| ApiError::internal(format!("read {}: {e}", tar_path.display())))?;
        let mut stream =
            docker.import_image(ImportImageOptions { quiet: true }, bytes.into(), None);
        while let Some(progress) = stream.next().await {
            progress.map_err(runtime_err)?;
        }
        Ok(())
    }
}
