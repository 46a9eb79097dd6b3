// Copyright 2025 The Forgerunner Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use forgerunner_config::runners::{DockerConfig, RunnerConfig};
use forgerunner_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use tokio::process::Command;

use crate::executor::{Executor, ExecutorData, ExecutorProvider};
use crate::features::FeaturesInfo;

/// Thin wrapper around the `docker` CLI. Connection settings are passed via
/// the standard `DOCKER_*` environment variables, so the same client works
/// against the local daemon and against pooled machines whose credentials
/// were bound into the runner configuration.
#[derive(Clone, Debug)]
pub struct DockerClient {
    inner: Arc<DockerClientInner>,
}

#[derive(Debug)]
struct DockerClientInner {
    binary: PathBuf,
    host: Option<String>,
    cert_path: Option<String>,
    tls_verify: bool,
}

impl DockerClient {
    #[must_use]
    pub fn from_config(config: &DockerConfig) -> Self {
        Self {
            inner: Arc::new(DockerClientInner {
                binary: PathBuf::from("docker"),
                host: config.host.clone(),
                cert_path: config.cert_path.clone(),
                tls_verify: config.tls_verify,
            }),
        }
    }

    pub async fn pull_image(&self, image: &str) -> Result<(), Error> {
        self.run_docker(vec!["pull".into(), image.into()])
            .await
            .err_tip(|| format!("while pulling image {image}"))?;
        Ok(())
    }

    /// Creates a container and returns its id.
    pub async fn create_container(
        &self,
        image: &str,
        privileged: bool,
    ) -> Result<String, Error> {
        let mut args = vec!["create".to_string()];
        if privileged {
            args.push("--privileged".to_string());
        }
        args.push(image.to_string());
        self.run_docker(args)
            .await
            .err_tip(|| format!("while creating container from {image}"))
    }

    pub async fn start_container(&self, container_id: &str) -> Result<(), Error> {
        self.run_docker(vec!["start".into(), container_id.into()])
            .await
            .err_tip(|| format!("while starting container {container_id}"))?;
        Ok(())
    }

    /// Blocks until the container exits and returns its exit status.
    pub async fn wait_container(&self, container_id: &str) -> Result<i32, Error> {
        let stdout = self
            .run_docker(vec!["wait".into(), container_id.into()])
            .await
            .err_tip(|| format!("while waiting on container {container_id}"))?;
        stdout
            .parse::<i32>()
            .err_tip(|| format!("unparsable exit status {stdout:?} from container wait"))
    }

    pub async fn remove_container(&self, container_id: &str) -> Result<(), Error> {
        self.run_docker(vec!["rm".into(), "--force".into(), container_id.into()])
            .await
            .err_tip(|| format!("while removing container {container_id}"))?;
        Ok(())
    }

    async fn run_docker(&self, args: Vec<String>) -> Result<String, Error> {
        let mut cmd = Command::new(&self.inner.binary);
        if let Some(host) = &self.inner.host {
            cmd.env("DOCKER_HOST", host);
        }
        if let Some(cert_path) = &self.inner.cert_path {
            cmd.env("DOCKER_CERT_PATH", cert_path);
        }
        if self.inner.tls_verify {
            cmd.env("DOCKER_TLS_VERIFY", "1");
        }
        cmd.args(&args);
        cmd.kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .err_tip(|| format!("while spawning {:?}", self.inner.binary))?;
        if !output.status.success() {
            return Err(make_err!(
                Code::Unavailable,
                "docker {} failed: {}",
                args.first().map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Runs one build inside a disposable container on the daemon named by the
/// runner configuration (which the machine pool rewrites to point at a
/// pooled machine).
#[derive(Debug, Default)]
pub struct DockerExecutor {
    client: Option<DockerClient>,
    container_id: Option<String>,
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn prepare(
        &mut self,
        config: &RunnerConfig,
        _data: Option<&ExecutorData>,
    ) -> Result<(), Error> {
        let docker = config
            .docker
            .as_ref()
            .ok_or_else(|| make_input_err!("runner {} has no docker configuration", config.name))?;
        error_if!(
            docker.image.is_empty(),
            "runner {} has no default image",
            config.name
        );

        let client = DockerClient::from_config(docker);
        client.pull_image(&docker.image).await?;
        let container_id = client
            .create_container(&docker.image, docker.privileged)
            .await?;
        tracing::debug!(runner = config.name, container_id, "Build container created");
        self.client = Some(client);
        self.container_id = Some(container_id);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), Error> {
        let (client, container_id) = self.bound()?;
        client.start_container(container_id).await
    }

    async fn wait(&mut self) -> Result<(), Error> {
        let (client, container_id) = self.bound()?;
        let status = client.wait_container(container_id).await?;
        error_if!(status != 0, "build exited with status {status}");
        Ok(())
    }

    async fn finish(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => tracing::info!(container_id = ?self.container_id, "Build succeeded"),
            Err(err) => {
                tracing::warn!(container_id = ?self.container_id, ?err, "Build failed");
            }
        }
    }

    async fn cleanup(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let Some(client) = self.client.take() else {
            return;
        };
        if let Err(err) = client.remove_container(&container_id).await {
            tracing::debug!(container_id, ?err, "failed to remove build container");
        }
    }
}

impl DockerExecutor {
    fn bound(&self) -> Result<(&DockerClient, &str), Error> {
        match (&self.client, &self.container_id) {
            (Some(client), Some(container_id)) => Ok((client, container_id)),
            _ => Err(make_err!(
                Code::FailedPrecondition,
                "executor was not prepared"
            )),
        }
    }
}

/// Provider for plain docker execution. Capacity is bound lazily in
/// `prepare`, so `acquire` hands out no data.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerExecutorProvider;

#[async_trait]
impl ExecutorProvider for DockerExecutorProvider {
    async fn acquire(&self, _config: &RunnerConfig) -> Result<Option<ExecutorData>, Error> {
        Ok(None)
    }

    fn release(&self, _config: &RunnerConfig, _data: ExecutorData) -> Result<(), Error> {
        Ok(())
    }

    fn can_create(&self) -> bool {
        true
    }

    fn get_features(&self, features: &mut FeaturesInfo) {
        features.variables = true;
        features.image = true;
        features.services = true;
        features.cache = true;
    }

    fn create(&self) -> Box<dyn Executor> {
        Box::new(DockerExecutor::default())
    }
}
