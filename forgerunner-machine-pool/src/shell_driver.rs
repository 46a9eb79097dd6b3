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
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use forgerunner_error::{Code, Error, ResultExt, make_err};
use tokio::process::Command;

use crate::driver::{MachineCredentials, MachineDriver};
use crate::naming::NameTemplate;

/// `MachineDriver` backed by a `docker-machine` compatible CLI.
#[derive(Clone, Debug)]
pub struct ShellMachineDriver {
    inner: Arc<ShellMachineDriverInner>,
}

#[derive(Debug)]
struct ShellMachineDriverInner {
    binary: PathBuf,
}

impl ShellMachineDriver {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ShellMachineDriverInner {
                binary: binary.into(),
            }),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String, Error> {
        let output = self.run_raw(&args).await?;
        if !output.status.success() {
            return Err(make_err!(
                Code::Unavailable,
                "{} {} failed: {}",
                self.inner.binary.display(),
                args.first().map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_raw(&self, args: &[String]) -> Result<Output, Error> {
        let mut cmd = Command::new(&self.inner.binary);
        cmd.args(args);
        cmd.kill_on_drop(true);
        cmd.output()
            .await
            .err_tip(|| format!("while spawning {}", self.inner.binary.display()))
    }
}

#[async_trait]
impl MachineDriver for ShellMachineDriver {
    async fn create(&self, driver: &str, name: &str, options: &[String]) -> Result<(), Error> {
        let mut args = vec!["create".to_string(), "--driver".to_string(), driver.to_string()];
        args.extend_from_slice(options);
        args.push(name.to_string());
        self.run(args)
            .await
            .err_tip(|| format!("while creating machine {name}"))?;
        Ok(())
    }

    async fn provision(&self, name: &str) -> Result<(), Error> {
        self.run(vec!["provision".into(), name.into()])
            .await
            .err_tip(|| format!("while provisioning machine {name}"))?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), Error> {
        self.run(vec!["rm".into(), "-y".into(), name.into()])
            .await
            .err_tip(|| format!("while removing machine {name}"))?;
        Ok(())
    }

    async fn list(&self, template: &NameTemplate) -> Result<Vec<String>, Error> {
        let stdout = self
            .run(vec!["ls".into(), "-q".into()])
            .await
            .err_tip(|| "while listing machines")?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| template.matches(line))
            .map(ToString::to_string)
            .collect())
    }

    async fn exist(&self, name: &str) -> bool {
        match self.run_raw(&["status".to_string(), name.to_string()]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn can_connect(&self, name: &str) -> bool {
        match self.run(vec!["status".into(), name.into()]).await {
            Ok(status) => status == "Running",
            Err(_) => false,
        }
    }

    async fn credentials(&self, name: &str) -> Result<MachineCredentials, Error> {
        let host = self
            .run(vec!["url".into(), name.into()])
            .await
            .err_tip(|| format!("while resolving url of machine {name}"))?;
        let cert_path = self
            .run(vec![
                "inspect".into(),
                "--format".into(),
                "{{ .HostOptions.AuthOptions.StorePath }}".into(),
                name.into(),
            ])
            .await
            .err_tip(|| format!("while resolving certificates of machine {name}"))?;
        Ok(MachineCredentials {
            host,
            cert_path: (!cert_path.is_empty()).then_some(cert_path),
            tls_verify: true,
        })
    }
}
