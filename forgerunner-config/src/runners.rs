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

use serde::{Deserialize, Serialize};

use crate::machine_pools::MachinePoolConfig;
use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

const fn default_concurrent() -> usize {
    1
}

/// Top level agent configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Maximum number of builds processed concurrently across all runners.
    #[serde(
        default = "default_concurrent",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub concurrent: usize,

    /// All runners served by this agent.
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
}

/// A single runner registration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Human readable runner name used in logs.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub name: String,

    /// Registration token for the coordinator.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub token: String,

    /// Executor backend for this runner (e.g. "docker", "docker+autoscale").
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub executor: String,

    /// Container engine settings, required by docker based executors.
    #[serde(default)]
    pub docker: Option<DockerConfig>,

    /// Autoscaling policy, required by the machine pool executor.
    #[serde(default)]
    pub machine: Option<MachinePoolConfig>,
}

impl RunnerConfig {
    /// Short identifying token used to scope machine names to this runner.
    /// Mirrors the coordinator's abbreviated runner description.
    #[must_use]
    pub fn short_token(&self) -> &str {
        let end = self
            .token
            .char_indices()
            .nth(8)
            .map_or(self.token.len(), |(idx, _)| idx);
        &self.token[..end]
    }
}

/// Container engine connection and build settings. The connection fields are
/// overwritten with per-machine credentials when a build runs on a pooled
/// machine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DockerConfig {
    /// Default image used when a job does not name one.
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub image: String,

    /// Daemon endpoint, e.g. "tcp://10.0.0.5:2376". Empty selects the local
    /// daemon.
    #[serde(
        default,
        deserialize_with = "convert_optional_string_with_shellexpand"
    )]
    pub host: Option<String>,

    /// Directory holding the client TLS certificates for `host`.
    #[serde(
        default,
        deserialize_with = "convert_optional_string_with_shellexpand"
    )]
    pub cert_path: Option<String>,

    /// Verify the daemon's TLS certificate.
    #[serde(default)]
    pub tls_verify: bool,

    /// Run containers in privileged mode.
    #[serde(default)]
    pub privileged: bool,
}
