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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_numeric_with_shellexpand,
    convert_optional_string_with_shellexpand, convert_string_with_shellexpand,
};

fn default_machine_binary() -> String {
    "docker-machine".to_string()
}

/// Autoscaling policy for a runner backed by ephemeral machines.
///
/// A runner with `idle_count == 0` runs in on-demand mode: machines are
/// created synchronously when a build needs one. Any other value enables
/// pre-provisioning, where the pool keeps `idle_count` machines warm ahead
/// of demand.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MachinePoolConfig {
    /// Driver identifier forwarded to the machine backend (e.g. "amazonec2").
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub machine_driver: String,

    /// Machine name template. Must contain exactly one `{}` placeholder,
    /// which is substituted with a unique token per machine.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub machine_name: String,

    /// Opaque flags forwarded verbatim to the driver on machine creation.
    #[serde(default)]
    pub machine_options: Vec<String>,

    /// Target number of idle machines to keep warm. 0 selects on-demand mode.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub idle_count: usize,

    /// Seconds a machine may sit idle before it becomes eligible for
    /// eviction (once the idle pool exceeds `idle_count`).
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub idle_time_secs: u64,

    /// Number of builds a machine may run before forced retirement.
    /// 0 means unbounded.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_builds: u32,

    /// Hard ceiling on machines for this runner, counting every state except
    /// Removing. 0 means unbounded.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub limit: usize,

    /// Ceiling on machines simultaneously being created during idle top-up.
    /// 0 means unbounded.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_growth_rate: usize,

    /// When set, a maintenance task re-runs the reconciliation pass on this
    /// interval so idle machines are reaped even while no builds arrive.
    #[serde(
        default,
        deserialize_with = "convert_optional_numeric_with_shellexpand"
    )]
    pub idle_scan_interval_secs: Option<u64>,

    /// Binary used by the CLI machine driver.
    #[serde(
        default = "default_machine_binary",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub machine_binary: String,

    /// Directory for operational debug artifacts (machines.csv /
    /// machines.json). Defaults to the working directory.
    #[serde(
        default,
        deserialize_with = "convert_optional_string_with_shellexpand"
    )]
    pub artifact_dir: Option<String>,
}

impl MachinePoolConfig {
    #[must_use]
    pub const fn idle_time(&self) -> Duration {
        Duration::from_secs(self.idle_time_secs)
    }

    #[must_use]
    pub fn idle_scan_interval(&self) -> Option<Duration> {
        self.idle_scan_interval_secs.map(Duration::from_secs)
    }
}
