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

//! Operational debug artifacts. Format is not a stable contract; the files
//! are only appended to when debug verbosity is enabled and every failure
//! here is swallowed so diagnostics can never break builds.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use forgerunner_config::machine_pools::MachinePoolConfig;
use forgerunner_util::instant_wrapper::InstantWrapper;

use crate::machine::MachineRecord;
use crate::pool::PoolSnapshot;

const POOL_FILE: &str = "machines.csv";
const MACHINE_FILE: &str = "machines.json";

fn open_artifact(policy: &MachinePoolConfig, file: &str) -> Option<std::fs::File> {
    let dir = policy.artifact_dir.as_deref().unwrap_or(".");
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(Path::new(dir).join(file))
        .ok()
}

/// One line per reconciliation pass.
pub(crate) fn write_pool_line(policy: &MachinePoolConfig, data: &PoolSnapshot, unix_time: u64) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let Some(mut file) = open_artifact(policy, POOL_FILE) else {
        return;
    };
    drop(writeln!(
        file,
        "{unix_time},{},{},{},{},{},{}",
        data.runner, data.idle, data.creating, data.acquired, data.used, data.removing
    ));
}

/// One JSON object per machine entering teardown.
pub(crate) fn write_machine_record<I: InstantWrapper>(
    policy: &MachinePoolConfig,
    record: &MachineRecord<I>,
    unix_time: u64,
) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let Some(mut file) = open_artifact(policy, MACHINE_FILE) else {
        return;
    };
    let entry = serde_json::json!({
        "time": unix_time,
        "name": record.name,
        "state": record.state.as_str(),
        "reason": record.reason.map(|reason| reason.as_str()),
        "used_count": record.used_count,
        "created_secs_ago": record.created.elapsed().as_secs(),
        "used_secs_ago": record.used.elapsed().as_secs(),
    });
    drop(writeln!(file, "{entry}"));
}
