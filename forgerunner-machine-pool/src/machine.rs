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

use forgerunner_util::instant_wrapper::InstantWrapper;

/// Lifecycle phase of a pooled machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Not assigned to any build, available for acquisition.
    Idle,
    /// Reserved while the driver is still bringing the machine up.
    Creating,
    /// Reserved by a caller, not yet bound with connection credentials.
    Acquired,
    /// Running a build.
    Used,
    /// Undergoing teardown; no longer part of usable capacity.
    Removing,
}

impl MachineState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Creating => "creating",
            Self::Acquired => "acquired",
            Self::Used => "used",
            Self::Removing => "removing",
        }
    }
}

/// Why a machine was scheduled for removal. The `Display` output is what
/// operators see in logs and debug artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    TooManyBuilds,
    TooManyMachines,
    TooManyIdle,
    Unavailable,
    ProvisioningFailed,
}

impl RemovalReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TooManyBuilds => "Too many builds",
            Self::TooManyMachines => "Too many machines",
            Self::TooManyIdle => "Too many idle machines",
            Self::Unavailable => "machine is unavailable",
            Self::ProvisioningFailed => "Failed to create",
        }
    }
}

impl core::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks state for a single pooled machine. Records live inside the
/// registry and are only read or written under its lock; callers get
/// snapshot clones.
#[derive(Debug, Clone)]
pub struct MachineRecord<I> {
    pub name: String,
    pub created: I,
    pub used: I,
    pub used_count: u32,
    pub state: MachineState,
    pub reason: Option<RemovalReason>,
}

impl<I: InstantWrapper> MachineRecord<I> {
    pub(crate) fn new(name: String, now: I) -> Self {
        Self {
            name,
            created: now.clone(),
            used: now,
            used_count: 0,
            state: MachineState::Idle,
            reason: None,
        }
    }
}
