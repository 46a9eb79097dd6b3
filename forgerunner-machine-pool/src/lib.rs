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

//! Autoscaling pool of ephemeral machines for build isolation.
//!
//! The pool keeps one lifecycle record per machine and reconciles them
//! against the runner's policy (idle target, idle timeout, build cap, hard
//! limit) on every acquire. Provisioning and teardown happen on detached
//! tasks so acquiring capacity never blocks on the machine driver.

mod debug;
mod driver;
mod machine;
mod naming;
mod pool;
mod provider;
mod registry;
mod shell_driver;

pub use driver::{MachineCredentials, MachineDriver};
pub use machine::{MachineRecord, MachineState, RemovalReason};
pub use naming::{NameTemplate, machine_format, new_machine_name, runner_template};
pub use pool::{MachineLease, MachinePool, MachinePoolOptions, PoolSnapshot};
pub use provider::{MachineExecutor, MachineProvider};
pub use registry::MachineRegistry;
pub use shell_driver::ShellMachineDriver;
