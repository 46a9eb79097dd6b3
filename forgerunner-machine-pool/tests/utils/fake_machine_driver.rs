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

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use forgerunner_error::{Code, Error, make_err};
use forgerunner_machine_pool::{MachineCredentials, MachineDriver, NameTemplate};
use parking_lot::Mutex;

/// In-memory stand-in for the machine backend. Machines created through it
/// are listed in creation order, mirroring a driver that lists oldest first.
///
/// Names containing `create-fail` refuse both creation and provisioning,
/// which is how tests exercise the bounded provisioning retries.
#[derive(Debug, Default)]
pub(crate) struct FakeMachineDriver {
    state: Mutex<FakeDriverState>,
}

#[derive(Debug, Default)]
struct FakeDriverState {
    machines: Vec<String>,
    unreachable: HashSet<String>,
    fail_credentials: bool,
    fail_removals: bool,
    create_calls: u32,
    provision_calls: u32,
    remove_calls: HashMap<String, u32>,
}

impl FakeMachineDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn machines(&self) -> Vec<String> {
        self.state.lock().machines.clone()
    }

    pub(crate) fn set_unreachable(&self, name: &str) {
        self.state.lock().unreachable.insert(name.to_string());
    }

    pub(crate) fn set_fail_credentials(&self, fail: bool) {
        self.state.lock().fail_credentials = fail;
    }

    pub(crate) fn set_fail_removals(&self, fail: bool) {
        self.state.lock().fail_removals = fail;
    }

    pub(crate) fn create_calls(&self) -> u32 {
        self.state.lock().create_calls
    }

    pub(crate) fn provision_calls(&self) -> u32 {
        self.state.lock().provision_calls
    }

    pub(crate) fn remove_calls(&self, name: &str) -> u32 {
        self.state.lock().remove_calls.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MachineDriver for FakeMachineDriver {
    async fn create(&self, _driver: &str, name: &str, _options: &[String]) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if name.contains("create-fail") {
            return Err(make_err!(Code::Unavailable, "creation of {name} refused"));
        }
        state.machines.push(name.to_string());
        Ok(())
    }

    async fn provision(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.provision_calls += 1;
        if state.machines.iter().any(|machine| machine == name) {
            Ok(())
        } else {
            Err(make_err!(
                Code::NotFound,
                "cannot provision unknown machine {name}"
            ))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        *state.remove_calls.entry(name.to_string()).or_default() += 1;
        if state.fail_removals {
            return Err(make_err!(Code::Unavailable, "removal of {name} refused"));
        }
        state.machines.retain(|machine| machine != name);
        Ok(())
    }

    async fn list(&self, template: &NameTemplate) -> Result<Vec<String>, Error> {
        Ok(self
            .state
            .lock()
            .machines
            .iter()
            .filter(|machine| template.matches(machine))
            .cloned()
            .collect())
    }

    async fn exist(&self, name: &str) -> bool {
        self.state.lock().machines.iter().any(|machine| machine == name)
    }

    async fn can_connect(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.machines.iter().any(|machine| machine == name)
            && !state.unreachable.contains(name)
    }

    async fn credentials(&self, name: &str) -> Result<MachineCredentials, Error> {
        let state = self.state.lock();
        if state.fail_credentials {
            return Err(make_err!(
                Code::Unavailable,
                "credentials of {name} unavailable"
            ));
        }
        if !state.machines.iter().any(|machine| machine == name) {
            return Err(make_err!(Code::NotFound, "machine {name} does not exist"));
        }
        Ok(MachineCredentials {
            host: format!("tcp://{name}:2376"),
            cert_path: Some(format!("/certs/{name}")),
            tls_verify: true,
        })
    }
}
