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

use async_trait::async_trait;
use forgerunner_error::Error;

use crate::naming::NameTemplate;

/// Connection credentials for the container engine on a pooled machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineCredentials {
    pub host: String,
    pub cert_path: Option<String>,
    pub tls_verify: bool,
}

/// The only component that talks to the outside world. Calls are fallible
/// and slow (seconds to minutes); the pool never invokes them while holding
/// a lock.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    /// Brings up a new machine through the named backend driver.
    async fn create(&self, driver: &str, name: &str, options: &[String]) -> Result<(), Error>;

    /// Re-runs provisioning on a machine whose creation partially failed.
    async fn provision(&self, name: &str) -> Result<(), Error>;

    /// Destroys the machine.
    async fn remove(&self, name: &str) -> Result<(), Error>;

    /// Names of all machines belonging to the template's pool.
    async fn list(&self, template: &NameTemplate) -> Result<Vec<String>, Error>;

    async fn exist(&self, name: &str) -> bool;

    async fn can_connect(&self, name: &str) -> bool;

    async fn credentials(&self, name: &str) -> Result<MachineCredentials, Error>;
}
