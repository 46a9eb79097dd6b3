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

use core::any::Any;

use async_trait::async_trait;
use forgerunner_config::runners::RunnerConfig;
use forgerunner_error::Error;

use crate::features::FeaturesInfo;

/// Opaque per-build state a provider binds to reserved capacity. Each
/// backend downcasts to its own lease type.
pub type ExecutorData = Box<dyn Any + Send + Sync>;

/// One build's execution lifecycle. The dispatcher calls the methods in
/// order: `prepare`, `start`, `wait`, `finish`, `cleanup`. `finish` and
/// `cleanup` run even when an earlier step failed.
#[async_trait]
pub trait Executor: Send {
    /// Binds the executor to a runner configuration and any capacity the
    /// dispatcher acquired ahead of time. The dispatcher keeps ownership of
    /// the acquired data and returns it through the provider's `release`
    /// once the build is done.
    async fn prepare(
        &mut self,
        config: &RunnerConfig,
        data: Option<&ExecutorData>,
    ) -> Result<(), Error>;

    async fn start(&mut self) -> Result<(), Error>;

    async fn wait(&mut self) -> Result<(), Error>;

    async fn finish(&mut self, result: Result<(), Error>);

    async fn cleanup(&mut self);
}

/// Factory and capacity manager for one backend.
#[async_trait]
pub trait ExecutorProvider: Send + Sync {
    /// Reserves capacity ahead of `prepare`. `Ok(None)` means the backend
    /// binds capacity lazily during `prepare`. An error means no capacity is
    /// available right now and the caller should retry later.
    async fn acquire(&self, config: &RunnerConfig) -> Result<Option<ExecutorData>, Error>;

    /// Returns capacity reserved by `acquire` (or handed out during
    /// `prepare`). Never performs I/O.
    fn release(&self, config: &RunnerConfig, data: ExecutorData) -> Result<(), Error>;

    fn can_create(&self) -> bool;

    fn get_features(&self, features: &mut FeaturesInfo);

    fn create(&self) -> Box<dyn Executor>;
}
