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

use std::sync::Arc;

use async_trait::async_trait;
use forgerunner_config::runners::RunnerConfig;
use forgerunner_error::{Error, make_input_err};
use forgerunner_executor::{Executor, ExecutorData, ExecutorProvider, FeaturesInfo};
use forgerunner_util::instant_wrapper::InstantWrapper;

use crate::pool::{MachineLease, MachinePool};

/// Executor provider facade over the machine pool. The pool manages the
/// machines; the wrapped provider supplies the executor that actually runs
/// builds against them, so this type is substitutable wherever an ordinary
/// provider is expected.
pub struct MachineProvider<I: InstantWrapper> {
    pool: Arc<MachinePool<I>>,
    inner: Arc<dyn ExecutorProvider>,
}

impl<I: InstantWrapper> core::fmt::Debug for MachineProvider<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MachineProvider")
            .field("pool", &self.pool)
            .finish()
    }
}

impl<I: InstantWrapper> MachineProvider<I> {
    #[must_use]
    pub const fn new(pool: Arc<MachinePool<I>>, inner: Arc<dyn ExecutorProvider>) -> Self {
        Self { pool, inner }
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<MachinePool<I>> {
        &self.pool
    }
}

#[async_trait]
impl<I: InstantWrapper> ExecutorProvider for MachineProvider<I> {
    async fn acquire(&self, config: &RunnerConfig) -> Result<Option<ExecutorData>, Error> {
        Ok(self
            .pool
            .acquire(config)
            .await?
            .map(|lease| Box::new(lease) as ExecutorData))
    }

    fn release(&self, _config: &RunnerConfig, data: ExecutorData) -> Result<(), Error> {
        let lease = data
            .downcast::<MachineLease>()
            .map_err(|_| make_input_err!("executor data is not a machine lease"))?;
        self.pool.release(&lease);
        Ok(())
    }

    fn can_create(&self) -> bool {
        self.inner.can_create()
    }

    fn get_features(&self, features: &mut FeaturesInfo) {
        self.inner.get_features(features);
    }

    fn create(&self) -> Box<dyn Executor> {
        Box::new(MachineExecutor {
            pool: Arc::clone(&self.pool),
            inner: self.inner.create(),
            fresh: None,
        })
    }
}

/// Wraps a concrete executor with machine binding: `prepare` trades the
/// acquired lease (or nothing, in on-demand mode) for a configuration whose
/// container engine points at a pooled machine; `cleanup` returns a freshly
/// allocated machine to the pool.
pub struct MachineExecutor<I: InstantWrapper> {
    pool: Arc<MachinePool<I>>,
    inner: Box<dyn Executor>,
    fresh: Option<MachineLease>,
}

impl<I: InstantWrapper> core::fmt::Debug for MachineExecutor<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MachineExecutor")
            .field("fresh", &self.fresh)
            .finish()
    }
}

#[async_trait]
impl<I: InstantWrapper> Executor for MachineExecutor<I> {
    async fn prepare(
        &mut self,
        config: &RunnerConfig,
        data: Option<&ExecutorData>,
    ) -> Result<(), Error> {
        let lease = data.and_then(|data| data.downcast_ref::<MachineLease>());
        let (bound, fresh) = self.pool.use_machine(config, lease).await?;
        self.fresh = fresh;
        self.inner.prepare(&bound, None).await
    }

    async fn start(&mut self) -> Result<(), Error> {
        self.inner.start().await
    }

    async fn wait(&mut self) -> Result<(), Error> {
        self.inner.wait().await
    }

    async fn finish(&mut self, result: Result<(), Error>) {
        self.inner.finish(result).await;
    }

    async fn cleanup(&mut self) {
        if let Some(lease) = self.fresh.take() {
            self.pool.release(&lease);
        }
        self.inner.cleanup().await;
    }
}
