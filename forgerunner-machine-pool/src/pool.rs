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

use core::time::Duration;
use std::sync::Arc;

use forgerunner_config::machine_pools::MachinePoolConfig;
use forgerunner_config::runners::RunnerConfig;
use forgerunner_error::{Code, Error, ResultExt, make_err, make_input_err};
use forgerunner_util::background_spawn;
use forgerunner_util::instant_wrapper::InstantWrapper;
use forgerunner_util::shutdown::ShutdownToken;
use tokio::sync::{Mutex, oneshot};

use crate::debug;
use crate::driver::MachineDriver;
use crate::machine::{MachineState, RemovalReason};
use crate::naming::{NameTemplate, new_machine_name, runner_template};
use crate::registry::MachineRegistry;

/// Provision attempts after a failed driver create.
const PROVISION_RETRY_ATTEMPTS: u32 = 3;
/// Attempts to find or create a machine during on-demand allocation.
const USE_RETRY_ATTEMPTS: u32 = 3;
/// Ceiling for the removal retry backoff.
const MAX_REMOVAL_BACKOFF: Duration = Duration::from_secs(8 * 60);

/// Handle to a machine reserved for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineLease {
    name: String,
}

impl MachineLease {
    pub(crate) const fn new(name: String) -> Self {
        Self { name }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-state tally produced by one reconciliation pass. Machines in Removing
/// are torn down capacity and excluded from the total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub runner: String,
    pub idle: usize,
    pub creating: usize,
    pub acquired: usize,
    pub used: usize,
    pub removing: usize,
}

impl PoolSnapshot {
    fn new(runner: &str) -> Self {
        Self {
            runner: runner.to_string(),
            ..Self::default()
        }
    }

    pub(crate) const fn add(&mut self, state: MachineState) {
        match state {
            MachineState::Idle => self.idle += 1,
            MachineState::Creating => self.creating += 1,
            MachineState::Acquired => self.acquired += 1,
            MachineState::Used => self.used += 1,
            MachineState::Removing => self.removing += 1,
        }
    }

    #[must_use]
    pub const fn available(&self) -> usize {
        self.idle + self.creating + self.acquired
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.available() + self.used
    }
}

/// Construction knobs for [`MachinePool`]. The intervals exist so tests can
/// zero them out and drive time through the mocked clock.
#[derive(Debug, Clone)]
pub struct MachinePoolOptions<I> {
    pub now_fn: fn() -> I,
    /// Sleep between provision attempts of a failed creation and between
    /// on-demand allocation attempts.
    pub provision_retry_interval: Duration,
    /// Initial sleep after a failed removal; doubles per attempt.
    pub removal_retry_backoff: Duration,
    /// Removal attempts before the finalizer gives up and leaves the record
    /// in Removing.
    pub removal_max_attempts: u32,
    pub shutdown: ShutdownToken,
}

impl<I: InstantWrapper> MachinePoolOptions<I> {
    #[must_use]
    pub fn new(now_fn: fn() -> I) -> Self {
        Self {
            now_fn,
            provision_retry_interval: Duration::from_secs(1),
            removal_retry_backoff: Duration::from_secs(30),
            removal_max_attempts: 10,
            shutdown: ShutdownToken::new(),
        }
    }
}

/// The autoscaling machine pool: creates, tracks, reuses, idles-out and
/// destroys the disposable machines a runner isolates its builds on.
pub struct MachinePool<I: InstantWrapper> {
    driver: Arc<dyn MachineDriver>,
    registry: MachineRegistry<I>,
    /// Serializes evaluate-then-top-up across concurrent acquires. The
    /// registry lock alone is not enough: the decision to create N idle
    /// machines needs a consistent snapshot across many records.
    acquire_lock: Mutex<()>,
    now_fn: fn() -> I,
    provision_retry_interval: Duration,
    removal_retry_backoff: Duration,
    removal_max_attempts: u32,
    shutdown: ShutdownToken,
}

impl<I: InstantWrapper> core::fmt::Debug for MachinePool<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MachinePool")
            .field("machines", &self.registry.len())
            .finish()
    }
}

impl<I: InstantWrapper> MachinePool<I> {
    #[must_use]
    pub fn new(driver: Arc<dyn MachineDriver>, options: MachinePoolOptions<I>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            registry: MachineRegistry::new(options.now_fn),
            acquire_lock: Mutex::new(()),
            now_fn: options.now_fn,
            provision_retry_interval: options.provision_retry_interval,
            removal_retry_backoff: options.removal_retry_backoff,
            removal_max_attempts: options.removal_max_attempts,
            shutdown: options.shutdown,
        })
    }

    #[must_use]
    pub const fn registry(&self) -> &MachineRegistry<I> {
        &self.registry
    }

    fn now(&self) -> I {
        (self.now_fn)()
    }

    fn policy(config: &RunnerConfig) -> Result<&MachinePoolConfig, Error> {
        config
            .machine
            .as_ref()
            .ok_or_else(|| make_input_err!("runner {} has no machine configuration", config.name))
    }

    /// Reserves a machine for a build, or reports how the caller should
    /// proceed: `Ok(None)` defers allocation to [`Self::use_machine`]
    /// (on-demand mode), an error with [`Code::ResourceExhausted`] asks the
    /// dispatcher to retry once pre-provisioning catches up. Never blocks on
    /// machine creation.
    pub async fn acquire(self: &Arc<Self>, config: &RunnerConfig) -> Result<Option<MachineLease>, Error> {
        let (data, machines) = self.reconcile(config).await?;
        if let Some(name) = self.find_free(config, &machines).await {
            return Ok(Some(MachineLease::new(name)));
        }
        let policy = Self::policy(config)?;
        if policy.idle_count != 0 && data.idle == 0 {
            return Err(make_err!(
                Code::ResourceExhausted,
                "no free machines that can process builds"
            ));
        }
        Ok(None)
    }

    /// One reconciliation pass: apply eviction policy to every idle machine,
    /// then top the idle pool back up to its target. Returns the tally and
    /// the machine names the driver listed.
    pub async fn reconcile(
        self: &Arc<Self>,
        config: &RunnerConfig,
    ) -> Result<(PoolSnapshot, Vec<String>), Error> {
        let policy = Self::policy(config)?;
        let template = runner_template(config, policy)?;
        let machines = self
            .driver
            .list(&template)
            .await
            .err_tip(|| format!("while listing machines of runner {}", config.name))?;
        // Concurrent acquires must not jointly overshoot the idle target or
        // the machine limit, so evaluation and top-up run as one atomic step.
        let data = {
            let _guard = self.acquire_lock.lock().await;
            let mut data = self.evaluate_machines(config, policy, &machines);
            self.top_up(config, policy, &template, &mut data);
            data
        };
        tracing::debug!(
            runner = config.name.as_str(),
            idle = data.idle,
            creating = data.creating,
            acquired = data.acquired,
            used = data.used,
            removing = data.removing,
            "Machine pool details"
        );
        debug::write_pool_line(policy, &data, self.now().unix_timestamp());
        Ok((data, machines))
    }

    /// Applies the eviction rules to every machine the driver listed and
    /// tallies the pool. Eviction decisions happen before any top-up so a
    /// machine marked Removing here is never counted as available capacity
    /// in the same pass.
    fn evaluate_machines(
        self: &Arc<Self>,
        config: &RunnerConfig,
        policy: &MachinePoolConfig,
        machines: &[String],
    ) -> PoolSnapshot {
        let mut data = PoolSnapshot::new(config.short_token());
        for name in machines {
            let Some(record) = self.registry.get_or_create(name, false) else {
                continue;
            };
            let idle_age = record.used.elapsed();
            if let Some(reason) = Self::eviction_reason(policy, &record, idle_age, &data) {
                self.remove(config, name, reason);
                data.add(MachineState::Removing);
            } else {
                data.add(record.state);
            }
        }
        data
    }

    fn eviction_reason(
        policy: &MachinePoolConfig,
        record: &crate::machine::MachineRecord<I>,
        idle_age: Duration,
        data: &PoolSnapshot,
    ) -> Option<RemovalReason> {
        // Only idle machines are subject to eviction policy.
        if record.state != MachineState::Idle {
            return None;
        }
        if policy.max_builds > 0 && record.used_count >= policy.max_builds {
            return Some(RemovalReason::TooManyBuilds);
        }
        if policy.limit > 0 && data.total() >= policy.limit {
            return Some(RemovalReason::TooManyMachines);
        }
        if idle_age > policy.idle_time() && data.idle >= policy.idle_count {
            return Some(RemovalReason::TooManyIdle);
        }
        None
    }

    /// Pre-provisioning: create idle machines ahead of demand so a later
    /// acquire is served instantly.
    fn top_up(
        self: &Arc<Self>,
        config: &RunnerConfig,
        policy: &MachinePoolConfig,
        template: &NameTemplate,
        data: &mut PoolSnapshot,
    ) {
        while data.available() < policy.idle_count
            && (policy.limit == 0 || data.total() < policy.limit)
        {
            if policy.max_growth_rate > 0 && data.creating >= policy.max_growth_rate {
                tracing::debug!(
                    runner = config.name.as_str(),
                    creating = data.creating,
                    "Machine growth rate limit reached"
                );
                break;
            }
            drop(self.create(config, template, MachineState::Idle).1);
            data.creating += 1;
        }
    }

    /// Reserves a fresh name and provisions it on a detached task. The
    /// receiver reports the final outcome; pre-provisioning callers drop it.
    fn create(
        self: &Arc<Self>,
        config: &RunnerConfig,
        template: &NameTemplate,
        target_state: MachineState,
    ) -> (String, oneshot::Receiver<Result<(), Error>>) {
        let name = new_machine_name(template, &self.now());
        // The fresh record enters Acquired under the registry lock so no
        // concurrent caller can grab the name while the driver works on it.
        drop(self.registry.get_or_create(&name, true));
        self.registry.begin_creating(&name);

        let (tx, rx) = oneshot::channel();
        let pool = Arc::clone(self);
        let config = config.clone();
        let machine_name = name.clone();
        background_spawn!(
            "machine_create",
            async move {
                let result = pool
                    .provision_machine(&config, &machine_name, target_state)
                    .await;
                // Fire-and-forget callers have dropped the receiver.
                drop(tx.send(result));
            },
            machine = name.as_str()
        );
        (name, rx)
    }

    async fn provision_machine(
        self: &Arc<Self>,
        config: &RunnerConfig,
        name: &str,
        target_state: MachineState,
    ) -> Result<(), Error> {
        let policy = Self::policy(config)?;
        let started = self.now();
        let mut result = self
            .driver
            .create(&policy.machine_driver, name, &policy.machine_options)
            .await;
        for _ in 0..PROVISION_RETRY_ATTEMPTS {
            let Err(err) = &result else { break };
            tracing::warn!(machine = name, ?err, "Machine creation failed, trying to provision");
            self.now().sleep(self.provision_retry_interval).await;
            result = self.driver.provision(name).await;
        }
        match result {
            Ok(()) => {
                self.registry.finish_create(name, target_state);
                tracing::info!(machine = name, took = ?started.elapsed(), "Machine created");
                Ok(())
            }
            Err(err) => {
                self.remove(config, name, RemovalReason::ProvisioningFailed);
                Err(err).err_tip(|| format!("while creating machine {name}"))
            }
        }
    }

    /// Returns the first listed machine that can be reserved and is alive.
    /// A reserved machine that fails the liveness probe is abandoned into
    /// removal, never handed out and never returned to the idle pool.
    async fn find_free(
        self: &Arc<Self>,
        config: &RunnerConfig,
        machines: &[String],
    ) -> Option<String> {
        for name in machines {
            if self.registry.get_or_create(name, true).is_none() {
                continue;
            }
            if self.driver.can_connect(name).await {
                return Some(name.clone());
            }
            self.remove(config, name, RemovalReason::Unavailable);
        }
        None
    }

    /// Binds a machine's credentials into a copy of the runner
    /// configuration. Without a lease this is the on-demand path: the
    /// machine is found or created synchronously and returned as a fresh
    /// lease the caller must release.
    pub async fn use_machine(
        self: &Arc<Self>,
        config: &RunnerConfig,
        lease: Option<&MachineLease>,
    ) -> Result<(RunnerConfig, Option<MachineLease>), Error> {
        let policy = Self::policy(config)?;
        let (name, fresh) = match lease {
            Some(lease) => (lease.name().to_string(), false),
            None => (self.retry_use(config, policy).await?, true),
        };
        let credentials = match self.driver.credentials(&name).await {
            Ok(credentials) => credentials,
            Err(err) => {
                // Never hand out a machine we cannot talk to.
                if fresh {
                    self.release(&MachineLease::new(name.clone()));
                }
                return Err(err)
                    .err_tip(|| format!("while getting credentials of machine {name}"));
            }
        };
        let mut bound = config.clone();
        let mut docker = config.docker.clone().unwrap_or_default();
        docker.host = Some(credentials.host);
        docker.cert_path = credentials.cert_path;
        docker.tls_verify = credentials.tls_verify;
        bound.docker = Some(docker);
        self.registry.mark_used(&name);
        tracing::debug!(machine = name.as_str(), "Machine bound to build");
        Ok((bound, fresh.then(|| MachineLease::new(name))))
    }

    async fn retry_use(
        self: &Arc<Self>,
        config: &RunnerConfig,
        policy: &MachinePoolConfig,
    ) -> Result<String, Error> {
        let template = runner_template(config, policy)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.use_once(config, &template).await {
                Ok(name) => return Ok(name),
                Err(err) if attempt >= USE_RETRY_ATTEMPTS => {
                    return Err(err).err_tip(|| "while looking for a usable machine");
                }
                Err(err) => {
                    tracing::warn!(
                        runner = config.name.as_str(),
                        ?err,
                        attempt,
                        "Retrying machine allocation"
                    );
                    self.now().sleep(self.provision_retry_interval).await;
                }
            }
        }
    }

    async fn use_once(
        self: &Arc<Self>,
        config: &RunnerConfig,
        template: &NameTemplate,
    ) -> Result<String, Error> {
        let machines = self
            .driver
            .list(template)
            .await
            .err_tip(|| format!("while listing machines of runner {}", config.name))?;
        if let Some(name) = self.find_free(config, &machines).await {
            return Ok(name);
        }
        let (name, result) = self.create(config, template, MachineState::Acquired);
        match result.await {
            Ok(creation) => creation.map(|()| name),
            Err(_closed) => Err(make_err!(
                Code::Internal,
                "machine creation task was dropped"
            )),
        }
    }

    /// Returns a machine to the idle pool. Never performs I/O.
    pub fn release(&self, lease: &MachineLease) {
        self.registry.release(lease.name());
    }

    /// Schedules teardown of a machine. The registry entry survives in
    /// Removing until the detached finalizer confirms the machine is gone,
    /// keeping the name out of every capacity decision meanwhile.
    pub(crate) fn remove(self: &Arc<Self>, config: &RunnerConfig, name: &str, reason: RemovalReason) {
        let Some(snapshot) = self.registry.begin_removal(name, reason) else {
            return;
        };
        tracing::warn!(
            machine = name,
            created_ago = ?snapshot.created.elapsed(),
            used_ago = ?snapshot.used.elapsed(),
            %reason,
            "Removing machine"
        );
        if let Ok(policy) = Self::policy(config) {
            debug::write_machine_record(policy, &snapshot, self.now().unix_timestamp());
        }
        let pool = Arc::clone(self);
        let machine_name = name.to_string();
        background_spawn!(
            "machine_removal",
            async move {
                pool.finalize_removal(&machine_name).await;
            },
            machine = name
        );
    }

    /// Destroys the machine with bounded, backed-off retries. Giving up
    /// leaves the record parked in Removing: invisible to reconciliation and
    /// surfaced only through logs, which is the accepted tradeoff for a
    /// driver that persistently fails to remove.
    async fn finalize_removal(&self, name: &str) {
        let mut backoff = self.removal_retry_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !self.driver.exist(name).await {
                tracing::error!(machine = name, "Skipping machine removal, because it doesn't exist");
                break;
            }
            match self.driver.remove(name).await {
                Ok(()) => {
                    tracing::info!(machine = name, "Machine removed");
                    break;
                }
                Err(err) if attempt >= self.removal_max_attempts => {
                    tracing::error!(
                        machine = name,
                        ?err,
                        attempt,
                        "Giving up on machine removal"
                    );
                    return;
                }
                Err(err) => {
                    tracing::warn!(machine = name, ?err, attempt, "Retrying machine removal");
                    tokio::select! {
                        () = self.shutdown.triggered() => return,
                        () = self.now().sleep(backoff) => {}
                    }
                    backoff = core::cmp::min(backoff * 2, MAX_REMOVAL_BACKOFF);
                }
            }
        }
        self.registry.remove_entry(name);
    }

    /// Starts the optional standalone reconciliation task for one runner.
    /// Without it, eviction only happens when acquires arrive, so an idle
    /// fleet would never shrink on a quiet coordinator.
    pub fn spawn_maintenance(self: &Arc<Self>, config: RunnerConfig) {
        let Some(interval) = config
            .machine
            .as_ref()
            .and_then(MachinePoolConfig::idle_scan_interval)
        else {
            return;
        };
        let runner_name = config.name.clone();
        let pool = Arc::clone(self);
        background_spawn!(
            "machine_pool_maintenance",
            async move {
                loop {
                    tokio::select! {
                        () = pool.shutdown.triggered() => return,
                        () = pool.now().sleep(interval) => {}
                    }
                    if let Err(err) = pool.reconcile(&config).await {
                        tracing::error!(
                            runner = config.name.as_str(),
                            ?err,
                            "Machine pool maintenance failed"
                        );
                    }
                }
            },
            runner = runner_name.as_str()
        );
    }
}
