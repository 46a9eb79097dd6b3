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
use forgerunner_config::runners::{DockerConfig, RunnerConfig};
use forgerunner_error::Code;
use forgerunner_machine_pool::{
    MachineDriver, MachinePool, MachinePoolOptions, MachineState, RemovalReason,
};
use forgerunner_macro::forgerunner_test;
use forgerunner_util::instant_wrapper::MockInstantWrapped;
use mock_instant::thread_local::MockClock;
use pretty_assertions::assert_eq;
use utils::fake_machine_driver::FakeMachineDriver;

mod utils {
    pub(crate) mod fake_machine_driver;
}

const TEMPLATE: &str = "auto-scale-{}";

fn machine_policy(idle_count: usize, idle_time_secs: u64, limit: usize) -> MachinePoolConfig {
    MachinePoolConfig {
        machine_driver: "fake".to_string(),
        machine_name: TEMPLATE.to_string(),
        machine_options: Vec::new(),
        idle_count,
        idle_time_secs,
        max_builds: 0,
        limit,
        max_growth_rate: 0,
        idle_scan_interval_secs: None,
        machine_binary: "docker-machine".to_string(),
        artifact_dir: None,
    }
}

fn runner_config(machine: MachinePoolConfig) -> RunnerConfig {
    RunnerConfig {
        name: "test-runner".to_string(),
        token: "fr_0123456789".to_string(),
        executor: "docker+autoscale".to_string(),
        docker: Some(DockerConfig {
            image: "alpine:3.20".to_string(),
            ..DockerConfig::default()
        }),
        machine: Some(machine),
    }
}

fn pool_options() -> MachinePoolOptions<MockInstantWrapped> {
    MachinePoolOptions {
        provision_retry_interval: Duration::ZERO,
        removal_retry_backoff: Duration::ZERO,
        ..MachinePoolOptions::new(MockInstantWrapped::default)
    }
}

fn test_pool(driver: &Arc<FakeMachineDriver>) -> Arc<MachinePool<MockInstantWrapped>> {
    MachinePool::new(Arc::clone(driver) as Arc<dyn MachineDriver>, pool_options())
}

fn count_state(pool: &MachinePool<MockInstantWrapped>, state: MachineState) -> usize {
    pool.registry()
        .snapshot()
        .iter()
        .filter(|record| record.state == state)
        .count()
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

#[forgerunner_test]
async fn acquire_requires_machine_configuration() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let mut config = runner_config(machine_policy(1, 5, 0));
    config.machine = None;

    let err = pool.acquire(&config).await.expect_err("must reject");
    assert_eq!(err.code, Code::InvalidArgument);
}

#[forgerunner_test]
async fn acquire_rejects_template_without_placeholder() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let mut policy = machine_policy(1, 5, 0);
    policy.machine_name = "static-name".to_string();
    let config = runner_config(policy);

    let err = pool.acquire(&config).await.expect_err("must reject");
    assert_eq!(err.code, Code::InvalidArgument);
}

// IdleCount=1, IdleTime=5, Limit=0: the first acquire on an empty pool fails
// with "no free machines" but leaves one idle machine behind; the second
// acquire is served from it instantly.
#[forgerunner_test]
async fn first_acquire_preprovisions_then_second_is_served() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(1, 5, 0));

    let err = pool.acquire(&config).await.expect_err("pool is still empty");
    assert_eq!(err.code, Code::ResourceExhausted);
    assert!(err.message_string().contains("no free machines"));

    wait_for(
        || count_state(&pool, MachineState::Idle) == 1,
        "pre-provisioned machine to become idle",
    )
    .await;
    assert_eq!(driver.machines().len(), 1);

    let lease = pool
        .acquire(&config)
        .await
        .expect("second acquire succeeds")
        .expect("machine is bound");
    assert_eq!(driver.machines()[0], lease.name());
    assert_eq!(count_state(&pool, MachineState::Idle), 0);
    assert_eq!(count_state(&pool, MachineState::Acquired), 1);
}

// IdleCount=2: an acquire+release cycle settles the idle pool at exactly two
// machines and repeated cycles never create more.
#[forgerunner_test]
async fn idle_pool_converges_to_target() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(2, 5, 0));

    pool.acquire(&config).await.expect_err("pool is still empty");
    wait_for(
        || count_state(&pool, MachineState::Idle) == 2,
        "idle pool to fill",
    )
    .await;

    for _ in 0..3 {
        let lease = pool
            .acquire(&config)
            .await
            .expect("acquire succeeds")
            .expect("machine is bound");
        assert_eq!(count_state(&pool, MachineState::Idle), 1);
        pool.release(&lease);
        assert_eq!(count_state(&pool, MachineState::Idle), 2);
    }
    assert_eq!(driver.create_calls(), 2);
}

// IdleCount=1, Limit=1: one machine is created and then reused; the limit
// stops both top-up and fresh creation.
#[forgerunner_test]
async fn limit_reuses_the_single_machine() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(1, 5, 1));

    pool.acquire(&config).await.expect_err("pool is still empty");
    wait_for(
        || count_state(&pool, MachineState::Idle) == 1,
        "idle pool to fill",
    )
    .await;

    let first = pool
        .acquire(&config)
        .await
        .expect("acquire succeeds")
        .expect("machine is bound");
    pool.release(&first);
    assert_eq!(count_state(&pool, MachineState::Idle), 1);

    let second = pool
        .acquire(&config)
        .await
        .expect("acquire succeeds")
        .expect("machine is bound");
    assert_eq!(first, second);
    assert_eq!(driver.create_calls(), 1);
}

#[forgerunner_test]
async fn limit_caps_preprovisioning() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(5, 5, 2));

    pool.acquire(&config).await.expect_err("pool is still empty");
    wait_for(
        || count_state(&pool, MachineState::Idle) == 2,
        "idle pool to fill to the limit",
    )
    .await;

    // Another pass must not push total beyond the limit.
    pool.acquire(&config)
        .await
        .expect("a machine is available")
        .expect("machine is bound");
    assert_eq!(driver.create_calls(), 2);
    assert_eq!(driver.machines().len(), 2);
}

#[forgerunner_test]
async fn growth_rate_caps_concurrent_creations() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let mut policy = machine_policy(5, 5, 0);
    policy.max_growth_rate = 2;
    let config = runner_config(policy);

    pool.acquire(&config).await.expect_err("pool is still empty");
    wait_for(
        || count_state(&pool, MachineState::Idle) == 2,
        "first batch to become idle",
    )
    .await;
    assert_eq!(driver.create_calls(), 2);
}

// A machine that already ran MaxBuilds builds is retired by the very next
// reconciliation pass.
#[forgerunner_test]
async fn max_builds_retires_machine() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = MachinePool::new(
        Arc::clone(&driver) as Arc<dyn MachineDriver>,
        MachinePoolOptions {
            provision_retry_interval: Duration::ZERO,
            removal_retry_backoff: Duration::ZERO,
            removal_max_attempts: 1,
            ..MachinePoolOptions::new(MockInstantWrapped::default)
        },
    );
    driver.set_fail_removals(true);
    let mut policy = machine_policy(0, 600, 0);
    policy.max_builds = 1;
    let config = runner_config(policy);

    let (_bound, lease) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let lease = lease.expect("freshly allocated");
    pool.release(&lease);
    assert_eq!(
        pool.registry().get(lease.name()).unwrap().used_count,
        1
    );

    let acquired = pool.acquire(&config).await.expect("on demand mode");
    assert!(acquired.is_none());
    wait_for(
        || {
            pool.registry()
                .get(lease.name())
                .is_some_and(|record| record.state == MachineState::Removing)
        },
        "machine to enter removal",
    )
    .await;
    let record = pool.registry().get(lease.name()).unwrap();
    assert_eq!(record.reason, Some(RemovalReason::TooManyBuilds));
    wait_for(|| driver.remove_calls(lease.name()) == 1, "removal attempt").await;
}

// An idle machine is only evicted once it is both past IdleTime and beyond
// the idle target.
#[forgerunner_test]
async fn idle_timeout_evicts_stale_machines() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(0, 5, 0));

    let (_bound, lease) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let lease = lease.expect("freshly allocated");
    pool.release(&lease);

    // Within IdleTime the machine survives and is simply reused.
    MockClock::advance(Duration::from_secs(2));
    let reacquired = pool
        .acquire(&config)
        .await
        .expect("acquire succeeds")
        .expect("idle machine is reused");
    assert_eq!(reacquired.name(), lease.name());
    pool.release(&reacquired);

    MockClock::advance(Duration::from_secs(6));
    let acquired = pool.acquire(&config).await.expect("on demand mode");
    assert!(acquired.is_none());
    wait_for(
        || pool.registry().get(lease.name()).is_none(),
        "stale machine to be removed",
    )
    .await;
    assert_eq!(driver.machines().len(), 0);
}

#[forgerunner_test]
async fn idle_timeout_respects_idle_target() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(1, 5, 0));

    let (_bound, first) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let first = first.expect("freshly allocated");
    let (_bound, second) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let second = second.expect("freshly allocated");
    pool.release(&first);
    pool.release(&second);

    MockClock::advance(Duration::from_secs(6));
    let lease = pool
        .acquire(&config)
        .await
        .expect("acquire succeeds")
        .expect("one machine survives the idle target");
    assert_eq!(lease.name(), first.name());
    wait_for(
        || pool.registry().get(second.name()).is_none(),
        "surplus idle machine to be removed",
    )
    .await;
}

// `find_free` never hands out a machine that fails the liveness probe; the
// dead machine is removed instead.
#[forgerunner_test]
async fn unreachable_machine_is_removed_not_returned() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = MachinePool::new(
        Arc::clone(&driver) as Arc<dyn MachineDriver>,
        MachinePoolOptions {
            provision_retry_interval: Duration::ZERO,
            removal_retry_backoff: Duration::ZERO,
            removal_max_attempts: 1,
            ..MachinePoolOptions::new(MockInstantWrapped::default)
        },
    );
    driver.set_fail_removals(true);
    let config = runner_config(machine_policy(1, 600, 0));

    let (_bound, lease) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let lease = lease.expect("freshly allocated");
    pool.release(&lease);
    driver.set_unreachable(lease.name());

    let acquired = pool.acquire(&config).await.expect("no machine is bound");
    assert!(acquired.is_none());
    wait_for(
        || {
            pool.registry()
                .get(lease.name())
                .is_some_and(|record| record.state == MachineState::Removing)
        },
        "dead machine to enter removal",
    )
    .await;
    assert_eq!(
        pool.registry().get(lease.name()).unwrap().reason,
        Some(RemovalReason::Unavailable)
    );
}

// UsedCount increments exactly once per full acquire/use/release cycle and
// never for a lease that was released without running a build.
#[forgerunner_test]
async fn used_count_tracks_completed_builds_only() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(0, 600, 0));

    let (_bound, lease) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let lease = lease.expect("freshly allocated");
    assert_eq!(
        pool.registry().get(lease.name()).unwrap().state,
        MachineState::Used
    );
    pool.release(&lease);
    let record = pool.registry().get(lease.name()).unwrap();
    assert_eq!(record.used_count, 1);
    assert_eq!(record.state, MachineState::Idle);

    // Acquired but never used: no build is counted.
    let config = runner_config(machine_policy(1, 600, 0));
    let reacquired = pool
        .acquire(&config)
        .await
        .expect("acquire succeeds")
        .expect("machine is bound");
    pool.release(&reacquired);
    assert_eq!(pool.registry().get(lease.name()).unwrap().used_count, 1);
}

// A name whose creation always fails is retried through the bounded
// provisioning loop on every allocation attempt, then surfaced as an error.
#[forgerunner_test]
async fn failing_creation_exhausts_bounded_retries() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let mut policy = machine_policy(0, 600, 0);
    policy.machine_name = "create-fail-{}".to_string();
    let config = runner_config(policy);

    let err = pool
        .use_machine(&config, None)
        .await
        .expect_err("creation can never succeed");
    assert!(err.message_string().contains("while creating machine"));

    // Three allocation attempts, each one driver create plus three
    // provision retries.
    assert_eq!(driver.create_calls(), 3);
    assert_eq!(driver.provision_calls(), 9);

    // The half-created machines are torn down; the driver never saw them, so
    // removal is skipped entirely.
    wait_for(|| pool.registry().is_empty(), "failed machines to be reaped").await;
}

// Two concurrent on-demand allocations get two distinct machines.
#[forgerunner_test]
async fn concurrent_on_demand_use_creates_distinct_machines() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(0, 600, 0));

    let (first, second) = tokio::join!(
        pool.use_machine(&config, None),
        pool.use_machine(&config, None)
    );
    let (_bound, first) = first.expect("first allocation");
    let (_bound, second) = second.expect("second allocation");
    let first = first.expect("freshly allocated");
    let second = second.expect("freshly allocated");

    assert_ne!(first.name(), second.name());
    assert_eq!(driver.create_calls(), 2);
    assert_eq!(count_state(&pool, MachineState::Used), 2);
}

#[forgerunner_test]
async fn concurrent_acquires_never_share_a_machine() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(1, 600, 0));

    pool.acquire(&config).await.expect_err("pool is still empty");
    wait_for(
        || count_state(&pool, MachineState::Idle) == 1,
        "idle pool to fill",
    )
    .await;

    let (first, second) = tokio::join!(pool.acquire(&config), pool.acquire(&config));
    let leases: Vec<_> = [first, second]
        .into_iter()
        .filter_map(Result::ok)
        .flatten()
        .collect();
    assert_eq!(leases.len(), 1, "exactly one caller may win the machine");
}

// Use never hands out a machine whose credentials cannot be fetched; the
// fresh allocation is returned to the pool untouched.
#[forgerunner_test]
async fn credentials_failure_releases_fresh_machine() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    driver.set_fail_credentials(true);
    let config = runner_config(machine_policy(0, 600, 0));

    let err = pool
        .use_machine(&config, None)
        .await
        .expect_err("credentials are unavailable");
    assert!(err.message_string().contains("while getting credentials"));

    let records = pool.registry().snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, MachineState::Idle);
    assert_eq!(records[0].used_count, 0);
}

#[forgerunner_test]
async fn use_binds_machine_credentials_into_config() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let config = runner_config(machine_policy(0, 600, 0));

    let (bound, lease) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let lease = lease.expect("freshly allocated");
    let docker = bound.docker.expect("docker config is carried over");
    assert_eq!(docker.host.as_deref(), Some(&*format!("tcp://{}:2376", lease.name())));
    assert_eq!(
        docker.cert_path.as_deref(),
        Some(&*format!("/certs/{}", lease.name()))
    );
    assert!(docker.tls_verify);
    assert_eq!(docker.image, "alpine:3.20");
    // The original configuration is untouched.
    assert_eq!(config.docker.unwrap().host, None);
}

#[forgerunner_test]
async fn shutdown_stops_removal_retries() {
    let driver = Arc::new(FakeMachineDriver::new());
    let options = MachinePoolOptions {
        provision_retry_interval: Duration::ZERO,
        removal_retry_backoff: Duration::from_secs(300),
        ..MachinePoolOptions::new(MockInstantWrapped::default)
    };
    let shutdown = options.shutdown.clone();
    let pool = MachinePool::new(Arc::clone(&driver) as Arc<dyn MachineDriver>, options);
    driver.set_fail_removals(true);
    let mut policy = machine_policy(0, 5, 0);
    policy.max_builds = 1;
    let config = runner_config(policy);

    let (_bound, lease) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let lease = lease.expect("freshly allocated");
    pool.release(&lease);
    pool.acquire(&config).await.expect("on demand mode");

    wait_for(|| driver.remove_calls(lease.name()) == 1, "first removal attempt").await;
    shutdown.trigger();
    // The finalizer is parked in its backoff; shutdown must end it instead
    // of a second attempt.
    MockClock::advance(Duration::from_secs(301));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(driver.remove_calls(lease.name()), 1);
    assert_eq!(
        pool.registry().get(lease.name()).unwrap().state,
        MachineState::Removing
    );
}

// The standalone maintenance timer reaps idle machines with no acquire
// traffic at all.
#[forgerunner_test]
async fn maintenance_timer_reaps_idle_machines() {
    let driver = Arc::new(FakeMachineDriver::new());
    let pool = test_pool(&driver);
    let mut policy = machine_policy(0, 5, 0);
    policy.idle_scan_interval_secs = Some(1);
    let config = runner_config(policy);

    let (_bound, lease) = pool
        .use_machine(&config, None)
        .await
        .expect("on demand machine");
    let lease = lease.expect("freshly allocated");
    pool.release(&lease);

    pool.spawn_maintenance(config);
    // Step the clock in small increments so every pending mocked sleep gets
    // to observe the advance.
    for _ in 0..1000 {
        if pool.registry().get(lease.name()).is_none() {
            break;
        }
        MockClock::advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(
        pool.registry().get(lease.name()).is_none(),
        "maintenance reaped the idle machine"
    );
    assert_eq!(driver.machines().len(), 0);
}
