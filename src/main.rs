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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use clap::Parser;
use forgerunner_config::runners::AgentConfig;
use forgerunner_error::{Error, ResultExt, make_input_err};
use forgerunner_executor::{DockerExecutorProvider, ExecutorRegistry, FeaturesInfo};
use forgerunner_machine_pool::{
    MachinePool, MachinePoolOptions, MachineProvider, ShellMachineDriver,
};
use forgerunner_util::shutdown::ShutdownToken;

/// Executor name served by the plain docker backend.
const DOCKER_EXECUTOR: &str = "docker";
/// Executor name served by the autoscaling machine pool.
const AUTOSCALE_EXECUTOR: &str = "docker+autoscale";

#[derive(Parser, Debug)]
#[command(name = "forgerunner", about = "CI job execution agent", version)]
struct Args {
    /// Path to the agent configuration file (json5).
    #[arg(short = 'c', long, default_value = "forgerunner.json5")]
    config: PathBuf,
}

async fn load_config(path: &PathBuf) -> Result<AgentConfig, Error> {
    let data = tokio::fs::read_to_string(path)
        .await
        .err_tip(|| format!("while reading configuration {}", path.display()))?;
    serde_json5::from_str(&data)
        .map_err(|err| make_input_err!("while parsing {}: {err}", path.display()))
}

async fn run(args: Args) -> Result<(), Error> {
    let config = load_config(&args.config).await?;
    let shutdown = ShutdownToken::new();

    let docker_provider = Arc::new(DockerExecutorProvider);
    let mut registry = ExecutorRegistry::new();
    registry.register(DOCKER_EXECUTOR, docker_provider.clone())?;

    // All machine backed runners share one pool; machine names partition it
    // per runner through their templates.
    let machine_binary = config
        .runners
        .iter()
        .filter_map(|runner| runner.machine.as_ref())
        .map(|machine| machine.machine_binary.clone())
        .next()
        .unwrap_or_else(|| "docker-machine".to_string());
    let pool = MachinePool::new(
        Arc::new(ShellMachineDriver::new(machine_binary)),
        MachinePoolOptions {
            shutdown: shutdown.clone(),
            ..MachinePoolOptions::new(SystemTime::now)
        },
    );
    registry.register(
        AUTOSCALE_EXECUTOR,
        Arc::new(MachineProvider::new(Arc::clone(&pool), docker_provider)),
    )?;

    for runner in &config.runners {
        let Some(provider) = registry.get(&runner.executor) else {
            return Err(make_input_err!(
                "runner {} uses unknown executor {}",
                runner.name,
                runner.executor
            ));
        };
        let mut features = FeaturesInfo::default();
        provider.get_features(&mut features);
        tracing::info!(
            runner = runner.name.as_str(),
            executor = runner.executor.as_str(),
            image = features.image,
            services = features.services,
            "Runner registered"
        );
        if runner.executor == AUTOSCALE_EXECUTOR {
            pool.spawn_maintenance(runner.clone());
        }
    }

    tracing::info!(
        executors = ?registry.names(),
        runners = config.runners.len(),
        concurrent = config.concurrent,
        "Agent ready"
    );
    tokio::signal::ctrl_c()
        .await
        .err_tip(|| "while waiting for the shutdown signal")?;
    tracing::info!("Shutting down");
    shutdown.trigger();
    Ok(())
}

fn main() -> Result<(), Error> {
    forgerunner_util::init_tracing()?;
    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .err_tip(|| "while starting the tokio runtime")?;
    runtime.block_on(run(args))
}
