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

pub mod instant_wrapper;
pub mod shutdown;
pub mod task;

// Re-export tracing mostly for use in macros.
pub use tracing as __tracing;

/// Initialize tracing.
pub fn init_tracing() -> Result<(), forgerunner_error::Error> {
    static LOGGING_INITIALIZED: std::sync::Mutex<bool> = std::sync::Mutex::new(false);
    let mut logging_initialized_guard = LOGGING_INITIALIZED.lock().unwrap();
    if *logging_initialized_guard {
        return Err(forgerunner_error::make_err!(
            forgerunner_error::Code::Internal,
            "Logging already initialized"
        ));
    }
    *logging_initialized_guard = true;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .pretty()
        .with_timer(tracing_subscriber::fmt::time::time())
        .with_env_filter(env_filter)
        .init();
    Ok(())
}
