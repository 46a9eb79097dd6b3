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

//! The generic build-execution boundary.
//!
//! Every backend (shell, docker, autoscaled machine pool) implements the same
//! [`ExecutorProvider`] contract, so the dispatcher drives builds without
//! knowing which backend serves them. Providers are collected into an
//! [`ExecutorRegistry`] built once at startup.

mod docker;
mod executor;
mod features;
mod registry;

pub use docker::{DockerClient, DockerExecutor, DockerExecutorProvider};
pub use executor::{Executor, ExecutorData, ExecutorProvider};
pub use features::FeaturesInfo;
pub use registry::ExecutorRegistry;
