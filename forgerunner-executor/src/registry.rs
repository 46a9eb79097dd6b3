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

use std::collections::HashMap;
use std::sync::Arc;

use forgerunner_error::{Code, Error, make_err};

use crate::executor::ExecutorProvider;

/// Table of executor providers keyed by the `executor` name runners select
/// in their configuration. Built once at startup and passed by reference;
/// there is no dynamic registration after that.
#[derive(Default)]
pub struct ExecutorRegistry {
    providers: HashMap<String, Arc<dyn ExecutorProvider>>,
}

impl core::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .finish()
    }
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn ExecutorProvider>,
    ) -> Result<(), Error> {
        let name = name.into();
        if self.providers.contains_key(&name) {
            return Err(make_err!(
                Code::AlreadyExists,
                "executor {name} registered twice"
            ));
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ExecutorProvider>> {
        self.providers.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
