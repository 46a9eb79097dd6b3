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

use forgerunner_config::machine_pools::MachinePoolConfig;
use forgerunner_config::runners::RunnerConfig;
use forgerunner_error::{Error, error_if, make_input_err};
use forgerunner_util::instant_wrapper::InstantWrapper;
use rand::Rng;

/// A machine name template with its single `{}` placeholder split out.
///
/// Several runners may share one driver namespace; a candidate name belongs
/// to a runner's pool iff it parses against the runner's template with
/// exactly one non-empty captured token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    prefix: String,
    suffix: String,
}

impl NameTemplate {
    pub fn parse(template: &str) -> Result<Self, Error> {
        let Some((prefix, suffix)) = template.split_once("{}") else {
            return Err(make_input_err!(
                "machine name template {template:?} is missing its {{}} placeholder"
            ));
        };
        error_if!(
            suffix.contains("{}"),
            "machine name template {template:?} has more than one {{}} placeholder"
        );
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    #[must_use]
    pub fn fill(&self, token: &str) -> String {
        format!("{}{token}{}", self.prefix, self.suffix)
    }

    /// Single-token scan: the candidate must carry the template's prefix and
    /// suffix around one non-empty token with no whitespace.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let Some(rest) = candidate.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        let Some(token) = rest.strip_suffix(self.suffix.as_str()) else {
            return false;
        };
        !token.is_empty() && !token.contains(char::is_whitespace)
    }
}

/// Scopes a template to one runner so concurrently configured runners never
/// claim each other's machines.
#[must_use]
pub fn machine_format(runner_token: &str, template: &str) -> String {
    if runner_token.is_empty() {
        return template.to_string();
    }
    format!("runner-{}-{template}", runner_token.to_lowercase())
}

/// The runner-scoped template for a configured machine pool.
pub fn runner_template(
    config: &RunnerConfig,
    policy: &MachinePoolConfig,
) -> Result<NameTemplate, Error> {
    NameTemplate::parse(&machine_format(config.short_token(), &policy.machine_name))
}

/// Generates a name unique across processes and time: the placeholder is
/// filled with `<unix-seconds>-<random-hex>`.
#[must_use]
pub fn new_machine_name<I: InstantWrapper>(template: &NameTemplate, now: &I) -> String {
    let entropy: u32 = rand::rng().random();
    template.fill(&format!("{}-{entropy:x}", now.unix_timestamp()))
}
