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

/// Capabilities a backend reports to the coordinator. Providers flip the
/// booleans they support inside [`get_features`].
///
/// [`get_features`]: crate::ExecutorProvider::get_features
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeaturesInfo {
    pub variables: bool,
    pub image: bool,
    pub services: bool,
    pub cache: bool,
    pub artifacts: bool,
    pub session: bool,
}
