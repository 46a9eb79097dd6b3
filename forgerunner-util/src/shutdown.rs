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

use tokio::sync::watch;

/// Cancellation handle shared with detached background tasks so they stop
/// retrying when the process is shutting down.
///
/// Cloning is cheap; every clone observes the same trigger.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    inner: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { inner: Arc::new(tx) }
    }

    /// Signals every holder of this token. Idempotent.
    pub fn trigger(&self) {
        self.inner.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.inner.borrow()
    }

    /// Resolves once the token is triggered.
    pub async fn triggered(&self) {
        let mut rx = self.inner.subscribe();
        // The sender cannot be dropped while `self` holds it.
        drop(rx.wait_for(|triggered| *triggered).await);
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
