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

use forgerunner_util::instant_wrapper::InstantWrapper;
use parking_lot::RwLock;

use crate::machine::{MachineRecord, MachineState, RemovalReason};

/// In-memory map from machine name to its lifecycle record.
///
/// Every state transition goes through a method on this type and runs under
/// the write lock; the acquire check is the pool's only mutual-exclusion
/// primitive, so no record field is ever touched from outside.
#[derive(Debug)]
pub struct MachineRegistry<I> {
    machines: RwLock<HashMap<String, MachineRecord<I>>>,
    now_fn: fn() -> I,
}

impl<I: InstantWrapper> MachineRegistry<I> {
    #[must_use]
    pub fn new(now_fn: fn() -> I) -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            now_fn,
        }
    }

    /// Looks up `name`, inserting a fresh Idle record on a miss.
    ///
    /// With `acquire` set, the record is only handed out if it is currently
    /// Idle; it transitions to Acquired before the lock is dropped, so
    /// concurrent callers can never both reserve the same machine. `None`
    /// means another caller holds it.
    pub fn get_or_create(&self, name: &str, acquire: bool) -> Option<MachineRecord<I>> {
        let mut machines = self.machines.write();
        let record = machines
            .entry(name.to_string())
            .or_insert_with(|| MachineRecord::new(name.to_string(), (self.now_fn)()));
        if acquire {
            if record.state != MachineState::Idle {
                return None;
            }
            record.state = MachineState::Acquired;
            record.used = (self.now_fn)();
        }
        Some(record.clone())
    }

    /// Marks a just-reserved record as being provisioned by the driver.
    pub(crate) fn begin_creating(&self, name: &str) {
        let mut machines = self.machines.write();
        if let Some(record) = machines.get_mut(name) {
            record.state = MachineState::Creating;
        }
    }

    /// Completes an asynchronous creation: the machine enters `target` and
    /// its usage timestamp restarts.
    pub(crate) fn finish_create(&self, name: &str, target: MachineState) {
        let mut machines = self.machines.write();
        if let Some(record) = machines.get_mut(name) {
            record.state = target;
            record.used = (self.now_fn)();
        }
    }

    /// Binds the record to a running build.
    pub(crate) fn mark_used(&self, name: &str) {
        let mut machines = self.machines.write();
        if let Some(record) = machines.get_mut(name) {
            record.state = MachineState::Used;
            record.used = (self.now_fn)();
        }
    }

    /// Returns a machine to the idle pool. Only a release out of Used counts
    /// as a completed build; releasing an Acquired record unwinds a failed
    /// `use` without touching the accounting.
    pub(crate) fn release(&self, name: &str) {
        let mut machines = self.machines.write();
        if let Some(record) = machines.get_mut(name) {
            if record.state == MachineState::Used {
                record.used = (self.now_fn)();
                record.used_count += 1;
            }
            record.state = MachineState::Idle;
        }
    }

    /// Starts teardown. Returns a snapshot taken before the usage timestamp
    /// is refreshed so the caller can log how long the machine lived.
    pub(crate) fn begin_removal(
        &self,
        name: &str,
        reason: RemovalReason,
    ) -> Option<MachineRecord<I>> {
        let mut machines = self.machines.write();
        let record = machines.get_mut(name)?;
        record.reason = Some(reason);
        record.state = MachineState::Removing;
        let snapshot = record.clone();
        record.used = (self.now_fn)();
        Some(snapshot)
    }

    /// Forgets a record once the driver confirmed the machine is gone.
    pub(crate) fn remove_entry(&self, name: &str) {
        self.machines.write().remove(name);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<MachineRecord<I>> {
        self.machines.read().get(name).cloned()
    }

    /// Snapshot of every record, for status reporting and tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MachineRecord<I>> {
        self.machines.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.read().is_empty()
    }
}
