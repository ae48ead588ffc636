// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Invocation Version Fence
//!
//! Tracks the latest issued version of every pending tool invocation so that a
//! delayed or superseded approval cannot be applied twice.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::domain::run::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationCheck {
    Valid,
    NotPending,
    Stale { current_version: u64 },
}

#[derive(Default)]
pub struct InvocationVersionFence {
    pending: Mutex<HashMap<(RunId, String), u64>>,
}

impl InvocationVersionFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `version` as the latest pending version of the invocation.
    pub fn register(&self, run_id: RunId, invocation_id: &str, version: u64) {
        let previous = self
            .pending
            .lock()
            .insert((run_id, invocation_id.to_string()), version);
        if let Some(previous) = previous {
            tracing::debug!(
                run_id = %run_id,
                invocation_id,
                previous,
                version,
                "Re-issued pending invocation"
            );
        }
    }

    /// Check the version and, when it is current, take the invocation out of
    /// the pending set in the same step. Concurrent duplicates of one approval
    /// therefore see `Valid` at most once.
    pub fn claim(&self, run_id: RunId, invocation_id: &str, version: u64) -> InvocationCheck {
        let mut pending = self.pending.lock();
        let key = (run_id, invocation_id.to_string());
        match pending.get(&key) {
            None => InvocationCheck::NotPending,
            Some(current) if *current == version => {
                pending.remove(&key);
                InvocationCheck::Valid
            }
            Some(current) => InvocationCheck::Stale {
                current_version: *current,
            },
        }
    }

    /// Put a claimed version back after its approval was not applied. A version
    /// registered in the meantime wins.
    pub fn release(&self, run_id: RunId, invocation_id: &str, version: u64) {
        self.pending
            .lock()
            .entry((run_id, invocation_id.to_string()))
            .or_insert(version);
    }

    pub fn clear_run(&self, run_id: RunId) {
        self.pending.lock().retain(|(run, _), _| *run != run_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
