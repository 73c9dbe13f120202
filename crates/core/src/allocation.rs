//! Round-robin fair-share allocation of job slots across tenants.
//!
//! ## Design
//!
//! - A global capacity (the job pool size) is split evenly between tenants,
//!   rounding up: `max_size = ceil(capacity / tenant_count)`.
//! - Each call examines tenants starting at a persistent cursor and selects
//!   the first one with a free slot (first fit, not best fit).
//! - The cursor advances past every examined tenant, including the selected
//!   one, so the next call resumes after it.
//!
//! The queue list is only rebuilt when the number of tenants changes. A
//! same-size swap of tenant names keeps the stale list: the swapped-in tenant
//! has no queue and is never selected until a later size change rebuilds it.
//! This is the observed behaviour of the legacy scheduler and is kept as is.
//!
//! The allocator is not thread-safe: [`AllocatorState`] is a single-owner
//! value driven by one scheduling thread.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::id::TenantName;

/// Per-tenant slot accounting for one allocation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQueue {
    pub name: TenantName,
    /// Jobs currently allocated/running for this tenant.
    pub current_size: usize,
    /// Concurrent jobs permitted for this tenant in the current round.
    pub max_size: usize,
}

impl TenantQueue {
    pub fn new(name: TenantName, max_size: usize) -> Self {
        Self {
            name,
            current_size: 0,
            max_size,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_size < self.max_size
    }

    /// Record one more running job.
    pub fn acquire(&mut self) {
        self.current_size += 1;
    }

    /// Record one finished job.
    pub fn release(&mut self) {
        self.current_size = self.current_size.saturating_sub(1);
    }
}

/// Outcome of one allocation decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationResult {
    /// Tenant allowed to launch one more job, if any has a free slot.
    pub selected_tenant: Option<TenantName>,
    /// Queue list to carry into the next round.
    pub queues: Vec<TenantQueue>,
}

/// Decide which tenant may receive the next job.
///
/// `cursor` is the round-robin position and must survive across calls. It is
/// advanced once per examined tenant. An empty roster selects nothing and
/// leaves both the cursor and the previous queues untouched.
pub fn get_next_queue(
    tenants: &[TenantName],
    previous_queues: Option<Vec<TenantQueue>>,
    capacity: NonZeroUsize,
    cursor: &mut usize,
) -> AllocationResult {
    let count = tenants.len();
    if count == 0 {
        return AllocationResult {
            selected_tenant: None,
            queues: previous_queues.unwrap_or_default(),
        };
    }

    let queues = match previous_queues {
        Some(queues) if queues.len() == count => queues,
        previous => rebuild_queues(tenants, previous.as_deref(), capacity),
    };

    // The roster may have shrunk since the cursor was last advanced.
    *cursor %= count;

    let mut selected_tenant = None;
    for _ in 0..count {
        let candidate = &tenants[*cursor];
        *cursor = (*cursor + 1) % count;

        let eligible = queues
            .iter()
            .find(|q| &q.name == candidate)
            .is_some_and(TenantQueue::has_capacity);
        if eligible {
            selected_tenant = Some(candidate.clone());
            break;
        }
    }

    debug!(
        selected = ?selected_tenant.as_ref().map(TenantName::as_str),
        cursor = *cursor,
        tenant_count = count,
        "allocation decided"
    );

    AllocationResult {
        selected_tenant,
        queues,
    }
}

fn rebuild_queues(
    tenants: &[TenantName],
    previous: Option<&[TenantQueue]>,
    capacity: NonZeroUsize,
) -> Vec<TenantQueue> {
    let max_size = capacity.get().div_ceil(tenants.len());
    debug!(
        tenant_count = tenants.len(),
        previous_count = previous.map(<[TenantQueue]>::len),
        max_size,
        "rebuilding tenant queues"
    );

    tenants
        .iter()
        .map(|name| {
            let current_size = previous
                .and_then(|queues| queues.iter().find(|q| &q.name == name))
                .map_or(0, |q| q.current_size);
            TenantQueue {
                name: name.clone(),
                current_size,
                max_size,
            }
        })
        .collect()
}

/// State carried between allocation rounds: the cursor and the queue list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorState {
    pub cursor: usize,
    pub queues: Option<Vec<TenantQueue>>,
}

impl AllocatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one allocation round and keep the resulting queues.
    pub fn next(&mut self, tenants: &[TenantName], capacity: NonZeroUsize) -> Option<TenantName> {
        let previous = self.queues.take();
        let result = get_next_queue(tenants, previous, capacity, &mut self.cursor);
        self.queues = Some(result.queues);
        result.selected_tenant
    }

    fn queue_mut(&mut self, tenant: &TenantName) -> Option<&mut TenantQueue> {
        self.queues
            .as_mut()?
            .iter_mut()
            .find(|q| &q.name == tenant)
    }
}

/// Allocator owning its round-robin state for the lifetime of a scheduler.
#[derive(Debug, Clone)]
pub struct TenantJobAllocator {
    capacity: NonZeroUsize,
    state: AllocatorState,
}

impl TenantJobAllocator {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            state: AllocatorState::new(),
        }
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    /// Select the next tenant allowed to launch a job.
    pub fn next(&mut self, tenants: &[TenantName]) -> Option<TenantName> {
        self.state.next(tenants, self.capacity)
    }

    /// Record a job start for `tenant`. Returns `false` when the tenant has no queue.
    pub fn acquire(&mut self, tenant: &TenantName) -> bool {
        match self.state.queue_mut(tenant) {
            Some(queue) => {
                queue.acquire();
                true
            }
            None => false,
        }
    }

    /// Record a job end for `tenant`. Returns `false` when the tenant has no queue.
    pub fn release(&mut self, tenant: &TenantName) -> bool {
        match self.state.queue_mut(tenant) {
            Some(queue) => {
                queue.release();
                true
            }
            None => false,
        }
    }

    pub fn queues(&self) -> &[TenantQueue] {
        self.state.queues.as_deref().unwrap_or(&[])
    }

    pub fn state(&self) -> &AllocatorState {
        &self.state
    }
}
