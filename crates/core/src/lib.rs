//! `regards-core`: pure domain building blocks for job scheduling.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model and the tenant job allocator.

pub mod allocation;
pub mod error;
pub mod id;

pub use allocation::{AllocationResult, AllocatorState, TenantJobAllocator, TenantQueue, get_next_queue};
pub use error::{DomainError, DomainResult};
pub use id::{LockOwner, TenantName};
