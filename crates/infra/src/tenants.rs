//! Tenant roster resolution.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use regards_core::TenantName;

/// Supplies the active tenant roster and maintenance state.
///
/// The roster is re-read on every scheduling tick, so implementations should
/// be cheap to call.
pub trait TenantResolver: Send + Sync {
    /// Active tenants, in scheduling order, without duplicates.
    fn active_tenants(&self) -> Vec<TenantName>;

    /// Tenants in maintenance are skipped by the scheduler.
    fn is_in_maintenance(&self, tenant: &TenantName) -> bool;
}

impl<R: TenantResolver + ?Sized> TenantResolver for Arc<R> {
    fn active_tenants(&self) -> Vec<TenantName> {
        (**self).active_tenants()
    }

    fn is_in_maintenance(&self, tenant: &TenantName) -> bool {
        (**self).is_in_maintenance(tenant)
    }
}

#[derive(Debug, Default)]
struct Roster {
    tenants: Vec<TenantName>,
    maintenance: HashSet<TenantName>,
}

/// Fixed roster, updatable at runtime.
#[derive(Debug, Default)]
pub struct StaticTenantResolver {
    roster: RwLock<Roster>,
}

impl StaticTenantResolver {
    /// Duplicates are dropped, first occurrence wins.
    pub fn new(tenants: impl IntoIterator<Item = TenantName>) -> Self {
        Self {
            roster: RwLock::new(Roster {
                tenants: dedup(tenants),
                maintenance: HashSet::new(),
            }),
        }
    }

    /// Replace the roster. Duplicates are dropped, first occurrence wins.
    pub fn set_tenants(&self, tenants: impl IntoIterator<Item = TenantName>) {
        let tenants = dedup(tenants);
        if let Ok(mut roster) = self.roster.write() {
            roster.tenants = tenants;
        }
    }

    pub fn set_maintenance(&self, tenant: &TenantName, in_maintenance: bool) {
        if let Ok(mut roster) = self.roster.write() {
            if in_maintenance {
                roster.maintenance.insert(tenant.clone());
            } else {
                roster.maintenance.remove(tenant);
            }
        }
    }
}

fn dedup(tenants: impl IntoIterator<Item = TenantName>) -> Vec<TenantName> {
    let mut seen = HashSet::new();
    tenants
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

impl TenantResolver for StaticTenantResolver {
    fn active_tenants(&self) -> Vec<TenantName> {
        self.roster
            .read()
            .map(|r| r.tenants.clone())
            .unwrap_or_default()
    }

    fn is_in_maintenance(&self, tenant: &TenantName) -> bool {
        self.roster
            .read()
            .map(|r| r.maintenance.contains(tenant))
            .unwrap_or(false)
    }
}
