//! Round-robin credential selection with quarantine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::credentials::{CredentialPool, CredentialRecord};
use crate::error::{ProxyError, Result};

pub const ALARM_TARGET: &str = "flow_proxy::alarm";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerStats {
    pub total_requests: u64,
    pub available_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
}

#[derive(Debug)]
struct PoolState {
    available: Vec<Arc<CredentialRecord>>,
    quarantined: Vec<Arc<CredentialRecord>>,
    cursor: usize,
    total_served: u64,
}

/// Shared credential rotation. One instance serves every request handler in the process.
///
/// Records are compared by identity (`Arc::ptr_eq`), so two records with equal fields are still
/// distinct pool members.
#[derive(Debug)]
pub struct LoadBalancer {
    // Original pool order, used to restore rotation on reset.
    records: Vec<Arc<CredentialRecord>>,
    state: Mutex<PoolState>,
}

impl LoadBalancer {
    pub fn new(records: Vec<CredentialRecord>) -> Result<Self> {
        if records.is_empty() {
            error!("cannot build a load balancer from an empty credential list");
            return Err(ProxyError::EmptyPool);
        }
        let records: Vec<_> = records.into_iter().map(Arc::new).collect();
        info!(count = records.len(), "load balancer initialised");
        Ok(Self {
            state: Mutex::new(PoolState {
                available: records.clone(),
                quarantined: Vec::new(),
                cursor: 0,
                total_served: 0,
            }),
            records,
        })
    }

    pub fn from_pool(pool: CredentialPool) -> Result<Self> {
        Self::new(pool.into_records())
    }

    /// Returns the credential under the cursor and advances it, wrapping at the end.
    pub fn next(&self) -> Result<Arc<CredentialRecord>> {
        let mut state = self.lock();
        if state.available.is_empty() {
            error!(
                quarantined = state.quarantined.len(),
                "no available credentials; reset quarantine to recover"
            );
            return Err(ProxyError::NoAvailableCredentials);
        }

        let cursor = state.cursor;
        let record = state.available[cursor].clone();
        state.total_served += 1;
        state.cursor = (cursor + 1) % state.available.len();
        info!(
            credential = %record.label(),
            request = state.total_served,
            position = cursor + 1,
            available = state.available.len(),
            "selected credential"
        );
        Ok(record)
    }

    /// Removes `record` from rotation. Records that are not currently available are left alone.
    pub fn quarantine(&self, record: &Arc<CredentialRecord>) {
        let mut state = self.lock();
        let Some(position) = state
            .available
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, record))
        else {
            warn!(
                credential = %record.label(),
                "credential is not in rotation; ignoring quarantine"
            );
            return;
        };

        let removed = state.available.remove(position);
        state.quarantined.push(removed);
        state.cursor = match state.available.len() {
            0 => 0,
            len => state.cursor % len,
        };

        warn!(
            credential = %record.label(),
            available = state.available.len(),
            quarantined = state.quarantined.len(),
            "credential quarantined"
        );
        if state.available.is_empty() {
            error!(
                target: ALARM_TARGET,
                alarm = true,
                quarantined = state.quarantined.len(),
                "all credentials are quarantined; service cannot authenticate requests"
            );
        }
    }

    /// Puts every quarantined credential back into rotation in original pool order.
    ///
    /// The available list is rebuilt from the pool rather than having the quarantined records
    /// appended to its end, so the first `next` after a reset always returns the first record.
    pub fn reset_quarantine(&self) {
        let mut state = self.lock();
        if state.quarantined.is_empty() {
            return;
        }
        let restored = state.quarantined.len();
        state.quarantined.clear();
        state.available = self.records.clone();
        state.cursor = 0;
        info!(
            restored,
            available = state.available.len(),
            "quarantine reset"
        );
    }

    pub fn stats(&self) -> BalancerStats {
        let state = self.lock();
        BalancerStats {
            total_requests: state.total_served,
            available_count: state.available.len(),
            failed_count: state.quarantined.len(),
            total_count: state.available.len() + state.quarantined.len(),
        }
    }

    pub fn records(&self) -> &[Arc<CredentialRecord>] {
        &self.records
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
