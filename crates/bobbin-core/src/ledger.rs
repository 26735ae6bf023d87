//! Resource ledger: committed compute/memory/storage against configured caps.
//!
//! Reservations are all-or-nothing and released exactly once. `Reservation`
//! is consumed by `release`, and its `Drop` releases it if nobody did, so a
//! panicking or aborted execution path cannot leak capacity.
//!
//! The ledger serves requests in the order they are offered. Fairness belongs
//! to the admission order, not here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::domain::{ReservationId, ResourceClass, ResourceDenied, ResourceRequest, TaskId};
use crate::ports::IdGenerator;

const CLASSES: [ResourceClass; 3] = [
    ResourceClass::Cpu,
    ResourceClass::Memory,
    ResourceClass::Storage,
];

/// Configured capacity per resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCaps {
    pub cpu: u64,
    pub memory_mb: u64,
    pub storage_mb: u64,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            cpu: 8,
            memory_mb: 16 * 1024,
            storage_mb: 100 * 1024,
        }
    }
}

impl ResourceCaps {
    pub fn amount(&self, class: ResourceClass) -> u64 {
        match class {
            ResourceClass::Cpu => self.cpu,
            ResourceClass::Memory => self.memory_mb,
            ResourceClass::Storage => self.storage_mb,
        }
    }
}

/// Point-in-time view for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub caps: ResourceCaps,
    pub committed: ResourceRequest,
    pub outstanding: usize,
    pub granted: u64,
    pub released: u64,
}

impl LedgerSnapshot {
    /// Committed share of the cap in percent. A zero cap reads as 0%.
    pub fn utilization(&self, class: ResourceClass) -> f64 {
        let cap = self.caps.amount(class);
        if cap == 0 {
            return 0.0;
        }
        self.committed.amount(class) as f64 * 100.0 / cap as f64
    }
}

struct LedgerState {
    caps: ResourceCaps,
    committed: ResourceRequest,
    outstanding: HashMap<ReservationId, (TaskId, ResourceRequest)>,
    granted: u64,
    released: u64,
}

pub struct ResourceLedger {
    state: Mutex<LedgerState>,
    ids: Arc<dyn IdGenerator>,
}

impl ResourceLedger {
    pub fn new(caps: ResourceCaps, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                caps,
                committed: ResourceRequest::default(),
                outstanding: HashMap::new(),
                granted: 0,
                released: 0,
            }),
            ids,
        }
    }

    /// Checks every class against remaining capacity and commits all of them,
    /// or none. Zero-sized requests always succeed.
    pub fn try_reserve(
        self: &Arc<Self>,
        task_id: TaskId,
        request: ResourceRequest,
    ) -> Result<Reservation, ResourceDenied> {
        let mut state = self.lock();

        for class in CLASSES {
            let requested = request.amount(class);
            if requested == 0 {
                continue;
            }
            let cap = state.caps.amount(class);
            let committed = state.committed.amount(class);
            let available = cap.saturating_sub(committed);
            if requested > available {
                debug!(task_id = %task_id, %class, requested, available, "reservation denied");
                return Err(ResourceDenied {
                    class,
                    requested,
                    available,
                });
            }
        }

        state.committed.cpu += request.cpu;
        state.committed.memory_mb += request.memory_mb;
        state.committed.storage_mb += request.storage_mb;
        state.granted += 1;

        let id = self.ids.generate_reservation_id();
        state.outstanding.insert(id, (task_id, request));
        drop(state);

        Ok(Reservation {
            id,
            task_id,
            request,
            ledger: Arc::clone(self),
            released: false,
        })
    }

    /// Changes caps at runtime. Existing reservations are kept even if they
    /// now exceed the new cap; new requests see the reduced headroom.
    pub fn set_capacity(&self, caps: ResourceCaps) {
        let mut state = self.lock();
        info!(cpu = caps.cpu, memory_mb = caps.memory_mb, storage_mb = caps.storage_mb, "resource caps updated");
        state.caps = caps;
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.lock();
        LedgerSnapshot {
            caps: state.caps,
            committed: state.committed,
            outstanding: state.outstanding.len(),
            granted: state.granted,
            released: state.released,
        }
    }

    /// Returns false if the handle was unknown (already released).
    fn release_id(&self, id: ReservationId) -> bool {
        let mut state = self.lock();
        let Some((task_id, request)) = state.outstanding.remove(&id) else {
            warn!(reservation = %id, "release of unknown reservation ignored");
            return false;
        };
        state.committed.cpu = state.committed.cpu.saturating_sub(request.cpu);
        state.committed.memory_mb = state.committed.memory_mb.saturating_sub(request.memory_mb);
        state.committed.storage_mb = state.committed.storage_mb.saturating_sub(request.storage_mb);
        state.released += 1;
        debug!(task_id = %task_id, reservation = %id, "reservation released");
        true
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Granted capacity held by one task attempt.
pub struct Reservation {
    id: ReservationId,
    task_id: TaskId,
    request: ResourceRequest,
    ledger: Arc<ResourceLedger>,
    released: bool,
}

impl Reservation {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn request(&self) -> ResourceRequest {
        self.request
    }

    pub fn release(mut self) -> bool {
        self.release_once()
    }

    fn release_once(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.ledger.release_id(self.id)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("request", &self.request)
            .field("released", &self.released)
            .finish()
    }
}
