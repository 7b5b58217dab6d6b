//! Per-pool admission control.
//!
//! Each job kind has its own pool with capacity `N`. A slot is held from the
//! moment a job leaves `Pending` until its terminal transition. `R` slots are
//! kept for system jobs: user jobs see an effective capacity of
//! `N - min(R, N - 1)`, so a user can always run at least one job.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::types_jobs::{JobKind, JobOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub active: usize,
    pub capacity: usize,
    pub reserved: usize,
}

pub struct AdmissionPool {
    kind: JobKind,
    capacity: AtomicUsize,
    reserved: AtomicUsize,
    active: AtomicUsize,
    wakeup: Notify,
}

impl AdmissionPool {
    pub fn new(kind: JobKind, capacity: usize, reserved: usize) -> Self {
        Self {
            kind,
            capacity: AtomicUsize::new(capacity.max(1)),
            reserved: AtomicUsize::new(reserved),
            active: AtomicUsize::new(0),
            wakeup: Notify::new(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    fn limit_for(&self, origin: JobOrigin) -> usize {
        let capacity = self.capacity.load(Ordering::Acquire);
        match origin {
            JobOrigin::System => capacity,
            JobOrigin::User => {
                let reserved = self.reserved.load(Ordering::Acquire);
                capacity - reserved.min(capacity.saturating_sub(1))
            }
        }
    }

    /// Takes a slot if one is free for `origin`.
    pub fn try_admit(&self, origin: JobOrigin) -> bool {
        let limit = self.limit_for(origin);
        let granted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .is_ok();
        debug!(pool = %self.kind, ?origin, granted, limit, "admission decision");
        granted
    }

    /// Returns a slot taken by [`try_admit`](Self::try_admit) and wakes the promoter.
    pub fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| active.checked_sub(1));
        self.wake();
    }

    /// Applies at the next admission decision. Running jobs are never evicted.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let old = self.capacity.swap(capacity, Ordering::AcqRel);
        info!(pool = %self.kind, old, new = capacity, "admission capacity changed");
        self.wake();
    }

    pub fn set_reserved(&self, reserved: usize) {
        self.reserved.store(reserved, Ordering::Release);
        self.wake();
    }

    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub async fn woken(&self) {
        self.wakeup.notified().await;
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            active: self.active.load(Ordering::Acquire),
            capacity: self.capacity.load(Ordering::Acquire),
            reserved: self.reserved.load(Ordering::Acquire),
        }
    }
}

/// The build and export pools.
pub struct Admission {
    builds: AdmissionPool,
    exports: AdmissionPool,
}

impl Admission {
    pub fn new(build_capacity: usize, export_capacity: usize, reserved: usize) -> Self {
        Self {
            builds: AdmissionPool::new(JobKind::Build, build_capacity, reserved),
            exports: AdmissionPool::new(JobKind::Export, export_capacity, reserved),
        }
    }

    pub fn pool(&self, kind: JobKind) -> &AdmissionPool {
        match kind {
            JobKind::Build => &self.builds,
            JobKind::Export => &self.exports,
        }
    }
}
