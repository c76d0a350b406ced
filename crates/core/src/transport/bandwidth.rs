//! Global bandwidth sharing across chunked senders.
//!
//! A configured total rate is divided evenly among the senders that had
//! something to send during the current tick:
//!
//! `share = global_limit / max(active_senders, 1)`
//!
//! Idle senders are not counted, so they do not shrink everyone else's share.
//! A global limit of zero means unlimited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashSet;

pub type SenderId = u64;

/// Shared allocator of the global send budget.
///
/// Membership updates and share queries are lock-free; a share computed
/// while another sender flips its state may be momentarily stale, which only
/// affects fairness for that tick.
#[derive(Debug, Default)]
pub struct SharedBandwidthLimit {
    /// Total budget in KB/s, `0` = unlimited.
    global_kbps: AtomicU64,
    active: DashSet<SenderId>,
    next_id: AtomicU64,
}

impl SharedBandwidthLimit {
    pub fn new(global_kbps: u64) -> Self {
        Self {
            global_kbps: AtomicU64::new(global_kbps),
            active: DashSet::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn set_global_limit_kbps(&self, global_kbps: u64) {
        self.global_kbps.store(global_kbps, Ordering::Release);
    }

    pub fn global_limit_kbps(&self) -> u64 {
        self.global_kbps.load(Ordering::Acquire)
    }

    /// The per-sender share in KB/s, or `None` when unlimited.
    pub fn bandwidth_share_kbps(&self) -> Option<u64> {
        let global = self.global_limit_kbps();
        if global == 0 {
            return None;
        }
        let active = self.active.len().max(1) as u64;
        Some(global / active)
    }

    /// Marks a sender as spending budget this tick, or not.
    pub fn set_sender_active(&self, id: SenderId, active: bool) {
        if active {
            self.active.insert(id);
        } else {
            self.active.remove(&id);
        }
    }

    pub fn active_senders(&self) -> usize {
        self.active.len()
    }

    fn allocate_id(&self) -> SenderId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A sender's membership in a [`SharedBandwidthLimit`].
///
/// Dropping the handle marks the sender inactive, so a sender that goes away
/// mid-transfer stops counting against the others.
#[derive(Debug)]
pub struct SenderBandwidthHandle {
    id: SenderId,
    limit: Arc<SharedBandwidthLimit>,
}

impl SenderBandwidthHandle {
    pub fn new(limit: Arc<SharedBandwidthLimit>) -> Self {
        let id = limit.allocate_id();
        Self { id, limit }
    }

    pub fn id(&self) -> SenderId {
        self.id
    }

    pub fn set_active(&self, active: bool) {
        self.limit.set_sender_active(self.id, active);
    }

    pub fn share_kbps(&self) -> Option<u64> {
        self.limit.bandwidth_share_kbps()
    }

    pub fn limit(&self) -> &SharedBandwidthLimit {
        &self.limit
    }
}

impl Drop for SenderBandwidthHandle {
    fn drop(&mut self) {
        self.limit.set_sender_active(self.id, false);
    }
}
