//! Priority Admission Gate
//!
//! Counting limiter whose waiters are ordered by [`Priority`]. When a slot is
//! released it is handed directly to the highest-priority waiter (FIFO within
//! a priority), so a later `Critical` request overtakes earlier `Low` ones but
//! never an in-flight call.
//!
//! Slots are represented by [`GatePermit`]s; dropping a permit releases the
//! slot. A waiter that gives up (its future is dropped, e.g. on timeout) is
//! skipped at hand-off time and pruned on the next enqueue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// Scheduling priority of a generation request
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Regular interactive chat
    #[default]
    Normal,
    /// Latency-sensitive request
    High,
    /// Jumps every queue
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Acquisition failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// Waiter queue already holds the maximum number of entries
    #[error("admission queue full ({queued} waiting)")]
    QueueFull {
        /// Waiters ahead at the time of rejection
        queued: usize,
    },

    /// No slot available and waiting not allowed
    #[error("no free slot")]
    NoSlot,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<GatePermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence number first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct GateState {
    available: usize,
    in_use: usize,
    peak_in_use: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

struct GateInner {
    capacity: usize,
    state: Mutex<GateState>,
}

impl GateInner {
    fn grant(self: &Arc<Self>, state: &mut GateState) -> GatePermit {
        state.available -= 1;
        state.in_use += 1;
        state.peak_in_use = state.peak_in_use.max(state.in_use);
        GatePermit {
            gate: Some(Arc::clone(self)),
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop() {
            let permit = GatePermit {
                gate: Some(Arc::clone(self)),
            };
            match waiter.tx.send(permit) {
                // Slot moves to the waiter; in_use is unchanged
                Ok(()) => return,
                Err(mut unclaimed) => unclaimed.gate = None,
            }
        }
        state.in_use -= 1;
        state.available += 1;
    }
}

/// Priority-ordered counting limiter
#[derive(Clone)]
pub struct PriorityGate {
    inner: Arc<GateInner>,
}

impl PriorityGate {
    /// Create a gate with `capacity` concurrent slots
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                capacity,
                state: Mutex::new(GateState {
                    available: capacity,
                    in_use: 0,
                    peak_in_use: 0,
                    next_seq: 0,
                    waiters: BinaryHeap::new(),
                }),
            }),
        }
    }

    /// Take a slot only if one is free and nobody is queued ahead
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NoSlot`] when the gate is saturated.
    pub fn try_acquire(&self) -> Result<GatePermit, GateError> {
        let mut state = self.inner.state.lock();
        state.waiters.retain(|w| !w.tx.is_closed());
        if state.available > 0 && state.waiters.is_empty() {
            Ok(self.inner.grant(&mut state))
        } else {
            Err(GateError::NoSlot)
        }
    }

    /// Wait for a slot, queued by `priority`
    ///
    /// At most `max_waiters` requests may wait at once.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::QueueFull`] when the wait queue is at capacity.
    pub async fn acquire(
        &self,
        priority: Priority,
        max_waiters: usize,
    ) -> Result<GatePermit, GateError> {
        let rx = {
            let mut state = self.inner.state.lock();
            state.waiters.retain(|w| !w.tx.is_closed());

            if state.available > 0 && state.waiters.is_empty() {
                return Ok(self.inner.grant(&mut state));
            }
            if state.waiters.len() >= max_waiters {
                return Err(GateError::QueueFull {
                    queued: state.waiters.len(),
                });
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, tx });
            rx
        };

        // The sender lives in the gate's heap, which outlives every waiter
        // holding a clone of the gate.
        rx.await.map_err(|_| GateError::NoSlot)
    }

    /// Total slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently held
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    /// Highest number of slots held at once
    #[must_use]
    pub fn peak_in_use(&self) -> usize {
        self.inner.state.lock().peak_in_use
    }

    /// Requests currently waiting
    #[must_use]
    pub fn waiting(&self) -> usize {
        let state = self.inner.state.lock();
        state.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }
}

impl fmt::Debug for PriorityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PriorityGate")
            .field("capacity", &self.inner.capacity)
            .field("in_use", &state.in_use)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// One held slot; dropping it releases the slot
pub struct GatePermit {
    gate: Option<Arc<GateInner>>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatePermit")
            .field("held", &self.gate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_capacity_is_respected() {
        let gate = PriorityGate::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert_eq!(gate.try_acquire().unwrap_err(), GateError::NoSlot);
        assert_eq!(gate.in_use(), 2);

        drop(a);
        assert_eq!(gate.in_use(), 1);
        assert!(gate.try_acquire().is_ok());
        assert_eq!(gate.peak_in_use(), 2);
    }

    #[tokio::test]
    async fn test_highest_priority_waiter_served_first() {
        let gate = PriorityGate::new(1);
        let held = gate.try_acquire().unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tasks = tokio::task::JoinSet::new();
        for (name, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("critical", Priority::Critical),
            ("normal-2", Priority::Normal),
        ] {
            let g = gate.clone();
            let order_tx = order_tx.clone();
            tasks.spawn(async move {
                let permit = g.acquire(priority, 16).await.unwrap();
                order_tx.send(name).unwrap();
                drop(permit);
            });
            // Fix enqueue order
            while gate.waiting() < tasks.len() {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        while tasks.join_next().await.is_some() {}
        drop(order_tx);

        let mut order = Vec::new();
        while let Some(name) = order_rx.recv().await {
            order.push(name);
        }
        assert_eq!(order, vec!["critical", "normal", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_queue_depth_bound() {
        let gate = PriorityGate::new(1);
        let _held = gate.try_acquire().unwrap();

        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.acquire(Priority::Normal, 1).await });
        while gate.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            gate.acquire(Priority::High, 1).await.unwrap_err(),
            GateError::QueueFull { queued: 1 }
        );
        waiter.abort();
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_leak_slot() {
        let gate = PriorityGate::new(1);
        let held = gate.try_acquire().unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), gate.acquire(Priority::Normal, 4))
                .await;
        assert!(timed_out.is_err());

        drop(held);
        assert_eq!(gate.in_use(), 0);
        assert_eq!(gate.waiting(), 0);
        assert!(gate.try_acquire().is_ok());
    }
}
