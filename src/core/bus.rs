//! Bus coordinator: per-transport mutual exclusion with priority
//!
//! One coordinator guards one transport. Two roles compete for it:
//! low-priority *scanner* tasks and high-priority *operator* tasks
//! (user-initiated reads/writes). Grants always prefer waiting operators;
//! a scanner holding the bus can poll [`BusGuard::should_yield`] at frame
//! boundaries and release early. Waiters queue FIFO within their class and
//! are removed if their acquire future is dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Who is asking for the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPriority {
    /// User-initiated command; preempts scanners at the next frame boundary
    Operator,
    /// Background polling; yields to operators
    Scanner,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct BusState {
    held: bool,
    next_id: u64,
    operators: VecDeque<Waiter>,
    scanners: VecDeque<Waiter>,
}

/// Mutual-exclusion coordinator for one transport.
pub struct BusCoordinator {
    state: Mutex<BusState>,
}

impl std::fmt::Debug for BusCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("BusCoordinator")
            .field("held", &st.held)
            .field("operators_waiting", &st.operators.len())
            .field("scanners_waiting", &st.scanners.len())
            .finish()
    }
}

impl BusCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState {
                held: false,
                next_id: 0,
                operators: VecDeque::new(),
                scanners: VecDeque::new(),
            }),
        })
    }

    /// Acquire the bus. Suspends until granted; dropping the returned future
    /// while waiting leaves the queue clean.
    pub async fn acquire(self: &Arc<Self>, priority: BusPriority) -> BusGuard {
        let (id, rx) = {
            let mut st = self.state.lock();
            if !st.held {
                st.held = true;
                return BusGuard {
                    coordinator: Arc::clone(self),
                    priority,
                };
            }
            let (tx, rx) = oneshot::channel();
            let id = st.next_id;
            st.next_id += 1;
            let waiter = Waiter { id, tx };
            match priority {
                BusPriority::Operator => st.operators.push_back(waiter),
                BusPriority::Scanner => st.scanners.push_back(waiter),
            }
            (id, rx)
        };

        let mut pending = PendingWaiter {
            coordinator: Arc::clone(self),
            id,
            rx,
            done: false,
        };

        // Grants are sent under the state lock, so once recv resolves the
        // bus is ours.
        let _ = (&mut pending.rx).await;
        pending.done = true;

        BusGuard {
            coordinator: Arc::clone(self),
            priority,
        }
    }

    /// True while an operator is queued; scanners use this to yield at the
    /// next frame boundary.
    pub fn operator_waiting(&self) -> bool {
        !self.state.lock().operators.is_empty()
    }

    /// Grant the bus to the next waiter, operators first, or mark it free.
    fn release(&self) {
        let mut st = self.state.lock();
        loop {
            let next = st
                .operators
                .pop_front()
                .or_else(|| st.scanners.pop_front());
            match next {
                Some(waiter) => {
                    // A send failure means the waiter was cancelled after we
                    // popped it; move on to the next one.
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    st.held = false;
                    return;
                }
            }
        }
    }

    /// Remove a queued waiter by id. Returns false when the waiter had
    /// already been granted (or never existed).
    fn remove_waiter(&self, id: u64) -> bool {
        let mut st = self.state.lock();
        let before = st.operators.len() + st.scanners.len();
        st.operators.retain(|w| w.id != id);
        st.scanners.retain(|w| w.id != id);
        before != st.operators.len() + st.scanners.len()
    }
}

struct PendingWaiter {
    coordinator: Arc<BusCoordinator>,
    id: u64,
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Dropped mid-wait: either we were still queued (remove and forget)
        // or a grant already landed in the channel (pass it on).
        if !self.coordinator.remove_waiter(self.id) && self.rx.try_recv().is_ok() {
            self.coordinator.release();
        }
    }
}

/// Exclusive hold on the bus; releases on drop.
pub struct BusGuard {
    coordinator: Arc<BusCoordinator>,
    priority: BusPriority,
}

impl BusGuard {
    /// For scanner guards: true when an operator is waiting and this holder
    /// should release at the next frame boundary.
    pub fn should_yield(&self) -> bool {
        self.priority == BusPriority::Scanner && self.coordinator.operator_waiting()
    }

    pub fn priority(&self) -> BusPriority {
        self.priority
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let bus = BusCoordinator::new();
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let bus = Arc::clone(&bus);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _guard = bus.acquire(BusPriority::Operator).await;
                let inside = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0, "two guards alive at once");
                sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_operator_preempts_scanner_queue() {
        let bus = BusCoordinator::new();

        // Scanner holds the bus
        let guard = bus.acquire(BusPriority::Scanner).await;
        assert!(!guard.should_yield());

        // Queue a scanner, then an operator
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let bus2 = Arc::clone(&bus);
        let order2 = Arc::clone(&order);
        let scanner = tokio::spawn(async move {
            let _g = bus2.acquire(BusPriority::Scanner).await;
            order2.lock().push("scanner");
        });
        sleep(Duration::from_millis(10)).await;
        let bus3 = Arc::clone(&bus);
        let order3 = Arc::clone(&order);
        let operator = tokio::spawn(async move {
            let _g = bus3.acquire(BusPriority::Operator).await;
            order3.lock().push("operator");
        });
        sleep(Duration::from_millis(10)).await;

        // Holder now sees the yield request
        assert!(guard.should_yield());
        drop(guard);

        operator.await.unwrap();
        scanner.await.unwrap();
        assert_eq!(*order.lock(), vec!["operator", "scanner"]);
    }

    #[tokio::test]
    async fn test_fifo_within_class() {
        let bus = BusCoordinator::new();
        let guard = bus.acquire(BusPriority::Operator).await;

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let bus = Arc::clone(&bus);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _g = bus.acquire(BusPriority::Operator).await;
                order.lock().push(i);
            }));
            // Ensure deterministic enqueue order
            sleep(Duration::from_millis(5)).await;
        }
        drop(guard);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let bus = BusCoordinator::new();
        let guard = bus.acquire(BusPriority::Operator).await;

        // A waiter that gets cancelled while queued
        let bus2 = Arc::clone(&bus);
        let cancelled = tokio::spawn(async move {
            let _g = bus2.acquire(BusPriority::Operator).await;
        });
        sleep(Duration::from_millis(10)).await;
        cancelled.abort();
        let _ = cancelled.await;

        // A live waiter behind it
        let bus3 = Arc::clone(&bus);
        let live = tokio::spawn(async move {
            let _g = bus3.acquire(BusPriority::Operator).await;
            "acquired"
        });
        sleep(Duration::from_millis(10)).await;

        drop(guard);
        assert_eq!(live.await.unwrap(), "acquired");
    }
}
