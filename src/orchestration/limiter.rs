//! Concurrency limiter for the RUNNING state.
//!
//! The `ConcurrencyLimiter` admits at most `limit` slot holders at once and
//! queues everyone else in arrival order. A slot is a `SlotGuard`; dropping
//! it is the only way to release, so every exit path releases exactly once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::core::task::TaskId;

struct Waiter {
    task_id: TaskId,
    grant: oneshot::Sender<SlotGuard>,
}

struct LimiterState {
    limit: usize,
    holders: HashSet<TaskId>,
    waiters: VecDeque<Waiter>,
}

impl LimiterState {
    /// Hand out free slots to waiters at the front of the queue.
    ///
    /// Grants are returned rather than sent so the caller can send them after
    /// unlocking; a grant whose receiver is gone drops its guard, which
    /// re-enters the lock.
    fn collect_grants(&mut self) -> Vec<Waiter> {
        let mut granted = Vec::new();
        while self.holders.len() < self.limit {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.grant.is_closed() {
                continue;
            }
            self.holders.insert(waiter.task_id);
            granted.push(waiter);
        }
        granted
    }
}

fn lock_state(state: &Mutex<LimiterState>) -> MutexGuard<'_, LimiterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_grants(state: &Arc<Mutex<LimiterState>>, granted: Vec<Waiter>) {
    for waiter in granted {
        debug!(task_id = %waiter.task_id, "slot granted to queued task");
        let guard = SlotGuard {
            task_id: waiter.task_id,
            state: state.clone(),
        };
        // On failure the guard comes back and is dropped here, releasing it.
        let _ = waiter.grant.send(guard);
    }
}

/// FIFO admission gate shared by every task driver.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    state: Arc<Mutex<LimiterState>>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                limit: limit.max(1),
                holders: HashSet::new(),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Wait for a slot. Waiters are served strictly in arrival order.
    ///
    /// Dropping the returned future gives up the place in the queue; a slot
    /// granted to a dropped waiter is released immediately.
    pub async fn acquire(&self, task_id: TaskId) -> SlotGuard {
        loop {
            let receiver = {
                let mut state = lock_state(&self.state);
                if state.waiters.is_empty() && state.holders.len() < state.limit {
                    state.holders.insert(task_id);
                    debug!(%task_id, running = state.holders.len(), "slot acquired");
                    return SlotGuard {
                        task_id,
                        state: self.state.clone(),
                    };
                }
                let (grant, receiver) = oneshot::channel();
                state.waiters.push_back(Waiter { task_id, grant });
                debug!(%task_id, queued = state.waiters.len(), "waiting for slot");
                receiver
            };

            if let Ok(guard) = receiver.await {
                return guard;
            }
        }
    }

    /// Take a slot only if one is free and nobody is queued.
    pub fn try_acquire(&self, task_id: TaskId) -> Option<SlotGuard> {
        let mut state = lock_state(&self.state);
        if state.waiters.is_empty() && state.holders.len() < state.limit {
            state.holders.insert(task_id);
            Some(SlotGuard {
                task_id,
                state: self.state.clone(),
            })
        } else {
            None
        }
    }

    /// Change the limit. Lowering it never revokes held slots; raising it
    /// admits queued waiters right away.
    pub fn set_limit(&self, limit: usize) {
        let granted = {
            let mut state = lock_state(&self.state);
            state.limit = limit.max(1);
            debug!(limit = state.limit, running = state.holders.len(), "limit changed");
            state.collect_grants()
        };
        send_grants(&self.state, granted);
    }

    pub fn running_count(&self) -> usize {
        lock_state(&self.state).holders.len()
    }

}

/// The right to occupy RUNNING. Released on drop.
pub struct SlotGuard {
    task_id: TaskId,
    state: Arc<Mutex<LimiterState>>,
}

impl SlotGuard {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let granted = {
            let mut state = lock_state(&self.state);
            state.holders.remove(&self.task_id);
            debug!(task_id = %self.task_id, running = state.holders.len(), "slot released");
            state.collect_grants()
        };
        send_grants(&self.state, granted);
    }
}
