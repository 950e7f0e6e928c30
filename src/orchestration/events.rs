//! Event log and bus.
//!
//! Every event is appended to a per-tree log and fanned out over a tokio
//! broadcast channel. Appends hold the log lock while broadcasting, so the
//! order subscribers see for one tree is the order sequences were assigned.
//!
//! Subscriptions keep a per-tree cursor. A subscriber that lags behind the
//! broadcast buffer is backfilled from the log, and anything at or below its
//! cursor is dropped, so no event is lost or repeated while it stays attached.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::core::event::{Event, EventFilter};
use crate::core::task::TreeId;
use crate::error::Result;
use crate::state::Journal;

const BROADCAST_CAPACITY: usize = 1024;

/// Key of one ordered stream: a tree, or `None` for system events.
type StreamKey = Option<TreeId>;

#[derive(Default)]
struct StreamLog {
    /// `events[i].sequence == i + 1`.
    events: Vec<Event>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StreamLog {
    fn head(&self) -> u64 {
        self.events.len() as u64
    }

    fn since(&self, cursor: u64) -> &[Event] {
        let start = (cursor as usize).min(self.events.len());
        &self.events[start..]
    }
}

#[derive(Default)]
struct LogInner {
    streams: HashMap<StreamKey, StreamLog>,
}

#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<LogInner>>,
    sender: broadcast::Sender<Event>,
    journal: Option<Arc<Journal>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(LogInner::default())),
            sender,
            journal: None,
        }
    }

    pub fn with_journal(journal: Arc<Journal>) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        lock_inner(&self.inner)
    }

    /// Load previously journaled events without re-broadcasting them.
    ///
    /// Events are renumbered densely per stream in the order given, which
    /// is append order for a journal.
    pub fn restore(&self, events: Vec<Event>) {
        let mut inner = self.lock();
        for mut event in events {
            let log = inner.streams.entry(event.tree_id).or_default();
            event.sequence = log.head() + 1;
            log.last_timestamp = Some(event.timestamp);
            log.events.push(event);
        }
    }

    /// Append an event, assigning its timestamp and sequence.
    ///
    /// Returns the event as stored.
    pub fn append(&self, mut event: Event) -> Result<Event> {
        let mut inner = self.lock();
        let log = inner.streams.entry(event.tree_id).or_default();

        event.sequence = log.head() + 1;
        event.timestamp = match log.last_timestamp {
            Some(last) => event.timestamp.max(last),
            None => event.timestamp,
        };

        if let Some(journal) = &self.journal {
            journal.append_event(&event)?;
        }

        log.last_timestamp = Some(event.timestamp);
        log.events.push(event.clone());
        trace!(
            tree_id = ?event.tree_id,
            task_id = ?event.task_id,
            sequence = event.sequence,
            kind = event.kind.name(),
            "event appended"
        );

        // No receivers is fine; the log keeps the event for replay.
        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    /// Events of one tree with `sequence > since`, in order.
    pub fn replay(&self, tree_id: TreeId, since: u64) -> Vec<Event> {
        self.replay_stream(Some(tree_id), since)
    }

    /// System events with `sequence > since`, in order.
    pub fn replay_system(&self, since: u64) -> Vec<Event> {
        self.replay_stream(None, since)
    }

    fn replay_stream(&self, key: StreamKey, since: u64) -> Vec<Event> {
        self.lock()
            .streams
            .get(&key)
            .map(|log| log.since(since).to_vec())
            .unwrap_or_default()
    }

    /// Sequence of the latest event in a tree, 0 if none.
    pub fn head(&self, tree_id: TreeId) -> u64 {
        self.lock()
            .streams
            .get(&Some(tree_id))
            .map(StreamLog::head)
            .unwrap_or(0)
    }

    /// Deliver every future event matching `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let inner = self.lock();
        let receiver = self.sender.subscribe();
        let cursors = inner
            .streams
            .iter()
            .map(|(key, log)| (*key, log.head()))
            .collect();
        drop(inner);

        Subscription {
            receiver,
            filter,
            cursors,
            backlog: VecDeque::new(),
            inner: self.inner.clone(),
        }
    }

    /// Deliver the events of `filter.tree_id` after `since`, then every
    /// future matching event, with no gap in between.
    ///
    /// Without a tree in the filter this is the same as `subscribe`.
    pub fn subscribe_from(&self, filter: EventFilter, since: u64) -> Subscription {
        let inner = self.lock();
        let receiver = self.sender.subscribe();
        let mut cursors: HashMap<StreamKey, u64> = inner
            .streams
            .iter()
            .map(|(key, log)| (*key, log.head()))
            .collect();

        let mut backlog = VecDeque::new();
        if let Some(tree_id) = filter.tree_id {
            cursors.insert(Some(tree_id), since);
            if let Some(log) = inner.streams.get(&Some(tree_id)) {
                backlog.extend(log.since(since).iter().cloned());
            }
        }
        drop(inner);

        Subscription {
            receiver,
            filter,
            cursors,
            backlog,
            inner: self.inner.clone(),
        }
    }
}

fn lock_inner(inner: &Mutex<LogInner>) -> MutexGuard<'_, LogInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live feed of matching events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
    /// Highest sequence delivered (or skipped as history) per stream.
    cursors: HashMap<StreamKey, u64>,
    backlog: VecDeque<Event>,
    inner: Arc<Mutex<LogInner>>,
}

impl Subscription {
    /// Next matching event. `None` once the log is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if self.accept(&event) {
                    return Some(event);
                }
                continue;
            }

            match self.receiver.recv().await {
                Ok(event) => {
                    if self.accept(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, backfilling from log");
                    self.backfill();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Advance the cursor if `event` is new and wanted.
    fn accept(&mut self, event: &Event) -> bool {
        if !self.filter.matches(event) {
            return false;
        }
        let cursor = self.cursors.entry(event.tree_id).or_insert(0);
        if event.sequence <= *cursor {
            return false;
        }
        *cursor = event.sequence;
        true
    }

    fn backfill(&mut self) {
        let inner = lock_inner(&self.inner);
        for (key, log) in &inner.streams {
            let cursor = self.cursors.get(key).copied().unwrap_or(0);
            self.backlog.extend(
                log.since(cursor)
                    .iter()
                    .filter(|event| self.filter.matches(event))
                    .cloned(),
            );
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}
