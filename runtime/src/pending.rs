//! The set of outstanding correlation tokens.
//!
//! Every insert, match and removal goes through one mutex; the lock is never
//! held across an `.await`.

use crate::correlation::BridgeError;
use ondemand_proxy_core::{CorrelationToken, DeviceEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What a waiter is woken with.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// The completion event for this token.
    Matched(DeviceEvent),
    /// The entry outlived the grace period.
    Evicted,
}

#[derive(Debug)]
struct PendingEntry {
    /// Distinguishes successive registrations of the same token.
    id: u64,
    sender: oneshot::Sender<Resolution>,
    /// Registration time, reset when the request starts waiting.
    since: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CorrelationToken, PendingEntry>,
    next_id: u64,
    closed: bool,
}

/// Shared handle to the pending set.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingSet {
    inner: Arc<Mutex<Inner>>,
}

impl PendingSet {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry for `token`.
    ///
    /// An existing entry whose waiter is already gone is replaced.
    pub(crate) fn insert(
        &self,
        token: &CorrelationToken,
    ) -> Result<(u64, oneshot::Receiver<Resolution>), BridgeError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BridgeError::Closed);
        }
        if inner
            .entries
            .get(token)
            .is_some_and(|entry| !entry.sender.is_closed())
        {
            return Err(BridgeError::DuplicateToken(token.clone()));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (sender, receiver) = oneshot::channel();
        inner.entries.insert(
            token.clone(),
            PendingEntry {
                id,
                sender,
                since: Instant::now(),
            },
        );
        Ok((id, receiver))
    }

    /// Remove the entry for `token` and hand it `event`.
    ///
    /// Returns whether a live waiter received the event. A miss leaves the set
    /// untouched.
    pub(crate) fn resolve(&self, token: &CorrelationToken, event: DeviceEvent) -> bool {
        let Some(entry) = self.lock().entries.remove(token) else {
            return false;
        };
        entry.sender.send(Resolution::Matched(event)).is_ok()
    }

    /// Remove the entry for `token` if it still belongs to registration `id`.
    pub(crate) fn remove(&self, token: &CorrelationToken, id: u64) -> bool {
        let mut inner = self.lock();
        if inner.entries.get(token).is_some_and(|entry| entry.id == id) {
            inner.entries.remove(token);
            true
        } else {
            false
        }
    }

    /// Restart the age of registration `id`'s entry.
    ///
    /// Returns `false` if the entry is gone (matched, evicted or replaced).
    pub(crate) fn touch(&self, token: &CorrelationToken, id: u64) -> bool {
        match self.lock().entries.get_mut(token) {
            Some(entry) if entry.id == id => {
                entry.since = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Evict every entry whose age at `now` exceeds `max_age`.
    ///
    /// Evicted waiters are woken with [`Resolution::Evicted`].
    pub(crate) fn evict_older_than(&self, max_age: Duration, now: Instant) -> usize {
        let evicted: Vec<_> = {
            let mut inner = self.lock();
            let expired: Vec<_> = inner
                .entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.since) > max_age)
                .map(|(token, _)| token.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|token| inner.entries.remove_entry(&token))
                .collect()
        };

        let count = evicted.len();
        for (token, entry) in evicted {
            tracing::debug!(token = %token, "Evicting stale pending entry");
            let _ = entry.sender.send(Resolution::Evicted);
        }
        count
    }

    /// Refuse new entries and drop all existing ones.
    ///
    /// Dropped senders wake their waiters with a closed channel.
    pub(crate) fn close(&self) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.entries.drain().collect()
        };
        drop(drained);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }
}
