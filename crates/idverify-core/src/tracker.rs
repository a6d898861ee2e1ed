use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::Subject;

/// Terminal or in-flight status of a feature request. Absence means none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Searching,
    Failed,
}

struct Entry {
    status: RequestStatus,
    since: Instant,
}

/// Per-subject deduplication of feature-extraction requests.
///
/// A subject is requested at most once while its request is in flight
/// (`Searching`). A `Failed` subject becomes eligible again, which is how a
/// face whose extraction failed is retried on the next frame. A successful
/// request is never reissued for the same subject; entries only disappear
/// when the session resets via [`clear_all`](Self::clear_all).
///
/// With `stale_after` set, a request that has been `Searching` for longer than
/// that is assumed lost and the subject becomes eligible again.
///
/// All methods take `&self`; the tracker can be shared across threads.
pub struct RequestTracker {
    entries: Mutex<HashMap<Subject, Entry>>,
    stale_after: Option<Duration>,
}

impl RequestTracker {
    pub fn new(stale_after: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Subject, Entry>> {
        // Entries are plain data; a panic elsewhere cannot leave them torn.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a new request for `subject` should be issued now.
    pub fn should_request(&self, subject: Subject) -> bool {
        self.should_request_at(subject, Instant::now())
    }

    pub fn should_request_at(&self, subject: Subject, now: Instant) -> bool {
        let entries = self.entries();
        self.eligible(entries.get(&subject), now)
    }

    fn eligible(&self, entry: Option<&Entry>, now: Instant) -> bool {
        match entry {
            None => true,
            Some(Entry {
                status: RequestStatus::Failed,
                ..
            }) => true,
            Some(Entry {
                status: RequestStatus::Searching,
                since,
            }) => match self.stale_after {
                Some(limit) => now.saturating_duration_since(*since) >= limit,
                None => false,
            },
        }
    }

    pub fn mark_searching(&self, subject: Subject) {
        self.mark_searching_at(subject, Instant::now());
    }

    pub fn mark_searching_at(&self, subject: Subject, now: Instant) {
        self.entries().insert(
            subject,
            Entry {
                status: RequestStatus::Searching,
                since: now,
            },
        );
    }

    pub fn mark_failed(&self, subject: Subject) {
        self.entries().insert(
            subject,
            Entry {
                status: RequestStatus::Failed,
                since: Instant::now(),
            },
        );
    }

    /// Check eligibility and mark `Searching` under a single lock.
    ///
    /// Returns `true` when the caller should issue the request.
    pub fn try_begin(&self, subject: Subject) -> bool {
        self.try_begin_at(subject, Instant::now())
    }

    pub fn try_begin_at(&self, subject: Subject, now: Instant) -> bool {
        let mut entries = self.entries();
        if !self.eligible(entries.get(&subject), now) {
            return false;
        }
        if let Some(Entry {
            status: RequestStatus::Searching,
            since,
        }) = entries.get(&subject)
        {
            tracing::warn!(
                ?subject,
                waited_ms = now.saturating_duration_since(*since).as_millis() as u64,
                "feature request went unanswered, reissuing"
            );
        }
        entries.insert(
            subject,
            Entry {
                status: RequestStatus::Searching,
                since: now,
            },
        );
        true
    }

    pub fn status(&self, subject: Subject) -> Option<RequestStatus> {
        self.entries().get(&subject).map(|e| e.status)
    }

    /// Forget every subject. Called at each session boundary.
    pub fn clear_all(&self) {
        let mut entries = self.entries();
        if !entries.is_empty() {
            tracing::debug!(cleared = entries.len(), "request tracker cleared");
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
