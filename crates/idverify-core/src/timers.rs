use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The delayed callbacks of a verification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// An armed reference waited too long for a live match.
    ReadTimeout,
    /// A result has been shown long enough; return to idle.
    Restart,
    /// Repeat the "look at the camera" cue.
    Prompt,
    /// The reference extraction went unanswered; give up on it.
    ReferencePending,
}

/// Cancel-then-reschedule timers.
///
/// Scheduling a kind that is already pending replaces it, so a kind never
/// fires twice for one schedule call.
pub trait Scheduler {
    fn schedule(&mut self, kind: TimerKind, delay: Duration);

    fn cancel(&mut self, kind: TimerKind);

    fn is_pending(&self, kind: TimerKind) -> bool;
}

/// Callback invoked when a timer elapses, with its kind and generation.
pub type FireFn = Arc<dyn Fn(TimerKind, u64) + Send + Sync>;

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Scheduler backed by tokio tasks.
///
/// An elapsed timer does not act directly: it reports `(kind, generation)`
/// through the fire callback, and the owner must [`claim`](Self::claim) it
/// before acting. A firing that raced with a cancel or reschedule carries a
/// superseded generation and is rejected.
///
/// Must be used from within a tokio runtime.
pub struct TokioScheduler {
    fire: FireFn,
    slots: HashMap<TimerKind, Slot>,
    next_generation: u64,
}

impl TokioScheduler {
    pub fn new(fire: FireFn) -> Self {
        Self {
            fire,
            slots: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Accept a firing reported through the callback.
    ///
    /// Returns `true` exactly once for the current schedule of `kind`.
    pub fn claim(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.slots.get(&kind) {
            Some(slot) if slot.generation == generation => {
                self.slots.remove(&kind);
                true
            }
            _ => {
                tracing::debug!(?kind, generation, "ignoring superseded timer");
                false
            }
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);

        let generation = self.next_generation;
        self.next_generation += 1;

        let deadline = tokio::time::Instant::now() + delay;
        let fire = Arc::clone(&self.fire);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(kind, generation);
        });
        self.slots.insert(kind, Slot { generation, handle });
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slots.remove(&kind) {
            slot.handle.abort();
        }
    }

    fn is_pending(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (FireFn, Arc<Mutex<Vec<(TimerKind, u64)>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let fire: FireFn = Arc::new(move |kind, generation| {
            sink.lock().unwrap().push((kind, generation));
        });
        (fire, fired)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (fire, fired) = recording();
        let mut scheduler = TokioScheduler::new(fire);

        scheduler.schedule(TimerKind::Restart, Duration::from_millis(3000));
        assert!(scheduler.is_pending(TimerKind::Restart));

        tokio::time::advance(Duration::from_millis(2999)).await;
        settle().await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        let fired = fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, TimerKind::Restart);

        assert!(scheduler.claim(TimerKind::Restart, fired[0].1));
        assert!(!scheduler.is_pending(TimerKind::Restart));
        // A second claim of the same firing is rejected.
        assert!(!scheduler.claim(TimerKind::Restart, fired[0].1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_timer() {
        let (fire, fired) = recording();
        let mut scheduler = TokioScheduler::new(fire);

        scheduler.schedule(TimerKind::ReadTimeout, Duration::from_millis(5000));
        tokio::time::advance(Duration::from_millis(4000)).await;
        scheduler.schedule(TimerKind::ReadTimeout, Duration::from_millis(5000));

        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert!(fired.lock().unwrap().is_empty(), "first schedule must not fire");

        tokio::time::advance(Duration::from_millis(3500)).await;
        settle().await;
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (fire, fired) = recording();
        let mut scheduler = TokioScheduler::new(fire);

        scheduler.schedule(TimerKind::Prompt, Duration::from_millis(500));
        scheduler.cancel(TimerKind::Prompt);
        assert!(!scheduler.is_pending(TimerKind::Prompt));

        tokio::time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_rejected() {
        let (fire, _fired) = recording();
        let mut scheduler = TokioScheduler::new(fire);

        scheduler.schedule(TimerKind::Prompt, Duration::from_millis(500));
        scheduler.schedule(TimerKind::Prompt, Duration::from_millis(500));
        // Generation 1 was superseded by generation 2.
        assert!(!scheduler.claim(TimerKind::Prompt, 1));
        assert!(scheduler.is_pending(TimerKind::Prompt));
        assert!(scheduler.claim(TimerKind::Prompt, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kinds_are_independent() {
        let (fire, fired) = recording();
        let mut scheduler = TokioScheduler::new(fire);

        scheduler.schedule(TimerKind::ReadTimeout, Duration::from_millis(100));
        scheduler.schedule(TimerKind::Restart, Duration::from_millis(200));
        scheduler.cancel(TimerKind::ReadTimeout);

        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;
        let kinds: Vec<_> = fired.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![TimerKind::Restart]);
    }
}
