use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::oneshot;

/// A running query subprocess that can be told to die.
struct TrackedProcess {
    generation: u64,
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
}

/// In-flight subprocesses keyed by `requestId`.
///
/// The registry never touches the child itself: cancelling fires the
/// per-request kill signal and the owning query task does the killing, so
/// cancellation and normal completion never contend for the process handle.
#[derive(Default)]
pub(crate) struct ProcessRegistry {
    entries: Mutex<HashMap<u64, TrackedProcess>>,
    next_generation: AtomicU64,
}

/// Keeps a registry entry alive; dropping it unregisters.
pub(crate) struct Registration {
    registry: Arc<ProcessRegistry>,
    request_id: u64,
    generation: u64,
}

impl ProcessRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, TrackedProcess>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks `request_id` and hands back the guard plus the receiving end of
    /// its kill signal. A previous entry under the same id is replaced.
    pub(crate) fn register(
        self: &Arc<Self>,
        request_id: u64,
        pid: Option<u32>,
    ) -> (Registration, oneshot::Receiver<()>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (kill, kill_rx) = oneshot::channel();

        let replaced = self.entries().insert(
            request_id,
            TrackedProcess {
                generation,
                pid,
                kill,
            },
        );
        if let Some(previous) = replaced {
            tracing::warn!(
                request_id,
                previous_pid = previous.pid,
                "requestId reused while a query is still in flight"
            );
        }

        let registration = Registration {
            registry: Arc::clone(self),
            request_id,
            generation,
        };
        (registration, kill_rx)
    }

    /// Fires the kill signal for `request_id`. `false` means nothing was
    /// running under that id, which is not an error.
    pub(crate) fn cancel(&self, request_id: u64) -> bool {
        let Some(tracked) = self.entries().remove(&request_id) else {
            return false;
        };

        // A send failure means the query already finished on its own.
        let cancelled = tracked.kill.send(()).is_ok();
        tracing::info!(request_id, pid = tracked.pid, cancelled, "cancel requested");
        cancelled
    }

    /// Signals every tracked process; returns how many were still live.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained = self.entries().drain().collect::<Vec<_>>();
        drained
            .into_iter()
            .filter_map(|(_, tracked)| tracked.kill.send(()).ok())
            .count()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, request_id: u64) -> bool {
        self.entries().contains_key(&request_id)
    }

    #[cfg(test)]
    pub(crate) fn pid_of(&self, request_id: u64) -> Option<u32> {
        self.entries().get(&request_id).and_then(|tracked| tracked.pid)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    fn attach_pid(&self, request_id: u64, generation: u64, pid: Option<u32>) {
        if let Some(tracked) = self
            .entries()
            .get_mut(&request_id)
            .filter(|tracked| tracked.generation == generation)
        {
            tracked.pid = pid;
        }
    }

    fn unregister(&self, request_id: u64, generation: u64) {
        let mut entries = self.entries();
        if entries
            .get(&request_id)
            .is_some_and(|tracked| tracked.generation == generation)
        {
            entries.remove(&request_id);
        }
    }
}

impl Registration {
    /// Records the subprocess once it exists; entries start without one so a
    /// cancel can land before spawn.
    pub(crate) fn attach_pid(&self, pid: Option<u32>) {
        self.registry.attach_pid(self.request_id, self.generation, pid);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.request_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::ProcessRegistry;
    use std::sync::Arc;

    #[test]
    fn cancel_unknown_request_is_not_an_error() {
        let registry = ProcessRegistry::new();
        assert!(!registry.cancel(99));
    }

    #[tokio::test]
    async fn cancel_fires_kill_signal_and_removes_entry() {
        let registry = Arc::new(ProcessRegistry::new());
        let (_registration, kill_rx) = registry.register(1, Some(4242));
        assert!(registry.contains(1));

        assert!(registry.cancel(1));
        assert!(!registry.contains(1));
        kill_rx.await.expect("kill signal delivered");
    }

    #[test]
    fn dropping_registration_unregisters() {
        let registry = Arc::new(ProcessRegistry::new());
        let (registration, _kill_rx) = registry.register(5, None);
        assert_eq!(registry.len(), 1);

        drop(registration);
        assert_eq!(registry.len(), 0);
        assert!(!registry.cancel(5));
    }

    #[test]
    fn cancel_after_query_finished_reports_false() {
        let registry = Arc::new(ProcessRegistry::new());
        let (_registration, kill_rx) = registry.register(3, None);
        drop(kill_rx);

        assert!(!registry.cancel(3));
    }

    #[test]
    fn cancel_and_completion_race_is_idempotent() {
        let registry = Arc::new(ProcessRegistry::new());
        let (registration, _kill_rx) = registry.register(8, None);

        assert!(registry.cancel(8));
        drop(registration);
        assert!(!registry.cancel(8));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn stale_registration_does_not_remove_newer_entry() {
        let registry = Arc::new(ProcessRegistry::new());
        let (stale, _stale_rx) = registry.register(7, None);
        let (_fresh, _fresh_rx) = registry.register(7, None);

        drop(stale);
        assert!(registry.contains(7));
    }

    #[test]
    fn pid_is_attached_after_registration() {
        let registry = Arc::new(ProcessRegistry::new());
        let (stale, _stale_rx) = registry.register(4, None);
        let (fresh, _fresh_rx) = registry.register(4, None);
        assert_eq!(registry.pid_of(4), None);

        stale.attach_pid(Some(11));
        assert_eq!(registry.pid_of(4), None);
        fresh.attach_pid(Some(12));
        assert_eq!(registry.pid_of(4), Some(12));
    }

    #[test]
    fn cancel_all_signals_live_entries() {
        let registry = Arc::new(ProcessRegistry::new());
        let (_a, _a_rx) = registry.register(1, None);
        let (_b, b_rx) = registry.register(2, None);
        drop(b_rx);

        assert_eq!(registry.cancel_all(), 1);
        assert_eq!(registry.len(), 0);
    }
}
