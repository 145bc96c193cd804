use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clients::ProviderStatus;

struct Entry {
    generation: u64,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<ProviderStatus>,
    task: Option<JoinHandle<()>>,
}

/// What a freshly registered watcher gets to keep.
pub(crate) struct Registration {
    pub generation: u64,
    pub cancel: CancellationToken,
    pub events: mpsc::UnboundedReceiver<ProviderStatus>,
}

/// In-memory map of live watchers, keyed by job id. Answers "is it watched"
/// and routes pushed events; the job store stays authoritative.
#[derive(Default)]
pub struct WatcherRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `None` if a watcher for `job_id` is already registered.
    pub(crate) fn try_register(
        &self,
        job_id: &str,
        cancel: CancellationToken,
    ) -> Option<Registration> {
        let mut entries = self.lock();
        if entries.contains_key(job_id) {
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        entries.insert(
            job_id.to_string(),
            Entry {
                generation,
                cancel: cancel.clone(),
                events: tx,
                task: None,
            },
        );

        Some(Registration {
            generation,
            cancel,
            events: rx,
        })
    }

    pub(crate) fn set_task(&self, job_id: &str, generation: u64, task: JoinHandle<()>) {
        if let Some(e) = self.lock().get_mut(job_id) {
            if e.generation == generation {
                e.task = Some(task);
            }
        }
    }

    /// Called by a watcher on exit. A stale generation is ignored.
    pub(crate) fn release(&self, job_id: &str, generation: u64) {
        let mut entries = self.lock();
        if entries.get(job_id).is_some_and(|e| e.generation == generation) {
            entries.remove(job_id);
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lock().get(job_id) {
            Some(e) => {
                e.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Hand an event to the live watcher. False if there is none.
    pub(crate) fn notify(&self, job_id: &str, status: ProviderStatus) -> bool {
        match self.lock().get(job_id) {
            Some(e) => e.events.send(status).is_ok(),
            None => false,
        }
    }

    /// Cancel every watcher and take their task handles.
    pub(crate) fn drain(&self) -> Vec<JoinHandle<()>> {
        let mut entries = self.lock();
        entries
            .drain()
            .filter_map(|(_, e)| {
                e.cancel.cancel();
                e.task
            })
            .collect()
    }
}
