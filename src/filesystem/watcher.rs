use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::listeners::{Listener, ListenerId, ListenerRegistry};
use crate::runtime::{ChangeEvent, ChangeStream};
use crate::sandbox::{session_ended, SandboxError, SessionStatus};
use crate::Result;

struct WatchShared {
    id: u64,
    path: String,
    listeners: Mutex<ListenerRegistry<ChangeEvent>>,
    active: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A subscription to changes under one path in the container.
///
/// Listeners may come and go while the watch is active; a removed listener
/// sees no event dispatched after its removal.
#[derive(Clone)]
pub struct Watch {
    shared: Arc<WatchShared>,
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.shared.id)
            .field("path", &self.shared.path)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Watch {
    pub(crate) fn new(id: u64, path: String) -> Self {
        let (active, _) = watch::channel(true);
        Self {
            shared: Arc::new(WatchShared {
                id,
                path,
                listeners: Mutex::new(ListenerRegistry::default()),
                active,
                task: Mutex::new(None),
            }),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerRegistry<ChangeEvent>> {
        self.shared.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_task(&self, task: JoinHandle<()>) {
        *self.shared.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Absolute watched path inside the container.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn is_active(&self) -> bool {
        *self.shared.active.borrow()
    }

    /// Resolves once the watch has stopped, explicitly or because the
    /// subscription or session ended.
    pub async fn stopped(&self) {
        let mut active = self.shared.active.subscribe();
        let _ = active.wait_for(|active| !*active).await;
    }

    /// Registers a callback for every subsequent event.
    pub fn add_event_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        if !self.is_active() {
            return Err(SandboxError::invalid_state(format!("watch on {}", self.shared.path), "stopped"));
        }
        Ok(self.register(Arc::new(listener)))
    }

    pub(crate) fn register(&self, listener: Listener<ChangeEvent>) -> ListenerId {
        self.listeners().add(listener)
    }

    /// Unregisters a callback. Returns false if it was not registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Stops delivery and drops the subscription. Idempotent.
    pub fn stop(&self) {
        if !self.deactivate() {
            return;
        }
        if let Some(task) = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.listeners().clear();
        info!(watch_id = self.shared.id, path = %self.shared.path, "Watch stopped");
    }

    fn deactivate(&self) -> bool {
        self.shared
            .active
            .send_if_modified(|active| std::mem::replace(active, false))
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let listeners = self.listeners().snapshot();
        for listener in listeners {
            if !self.is_active() {
                return;
            }
            listener(event);
        }
    }
}

/// Delivers change events until the subscription or the session ends.
pub(crate) async fn pump(watch: Watch, mut changes: ChangeStream, mut status: watch::Receiver<SessionStatus>) {
    let id = watch.shared.id;
    loop {
        tokio::select! {
            change = changes.next() => match change {
                Some(Ok(event)) => {
                    debug!(watch_id = id, path = %event.path, kind = %event.kind, "Change observed");
                    watch.dispatch(&event);
                }
                Some(Err(err)) if err.is_transient() => {
                    warn!(watch_id = id, "Change subscription hiccup: {}", err);
                }
                Some(Err(err)) => {
                    warn!(watch_id = id, "Change subscription failed: {}", err);
                    break;
                }
                None => break,
            },
            () = session_ended(&mut status) => break,
        }
    }
    if watch.deactivate() {
        watch.listeners().clear();
        debug!(watch_id = id, path = %watch.shared.path, "Watch ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ChangeKind;

    fn recorder(watch: &Watch) -> (ListenerId, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = watch
            .add_event_listener(move |event| sink.lock().unwrap().push(event.path.clone()))
            .unwrap();
        (id, seen)
    }

    #[test]
    fn test_dispatch_reaches_current_listeners_only() {
        let watch = Watch::new(1, "/tmp".into());
        let (first_id, first) = recorder(&watch);
        let (_, second) = recorder(&watch);

        watch.dispatch(&ChangeEvent::now("/tmp/a", ChangeKind::Created));
        assert!(watch.remove_event_listener(first_id));
        watch.dispatch(&ChangeEvent::now("/tmp/b", ChangeKind::Created));

        assert_eq!(*first.lock().unwrap(), vec!["/tmp/a"]);
        assert_eq!(*second.lock().unwrap(), vec!["/tmp/a", "/tmp/b"]);
    }

    #[test]
    fn test_stop_is_idempotent_and_silences_listeners() {
        let watch = Watch::new(2, "/tmp".into());
        let (_, seen) = recorder(&watch);

        watch.stop();
        watch.stop();
        watch.dispatch(&ChangeEvent::now("/tmp/late", ChangeKind::Modified));

        assert!(!watch.is_active());
        assert!(seen.lock().unwrap().is_empty());
        assert!(watch.add_event_listener(|_| {}).is_err());
    }

    #[tokio::test]
    async fn test_pump_ends_with_stream() {
        let watch = Watch::new(3, "/tmp".into());
        let (_, seen) = recorder(&watch);
        let events = vec![
            Ok(ChangeEvent::now("/tmp/a", ChangeKind::Created)),
            Ok(ChangeEvent::now("/tmp/a", ChangeKind::Modified)),
        ];
        let changes: ChangeStream = futures_util::stream::iter(events).boxed();
        let (_status_tx, status_rx) = watch::channel(SessionStatus::Running);

        pump(watch.clone(), changes, status_rx).await;

        assert_eq!(*seen.lock().unwrap(), vec!["/tmp/a", "/tmp/a"]);
        assert!(!watch.is_active());
    }

    #[tokio::test]
    async fn test_pump_stops_when_session_ends() {
        let watch = Watch::new(4, "/tmp".into());
        let changes: ChangeStream = futures_util::stream::pending().boxed();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Running);

        let task = tokio::spawn(pump(watch.clone(), changes, status_rx));
        status_tx.send_replace(SessionStatus::Stopping);
        task.await.unwrap();

        assert!(!watch.is_active());
    }
}
