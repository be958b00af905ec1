use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use gameconnect_core::{ChatMessage, ChatNotification, ChatSummary, ReadReceipt};
use tracing::error;

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Disconnected => "Disconnected",
            Phase::Connecting => "Connecting",
            Phase::Connected => "Connected",
            Phase::Reconnecting => "Reconnecting",
            Phase::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub phase: Phase,
    pub reconnect_attempt: u32,
    pub last_error: Option<ChatError>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }
}

/// Global event sink registered at connect time.
///
/// Every method defaults to a no-op so a sink only implements the categories
/// it cares about. Methods run on the manager task and must not block; a
/// panic is logged and the event is dropped.
pub trait ChatEvents: Send + Sync {
    /// Snapshot of the user's chats (`/user/queue/chats`).
    fn on_chat_list(&self, _chats: &[ChatSummary]) {}

    fn on_chat_created(&self, _chat: &ChatSummary) {}

    /// Preview of a message in any of the user's chats.
    fn on_notification(&self, _notification: &ChatNotification) {}

    /// Any message seen by this client, including every open conversation.
    fn on_message(&self, _message: &ChatMessage) {}

    fn on_read_receipt(&self, _receipt: &ReadReceipt) {}

    fn on_status(&self, _status: &ConnectionStatus) {}
}

/// Handlers for one open conversation.
pub trait ConversationEvents: Send + Sync {
    fn on_message(&self, message: &ChatMessage);

    fn on_read_receipt(&self, receipt: &ReadReceipt);
}

/// Closure pair implementing [`ConversationEvents`].
pub struct ConversationHandlers<M, R> {
    on_message: M,
    on_read_receipt: R,
}

impl<M, R> ConversationHandlers<M, R>
where
    M: Fn(&ChatMessage) + Send + Sync + 'static,
    R: Fn(&ReadReceipt) + Send + Sync + 'static,
{
    pub fn new(on_message: M, on_read_receipt: R) -> Arc<Self> {
        Arc::new(Self {
            on_message,
            on_read_receipt,
        })
    }
}

impl<M, R> ConversationEvents for ConversationHandlers<M, R>
where
    M: Fn(&ChatMessage) + Send + Sync,
    R: Fn(&ReadReceipt) + Send + Sync,
{
    fn on_message(&self, message: &ChatMessage) {
        (self.on_message)(message);
    }

    fn on_read_receipt(&self, receipt: &ReadReceipt) {
        (self.on_read_receipt)(receipt);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type StatusListener = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    listeners: Vec<(ListenerId, StatusListener)>,
}

/// Status listeners shared between the public handle and the manager task.
#[derive(Clone, Default)]
pub(crate) struct StatusListeners {
    inner: Arc<Mutex<ListenerTable>>,
}

impl StatusListeners {
    // Listeners never run under the lock, so a poisoned table is still consistent.
    fn table(&self) -> MutexGuard<'_, ListenerTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, listener: StatusListener) -> ListenerId {
        let mut table = self.table();
        table.next_id += 1;
        let id = ListenerId(table.next_id);
        table.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut table = self.table();
        let before = table.listeners.len();
        table.listeners.retain(|(existing, _)| *existing != id);
        table.listeners.len() != before
    }

    pub(crate) fn notify(&self, status: &ConnectionStatus) {
        // Snapshot first: a listener may register or remove listeners.
        let listeners: Vec<StatusListener> = self
            .table()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            isolate("status listener", || listener(status));
        }
    }
}

/// Runs a caller-supplied callback on the manager task. A panic is logged
/// and swallowed.
pub(crate) fn isolate(callback: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!(callback, "callback panicked: {}", panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

pub(crate) fn same_sink(a: &Arc<dyn ChatEvents>, b: &Arc<dyn ChatEvents>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn connected() -> ConnectionStatus {
        ConnectionStatus {
            phase: Phase::Connected,
            ..ConnectionStatus::default()
        }
    }

    fn failing_listener(_: &ConnectionStatus) {
        panic!("ui thread gone");
    }

    #[test]
    fn panicking_listener_does_not_starve_later_listeners() {
        let listeners = StatusListeners::default();
        let calls = Arc::new(AtomicUsize::new(0));

        listeners.add(Arc::new(failing_listener));
        let counter = calls.clone();
        listeners.add(Arc::new(move |_: &ConnectionStatus| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify(&connected());
        listeners.notify(&connected());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn poisoned_table_still_accepts_and_notifies_listeners() {
        let listeners = StatusListeners::default();
        let inner = listeners.inner.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.lock().unwrap();
            panic!("poison the listener table");
        })
        .join();
        assert!(listeners.inner.is_poisoned());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = listeners.add(Arc::new(move |_: &ConnectionStatus| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        listeners.notify(&connected());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(listeners.remove(id));
        listeners.notify(&connected());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn isolate_reports_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new(format!("boom {}", 7));
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");

        let mut ran = false;
        isolate("test", || ran = true);
        assert!(ran);
        isolate("test", || panic!("contained"));
    }
}
