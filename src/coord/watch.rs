use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    DataChanged,
    ChildrenChanged,
    Created,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Disconnected,
    Connected,
    Expired,
}

/// A change notification from the coordination store: either a node-level
/// event on a watched path or a session-level state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Node { kind: NodeEventKind, path: String },
    Session(SessionEventKind),
}

pub trait Watcher: Send + Sync {
    fn process(&self, event: &WatchEvent);
}

/// Fans session events out to registered handlers in registration order.
/// Watch re-arming is implicit: every successful read of a path passes
/// `watch = true` to the client, so handlers never manage watch lifetimes.
pub struct WatchChannel {
    handlers: Mutex<Vec<Arc<dyn Watcher>>>,
}

impl WatchChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, watcher: Arc<dyn Watcher>) {
        self.handlers.lock().push(watcher);
    }

    /// Delivers one event to every handler, in order. Called by the client
    /// session thread.
    pub fn dispatch(&self, event: &WatchEvent) {
        debug!("event=coord_watch_event detail={event:?}");
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler.process(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct Recording {
        seen: PlMutex<Vec<WatchEvent>>,
    }

    impl Watcher for Recording {
        fn process(&self, event: &WatchEvent) {
            self.seen.lock().push(event.clone());
        }
    }

    #[test]
    fn dispatch_reaches_handlers_in_order() {
        let channel = WatchChannel::new();
        let first = Arc::new(Recording {
            seen: PlMutex::new(Vec::new()),
        });
        let second = Arc::new(Recording {
            seen: PlMutex::new(Vec::new()),
        });
        channel.register(first.clone());
        channel.register(second.clone());
        let event = WatchEvent::Node {
            kind: NodeEventKind::DataChanged,
            path: "/a".to_string(),
        };
        channel.dispatch(&event);
        assert_eq!(first.seen.lock().as_slice(), &[event.clone()]);
        assert_eq!(second.seen.lock().as_slice(), &[event]);
    }

    #[test]
    fn dispatch_without_handlers_is_a_noop() {
        let channel = WatchChannel::new();
        channel.dispatch(&WatchEvent::Session(SessionEventKind::Connected));
    }
}
