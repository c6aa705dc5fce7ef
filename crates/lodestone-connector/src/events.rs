//! Session-scoped fan-out of transfer lifecycle events
//!
//! Listeners are taken from the session at connector construction and
//! notified synchronously in registration order. A listener that
//! panics is isolated and reported to the diagnostic log; it never
//! disturbs the transfer or the remaining listeners.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use lodestone_core::{Session, TransferEvent, TransferListener};

#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<[Arc<dyn TransferListener>]>,
}

impl EventBus {
    pub fn for_session(session: &Session) -> Self {
        Self {
            listeners: session.listeners().to_vec().into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_listeners(listeners: Vec<Arc<dyn TransferListener>>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    /// Deliver an event to every listener, in registration order.
    pub fn publish(&self, event: TransferEvent) {
        for listener in self.listeners.iter() {
            let delivery = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if let Err(panic) = delivery {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    kind = ?event.kind,
                    resource = %event.resource,
                    "transfer listener panicked: {reason}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use lodestone_core::{
        Coordinate, TransferDirection, TransferEventKind, TransferResource,
    };

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl TransferListener for Recording {
        fn on_event(&self, _event: &TransferEvent) {
            self.log.lock().unwrap().push(self.label);
        }
    }

    struct Panicking;

    impl TransferListener for Panicking {
        fn on_event(&self, _event: &TransferEvent) {
            panic!("listener bug");
        }
    }

    fn event() -> TransferEvent {
        TransferEvent::builder(
            TransferEventKind::Started,
            "session-1",
            "central",
            TransferResource::Artifact(Coordinate::new("com.acme", "lib", "1.0").unwrap()),
            TransferDirection::Get,
        )
        .build()
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::from_listeners(vec![
            Arc::new(Recording {
                label: "first",
                log: log.clone(),
            }),
            Arc::new(Recording {
                label: "second",
                log: log.clone(),
            }),
        ]);

        bus.publish(event());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::from_listeners(vec![
            Arc::new(Panicking),
            Arc::new(Recording {
                label: "after",
                log: log.clone(),
            }),
        ]);

        bus.publish(event());
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }
}
