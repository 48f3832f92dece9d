//! Routes inbound radio frames to the handler registered for their kind.

use std::collections::HashMap;
use std::sync::Arc;

use camlink_core::{MessageKind, RadioMessage};

use crate::radio::InboundFrame;

/// One concern's reaction to a parsed radio message.
pub trait RadioHandler: Send + Sync {
    fn handle(&self, frame: &InboundFrame, message: &RadioMessage) -> anyhow::Result<()>;
}

/// Maps message kinds to handlers.
#[derive(Default)]
pub struct RadioDispatcher {
    handlers: HashMap<MessageKind, Arc<dyn RadioHandler>>,
}

impl RadioDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn RadioHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Parse and route one frame. Returns false if the frame was dropped
    /// (unparseable, or no handler for its kind).
    pub fn dispatch(&self, frame: &InboundFrame) -> bool {
        let message = match RadioMessage::parse(&frame.payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(src = %frame.src, error = %e, "dropping malformed radio message");
                return false;
            }
        };

        let Some(handler) = self.handlers.get(&message.kind()) else {
            match &message {
                RadioMessage::Text(text) => {
                    tracing::info!(src = %frame.src, text = %text, "radio text message");
                }
                other => {
                    tracing::debug!(src = %frame.src, kind = ?other.kind(), "no handler for radio message");
                }
            }
            return false;
        };

        if let Err(e) = handler.handle(frame, &message) {
            tracing::warn!(
                src = %frame.src,
                kind = ?message.kind(),
                error = %e,
                "radio handler failed"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_core::NodeIdentity;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<RadioMessage>>,
    }

    impl RadioHandler for Recorder {
        fn handle(&self, _frame: &InboundFrame, message: &RadioMessage) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Failing;

    impl RadioHandler for Failing {
        fn handle(&self, _frame: &InboundFrame, _message: &RadioMessage) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn frame(payload: &[u8]) -> InboundFrame {
        InboundFrame::new(NodeIdentity::new([9; 6]), NodeIdentity::BROADCAST, payload)
    }

    #[test]
    fn routes_by_kind() {
        let acks = Arc::new(Recorder::default());
        let mut dispatcher = RadioDispatcher::new();
        dispatcher.register(MessageKind::ConfigAck, acks.clone());

        assert!(dispatcher.dispatch(&frame(b"OK_CONFIG")));
        assert!(!dispatcher.dispatch(&frame(b"MAC:01:02:03:04:05:06")));
        assert_eq!(*acks.seen.lock().unwrap(), vec![RadioMessage::ConfigAck]);
    }

    #[test]
    fn malformed_and_text_are_dropped() {
        let any = Arc::new(Recorder::default());
        let mut dispatcher = RadioDispatcher::new();
        dispatcher.register(MessageKind::Config, any.clone());

        assert!(!dispatcher.dispatch(&frame(b"CONFIG:missing-delimiter")));
        assert!(!dispatcher.dispatch(&frame(b"hello there")));
        assert!(any.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_errors_are_contained() {
        let mut dispatcher = RadioDispatcher::new();
        dispatcher.register(MessageKind::ConfigAck, Arc::new(Failing));
        assert!(dispatcher.dispatch(&frame(b"OK_CONFIG")));
    }
}
