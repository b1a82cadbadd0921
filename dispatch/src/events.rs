use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

/// An event observed for one call, translated from carrier webhooks
/// and voice-pipeline signals into a single vocabulary keyed by the
/// call's correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// The carrier reports the remote phone is ringing.
    Ringing,
    /// The carrier reports the call is in progress.
    InProgress,
    /// The voice pipeline answered the call.
    Answered,
    /// The voice pipeline reports live media, used to keep the active
    /// lease renewed during long calls.
    MediaActive,
    /// The call ended normally.
    Completed,
    /// The voice pipeline hung up, with the reason it reported.
    Hangup { reason: Option<String> },
    Failed { reason: Option<String> },
    NoAnswer,
    Busy,
    Canceled,
    /// The call was answered by a voicemail system.
    Voicemail,
}

impl CallEvent {
    /// Translates a carrier webhook status into a call event.
    /// Unknown statuses are dropped by the caller.
    pub fn from_carrier_status(status: &str) -> Option<CallEvent> {
        match status {
            "ringing" => Some(CallEvent::Ringing),
            "in-progress" => Some(CallEvent::InProgress),
            "completed" => Some(CallEvent::Completed),
            "failed" => Some(CallEvent::Failed { reason: None }),
            "no-answer" => Some(CallEvent::NoAnswer),
            "busy" => Some(CallEvent::Busy),
            "canceled" => Some(CallEvent::Canceled),
            _ => None,
        }
    }

    /// Translates a voice-pipeline signal into a call event.
    pub fn from_pipeline_signal(signal: &str, reason: Option<String>) -> Option<CallEvent> {
        match signal {
            "answer" => Some(CallEvent::Answered),
            "media-active" => Some(CallEvent::MediaActive),
            "hangup" => Some(CallEvent::Hangup { reason }),
            "voicemail" => Some(CallEvent::Voicemail),
            _ => None,
        }
    }

    /// Whether this event terminates the call attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallEvent::Completed
                | CallEvent::Hangup { .. }
                | CallEvent::Failed { .. }
                | CallEvent::NoAnswer
                | CallEvent::Busy
                | CallEvent::Canceled
                | CallEvent::Voicemail
        )
    }
}

/// Routes call events to the dispatch attempt that owns each
/// correlation id. Webhook and signal-bus ingestion deliver into this
/// router; each attempt registers before dialing and deregisters when
/// it releases its lease.
#[derive(Default)]
pub struct CallEventRouter {
    routes: Mutex<HashMap<String, mpsc::Sender<CallEvent>>>,
}

impl CallEventRouter {
    pub fn new() -> Self {
        CallEventRouter::default()
    }

    /// Registers a receiver for the provided correlation id, replacing
    /// any previous registration.
    pub fn register(&self, correlation_id: &str) -> mpsc::Receiver<CallEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.routes
            .lock()
            .expect("lock should not be poisoned")
            .insert(correlation_id.to_string(), tx);
        rx
    }

    pub fn deregister(&self, correlation_id: &str) {
        self.routes
            .lock()
            .expect("lock should not be poisoned")
            .remove(correlation_id);
    }

    /// Delivers an event to the attempt that owns the correlation id.
    /// Returns false when no attempt is registered or its buffer is
    /// full; late webhooks for released calls land here.
    pub fn deliver(&self, correlation_id: &str, event: CallEvent) -> bool {
        let sender = {
            let routes = self.routes.lock().expect("lock should not be poisoned");
            routes.get(correlation_id).cloned()
        };
        match sender {
            Some(sender) => sender.try_send(event).is_ok(),
            None => {
                debug!(
                    correlation_id,
                    "dropping call event with no registered attempt"
                );
                false
            }
        }
    }
}
