//! Event model and the bounded event stream
//!
//! The engine publishes every observable change as an [`Event`] on a single
//! bounded channel. State events (registration, call, digit) use a blocking
//! send and are never lost; trace events use a non-blocking send and are
//! dropped when the channel is full.
//!
//! ```rust
//! use siptty_engine_core::event::{Event, CallState};
//!
//! fn describe(event: &Event) -> String {
//!     match event {
//!         Event::Registration(reg) => format!("{} is {}", reg.account, reg.state),
//!         Event::CallState(call) => format!("call {} {}", call.call_id, call.state),
//!         Event::Trace(trace) => format!("{} bytes {}", trace.message.len(), trace.direction),
//!         Event::Digit(digit) => format!("call {} got {}", digit.call_id, digit.digit),
//!     }
//! }
//! # let _ = describe;
//! # let _ = CallState::Confirmed;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use crate::call::CallId;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Read side of the event stream handed to the Event Sink.
///
/// Yields `None` once the engine has stopped and every queued event has been
/// consumed.
pub type EventStream = ReceiverStream<Event>;

/// Registration state of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Unregistered,
    Registered,
    Failed,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registered => "registered",
            RegistrationState::Failed => "failed",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call state
///
/// Outbound calls move `Calling -> Confirmed -> Disconnected`, inbound calls
/// `Incoming -> Confirmed -> Disconnected` or `Incoming -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Outbound INVITE sent, no final response yet
    Calling,
    /// Inbound INVITE waiting for the operator
    Incoming,
    /// Dialog established
    Confirmed,
    /// Terminal
    Disconnected,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Calling => "calling",
            CallState::Incoming => "incoming",
            CallState::Confirmed => "confirmed",
            CallState::Disconnected => "disconnected",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: CallState) -> bool {
        matches!(
            (self, next),
            (CallState::Calling, CallState::Confirmed)
                | (CallState::Calling, CallState::Disconnected)
                | (CallState::Incoming, CallState::Confirmed)
                | (CallState::Incoming, CallState::Disconnected)
                | (CallState::Confirmed, CallState::Disconnected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == CallState::Disconnected
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side created the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a traced SIP message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceDirection {
    Sent,
    Received,
}

impl fmt::Display for TraceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceDirection::Sent => "sent",
            TraceDirection::Received => "received",
        })
    }
}

/// Registration state change of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationEvent {
    pub account: String,
    pub state: RegistrationState,
    pub reason: Option<String>,
}

/// Call state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStateEvent {
    pub call_id: CallId,
    pub state: CallState,
    pub remote_uri: String,
    pub direction: CallDirection,
    /// Left at zero by the engine; presentation layers compute it if they care
    pub duration: Duration,
}

/// One raw SIP message seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub direction: TraceDirection,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub transport: String,
    pub local_addr: String,
    pub remote_addr: String,
}

/// DTMF digit received on a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigitEvent {
    pub call_id: CallId,
    pub digit: char,
}

/// Everything the engine reports to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Registration(RegistrationEvent),
    CallState(CallStateEvent),
    Trace(TraceEvent),
    Digit(DigitEvent),
}

impl Event {
    /// Trace events may be dropped; every other kind is delivered
    pub fn is_trace(&self) -> bool {
        matches!(self, Event::Trace(_))
    }

    /// Call this event belongs to, if any
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Event::CallState(ev) => Some(&ev.call_id),
            Event::Digit(ev) => Some(&ev.call_id),
            _ => None,
        }
    }
}

/// Outcome of a non-blocking publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TryPublish {
    Sent,
    Full,
    Closed,
}

/// Write side of the event stream shared by every engine task.
///
/// Closing drops the only long-lived sender, so the stream ends once the
/// consumer has drained what is queued.
#[derive(Clone)]
pub(crate) struct EventPublisher {
    sender: Arc<RwLock<Option<mpsc::Sender<Event>>>>,
}

impl EventPublisher {
    pub(crate) fn channel(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let publisher = Self {
            sender: Arc::new(RwLock::new(Some(tx))),
        };
        (publisher, ReceiverStream::new(rx))
    }

    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        self.sender.read().clone()
    }

    /// Deliver a state event, waiting for room in the channel
    pub(crate) async fn publish(&self, event: Event) {
        let Some(tx) = self.sender() else {
            tracing::debug!(?event, "event stream closed, discarding event");
            return;
        };
        if tx.send(event).await.is_err() {
            tracing::debug!("event consumer gone, discarding event");
        }
    }

    /// Deliver an event only if the channel has room right now
    pub(crate) fn try_publish(&self, event: Event) -> TryPublish {
        let Some(tx) = self.sender() else {
            return TryPublish::Closed;
        };
        match tx.try_send(event) {
            Ok(()) => TryPublish::Sent,
            Err(TrySendError::Full(_)) => TryPublish::Full,
            Err(TrySendError::Closed(_)) => TryPublish::Closed,
        }
    }

    pub(crate) fn close(&self) {
        self.sender.write().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }
}
