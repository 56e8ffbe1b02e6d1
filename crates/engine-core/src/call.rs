//! Call lifecycle state
//!
//! A [`Call`] tracks one dialog from creation to disconnection. Its state is
//! guarded by a per-call lock that is held while the corresponding event is
//! published, so the event stream always shows a call's transitions in the
//! order they happened no matter which task drove them.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::event::{CallDirection, CallState, CallStateEvent, DigitEvent, Event, EventPublisher};
use crate::provider::{ClientSession, ServerSession, SessionHandle};

/// Engine-assigned call identifier
///
/// Allocated from a monotonically increasing counter and never reused within
/// one engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub(crate) fn from_counter(n: u64) -> Self {
        Self(n.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, used for ordering snapshots
    pub fn sequence(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CallId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Operator decision handed to the task waiting on an inbound session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnswerIntent {
    Accept,
    Reject,
}

/// Point-in-time view of a call for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub remote_uri: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

/// Returns true if `digit` is a valid DTMF digit (`0-9`, `*`, `#`, `A-D`)
pub fn is_valid_dtmf_digit(digit: char) -> bool {
    matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D')
}

/// One inbound or outbound call
pub struct Call {
    id: CallId,
    direction: CallDirection,
    remote_uri: String,
    created_at: DateTime<Utc>,
    state: tokio::sync::Mutex<CallState>,
    session: Mutex<Option<SessionHandle>>,
    /// Single-slot answer intent, inbound calls only
    intent: Option<mpsc::Sender<AnswerIntent>>,
}

impl Call {
    /// Outbound call in `Calling` owning a client session
    pub(crate) fn outbound(id: CallId, remote_uri: String, session: Arc<dyn ClientSession>) -> Self {
        Self {
            id,
            direction: CallDirection::Outbound,
            remote_uri,
            created_at: Utc::now(),
            state: tokio::sync::Mutex::new(CallState::Calling),
            session: Mutex::new(Some(SessionHandle::Client(session))),
            intent: None,
        }
    }

    /// Inbound call in `Incoming` owning a server session.
    ///
    /// The returned receiver is the other end of the answer-intent slot.
    pub(crate) fn inbound(
        id: CallId,
        remote_uri: String,
        session: Arc<dyn ServerSession>,
    ) -> (Self, mpsc::Receiver<AnswerIntent>) {
        let (tx, rx) = mpsc::channel(1);
        let call = Self {
            id,
            direction: CallDirection::Inbound,
            remote_uri,
            created_at: Utc::now(),
            state: tokio::sync::Mutex::new(CallState::Incoming),
            session: Mutex::new(Some(SessionHandle::Server(session))),
            intent: Some(tx),
        };
        (call, rx)
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_inbound(&self) -> bool {
        self.intent.is_some()
    }

    pub async fn state(&self) -> CallState {
        *self.state.lock().await
    }

    pub async fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.id.clone(),
            direction: self.direction,
            remote_uri: self.remote_uri.clone(),
            state: self.state().await,
            created_at: self.created_at,
        }
    }

    /// The live session handle, if the call still owns one
    pub(crate) fn session(&self) -> Option<SessionHandle> {
        self.session.lock().clone()
    }

    /// Give up the session handle once the dialog is gone
    pub(crate) fn release_session(&self) -> Option<SessionHandle> {
        self.session.lock().take()
    }

    /// Hand an operator decision to the inbound handler.
    ///
    /// Returns false for outbound calls. A second intent while one is pending,
    /// or after the handler stopped listening, is silently absorbed.
    pub(crate) fn signal(&self, intent: AnswerIntent) -> bool {
        match &self.intent {
            Some(tx) => {
                let _ = tx.try_send(intent);
                true
            }
            None => false,
        }
    }

    pub(crate) fn state_event(&self, state: CallState) -> Event {
        state_event(&self.id, state, &self.remote_uri, self.direction)
    }

    /// Publish the current state; used once when the call is first announced
    pub(crate) async fn announce(&self, events: &EventPublisher) {
        let state = self.state.lock().await;
        events.publish(self.state_event(*state)).await;
    }

    /// Move to `next` and publish it, if the state machine allows.
    ///
    /// Returns false without publishing anything when the transition is not
    /// allowed, which is how a second disconnect stays silent.
    pub(crate) async fn advance(&self, next: CallState, events: &EventPublisher) -> bool {
        let mut state = self.state.lock().await;
        if !state.can_transition_to(next) {
            tracing::debug!(call_id = %self.id, from = %*state, to = %next, "ignoring call transition");
            return false;
        }
        *state = next;
        events.publish(self.state_event(next)).await;
        true
    }

    /// Publish a received digit while the call is confirmed.
    ///
    /// Returns false once the call has left `Confirmed`.
    pub(crate) async fn publish_digit(&self, digit: char, events: &EventPublisher) -> bool {
        let state = self.state.lock().await;
        if *state != CallState::Confirmed {
            return false;
        }
        events
            .publish(Event::Digit(DigitEvent {
                call_id: self.id.clone(),
                digit,
            }))
            .await;
        true
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_uri", &self.remote_uri)
            .finish_non_exhaustive()
    }
}

/// Call state event for a call that may not exist as a [`Call`] yet
pub(crate) fn state_event(
    id: &CallId,
    state: CallState,
    remote_uri: &str,
    direction: CallDirection,
) -> Event {
    Event::CallState(CallStateEvent {
        call_id: id.clone(),
        state,
        remote_uri: remote_uri.to_string(),
        direction,
        duration: Duration::ZERO,
    })
}
