//! Inbound session handling and per-call supervision

use std::future::pending;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::EngineInner;
use crate::call::{AnswerIntent, Call};
use crate::event::CallState;
use crate::provider::{DialogSession, InboundHandler, ServerSession, SessionHandle};

/// Response sent when the operator declines a call
const REJECT_CODE: u16 = 486;
const REJECT_REASON: &str = "Busy Here";

/// How a supervised dialog stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Ended {
    /// The dialog itself ended
    Terminated,
    /// The engine is stopping
    Shutdown,
}

/// Handler the provider calls for every accepted inbound session
pub(super) struct InboundDispatcher {
    engine: Weak<EngineInner>,
}

impl InboundDispatcher {
    pub(super) fn new(engine: Weak<EngineInner>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl InboundHandler for InboundDispatcher {
    async fn on_session(&self, session: Arc<dyn ServerSession>) {
        let Some(engine) = self.engine.upgrade() else {
            tracing::debug!("inbound session after engine drop, ignoring");
            return;
        };
        engine.handle_inbound(session).await;
    }
}

impl EngineInner {
    /// Own one inbound session from offer to disconnection
    pub(super) async fn handle_inbound(&self, session: Arc<dyn ServerSession>) {
        let remote = session.remote_uri();
        let id = self.allocate_call_id();
        let (call, mut intents) = Call::inbound(id.clone(), remote.clone(), Arc::clone(&session));
        let call = Arc::new(call);
        self.insert_call(Arc::clone(&call));

        tracing::info!(call_id = %id, from = %remote, "incoming call");
        call.announce(&self.events).await;

        let terminated = session.terminated();
        let intent = tokio::select! {
            intent = intents.recv() => intent,
            _ = terminated.cancelled() => None,
            _ = self.shutdown.cancelled() => return,
        };

        match intent {
            Some(AnswerIntent::Accept) => {
                if let Err(e) = session.answer().await {
                    tracing::error!(call_id = %id, error = %e, "answer failed");
                } else {
                    tracing::info!(call_id = %id, "call answered");
                    if call.advance(CallState::Confirmed, &self.events).await {
                        let handle = SessionHandle::Server(Arc::clone(&session));
                        if self.supervise(&call, &handle).await == Ended::Shutdown {
                            return;
                        }
                    }
                }
            }
            Some(AnswerIntent::Reject) => {
                if let Err(e) = session.reject(REJECT_CODE, REJECT_REASON).await {
                    tracing::warn!(call_id = %id, error = %e, "reject failed");
                } else {
                    tracing::info!(call_id = %id, "call rejected");
                }
            }
            None => tracing::info!(call_id = %id, "caller hung up before answer"),
        }

        if call.advance(CallState::Disconnected, &self.events).await {
            tracing::info!(call_id = %id, "call ended");
        }
        call.release_session();
    }

    /// Watch a confirmed outbound call for remote hangup
    pub(super) fn watch_outbound(self: &Arc<Self>, call: Arc<Call>) {
        let Some(handle) = call.session() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if engine.supervise(&call, &handle).await == Ended::Terminated
                && call.advance(CallState::Disconnected, &engine.events).await
            {
                tracing::info!(call_id = %call.id(), "remote party hung up");
            }
        });
    }

    /// Forward received digits until the dialog ends or the engine stops
    pub(super) async fn supervise(&self, call: &Call, session: &SessionHandle) -> Ended {
        let terminated = session.terminated();
        let mut digits = session.take_dtmf_receiver();
        loop {
            tokio::select! {
                _ = terminated.cancelled() => return Ended::Terminated,
                _ = self.shutdown.cancelled() => return Ended::Shutdown,
                digit = next_digit(&mut digits) => match digit {
                    Some(digit) => {
                        tracing::debug!(call_id = %call.id(), %digit, "DTMF received");
                        call.publish_digit(digit, &self.events).await;
                    }
                    None => digits = None,
                },
            }
        }
    }
}

async fn next_digit(digits: &mut Option<mpsc::Receiver<char>>) -> Option<char> {
    match digits {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
