//! Operator commands
//!
//! Every command validates synchronously and returns a descriptive error for
//! unknown identifiers, malformed input or a call without a session. Outcomes
//! of work that continues in the background arrive as events.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{Engine, EngineInner};
use crate::account::Account;
use crate::call::{is_valid_dtmf_digit, state_event, AnswerIntent, Call};
use crate::error::{EngineError, EngineResult, ProviderResult};
use crate::event::{CallDirection, CallState};
use crate::provider::{parse_sip_uri, DialogSession, InviteOptions, SessionHandle};

impl Engine {
    /// Place an outbound call from `account` to `target`.
    ///
    /// Returns once the target is validated; the call runs on its own task.
    /// The stream shows `calling`, then `confirmed` or `disconnected`.
    pub fn dial(&self, account: &str, target: &str) -> EngineResult<()> {
        let account = self.inner.account(account)?;
        let uri = parse_sip_uri(target)?;
        let remote = target.trim().to_string();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_dial(account, uri, remote).await });
        Ok(())
    }

    /// Accept an inbound call that is still ringing.
    ///
    /// A second request while one is pending is absorbed.
    pub fn answer(&self, call_id: &str) -> EngineResult<()> {
        self.signal(call_id, AnswerIntent::Accept)
    }

    /// Decline an inbound call that is still ringing
    pub fn reject(&self, call_id: &str) -> EngineResult<()> {
        self.signal(call_id, AnswerIntent::Reject)
    }

    fn signal(&self, call_id: &str, intent: AnswerIntent) -> EngineResult<()> {
        let call = self.inner.call(call_id)?;
        if !call.signal(intent) {
            return Err(EngineError::not_inbound(call_id));
        }
        tracing::debug!(call_id, ?intent, "operator decision signalled");
        Ok(())
    }

    /// Terminate a call.
    ///
    /// The call moves to `disconnected` whether or not the provider reported
    /// an error; the error is still returned.
    pub async fn hangup(&self, call_id: &str) -> EngineResult<()> {
        let call = self.inner.call(call_id)?;
        let session = live_session(&call)?;

        let timeout = self.inner.options.timeouts.hangup;
        let result = bounded("hangup", timeout, session.hangup()).await;
        if call.advance(CallState::Disconnected, &self.inner.events).await {
            tracing::info!(call_id, "call hung up");
        }
        if let Err(e) = &result {
            tracing::warn!(call_id, error = %e, "hangup reported an error");
        }
        result
    }

    /// Send one DTMF digit (`0-9 * # A-D`)
    pub async fn send_dtmf(&self, call_id: &str, digit: char) -> EngineResult<()> {
        if !is_valid_dtmf_digit(digit) {
            return Err(EngineError::InvalidDigit { digit });
        }
        let call = self.inner.call(call_id)?;
        let session = live_session(&call)?;
        session.send_dtmf(digit).await?;
        Ok(())
    }

    /// Blind-transfer a call to `target`
    pub async fn transfer(&self, call_id: &str, target: &str) -> EngineResult<()> {
        let call = self.inner.call(call_id)?;
        let uri = parse_sip_uri(target)?;
        let session = live_session(&call)?;

        let timeout = self.inner.options.timeouts.transfer;
        bounded("transfer", timeout, session.refer(&uri)).await?;
        tracing::info!(call_id, target, "call transferred");
        Ok(())
    }

    /// Play a WAV file into a call
    pub async fn play_audio(&self, call_id: &str, path: impl AsRef<Path>) -> EngineResult<()> {
        let call = self.inner.call(call_id)?;
        let session = live_session(&call)?;

        let mut playback = session.create_playback()?;
        playback.play_file(path.as_ref()).await?;
        Ok(())
    }
}

impl EngineInner {
    async fn run_dial(self: Arc<Self>, account: Arc<Account>, target: rsip::Uri, remote: String) {
        let id = self.allocate_call_id();
        self.events
            .publish(state_event(&id, CallState::Calling, &remote, CallDirection::Outbound))
            .await;

        let options = InviteOptions {
            username: account.config().auth_user.clone(),
            password: account.config().auth_password.clone(),
            headers: account.config().headers.clone(),
        };
        let timeout = self.options.timeouts.dial;
        let session = match bounded("dial", timeout, self.provider.invite(&target, options)).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(call_id = %id, account = %account.id(), uri = %remote, error = %e, "invite failed");
                self.events
                    .publish(state_event(&id, CallState::Disconnected, &remote, CallDirection::Outbound))
                    .await;
                return;
            }
        };

        if self.shutdown.is_cancelled() {
            tracing::info!(call_id = %id, "engine stopped during dial, hanging up");
            if let Err(e) = bounded("hangup", self.options.timeouts.hangup, session.hangup()).await {
                tracing::warn!(call_id = %id, error = %e, "hangup after stop failed");
            }
            self.events
                .publish(state_event(&id, CallState::Disconnected, &remote, CallDirection::Outbound))
                .await;
            return;
        }

        let call = Arc::new(Call::outbound(id.clone(), remote, session));
        self.insert_call(Arc::clone(&call));
        if call.advance(CallState::Confirmed, &self.events).await {
            tracing::info!(call_id = %id, account = %account.id(), "outbound call confirmed");
            self.watch_outbound(call);
        }
    }
}

fn live_session(call: &Call) -> EngineResult<SessionHandle> {
    call.session()
        .ok_or_else(|| EngineError::no_active_session(call.id().as_str()))
}

/// Run a provider operation under a deadline
async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl std::future::Future<Output = ProviderResult<T>>,
) -> EngineResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(EngineError::from),
        Err(_) => Err(EngineError::Timeout {
            operation,
            seconds: timeout.as_secs(),
        }),
    }
}
