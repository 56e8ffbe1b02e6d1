//! Account registration lifecycle
//!
//! One [`Account`] exists per enabled account definition. Each runs at most
//! one registration task at a time; the task reports its outcome as a
//! registration event and keeps the provider's registration handle so the
//! engine can unregister on shutdown.
//!
//! Cancelling the task does not unregister. Unregistration is the separate,
//! time-bounded [`Account::unregister`] step performed by `Engine::stop`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AccountConfig;
use crate::event::{Event, EventPublisher, RegistrationEvent, RegistrationState};
use crate::provider::{parse_sip_uri, Registration, RegisterOptions, SignalingProvider};

/// Point-in-time view of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountInfo {
    pub id: String,
    pub state: RegistrationState,
    pub reason: Option<String>,
}

#[derive(Debug)]
struct Status {
    state: RegistrationState,
    reason: Option<String>,
}

/// A configured SIP identity and its registration state
pub struct Account {
    config: AccountConfig,
    status: Mutex<Status>,
    registration: Mutex<Option<Arc<dyn Registration>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Account {
    pub(crate) fn new(config: AccountConfig) -> Self {
        Self {
            config,
            status: Mutex::new(Status {
                state: RegistrationState::Unregistered,
                reason: None,
            }),
            registration: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    /// Unique account identity
    pub fn id(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn state(&self) -> RegistrationState {
        self.status.lock().state
    }

    pub fn info(&self) -> AccountInfo {
        let status = self.status.lock();
        AccountInfo {
            id: self.config.name.clone(),
            state: status.state,
            reason: status.reason.clone(),
        }
    }

    /// Spawn the registration task, bound to a child of `parent`.
    ///
    /// A task still running from an earlier call is cancelled first.
    pub(crate) fn start_registration(
        self: &Arc<Self>,
        provider: Arc<dyn SignalingProvider>,
        events: EventPublisher,
        parent: &CancellationToken,
    ) {
        let token = parent.child_token();
        if let Some(previous) = self.cancel.lock().replace(token.clone()) {
            previous.cancel();
        }

        let account = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(account = %account.id(), "registration task cancelled");
                }
                _ = account.register(provider.as_ref(), &events) => {}
            }
        });
    }

    async fn register(&self, provider: &dyn SignalingProvider, events: &EventPublisher) {
        let registrar = match parse_sip_uri(&self.config.registrar) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(account = %self.id(), error = %e, "invalid registrar URI");
                self.fail(format!("invalid registrar URI: {e}"), events).await;
                return;
            }
        };

        let options = RegisterOptions {
            username: self.config.auth_user.clone(),
            password: self.config.auth_password.clone(),
            expiry: self.config.reg_expiry,
            headers: self.config.headers.clone(),
        };
        let registration: Arc<dyn Registration> =
            match provider.prepare_registration(&registrar, options).await {
                Ok(registration) => Arc::from(registration),
                Err(e) => {
                    tracing::error!(account = %self.id(), error = %e, "register transaction failed");
                    self.fail(format!("register transaction: {e}"), events).await;
                    return;
                }
            };
        *self.registration.lock() = Some(Arc::clone(&registration));

        if let Err(e) = registration.register().await {
            tracing::error!(account = %self.id(), error = %e, "registration failed");
            self.fail(format!("register: {e}"), events).await;
            return;
        }

        tracing::info!(account = %self.id(), "registered");
        self.set_status(RegistrationState::Registered, None, events).await;
    }

    async fn fail(&self, reason: String, events: &EventPublisher) {
        self.set_status(RegistrationState::Failed, Some(reason), events).await;
    }

    async fn set_status(
        &self,
        state: RegistrationState,
        reason: Option<String>,
        events: &EventPublisher,
    ) {
        {
            let mut status = self.status.lock();
            status.state = state;
            status.reason = reason.clone();
        }
        events
            .publish(Event::Registration(RegistrationEvent {
                account: self.config.name.clone(),
                state,
                reason,
            }))
            .await;
    }

    /// Stop the task and remove the registration binding, best-effort.
    ///
    /// Failures and timeouts are logged only.
    pub(crate) async fn unregister(&self, timeout: Duration) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }

        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            match tokio::time::timeout(timeout, registration.unregister()).await {
                Ok(Ok(())) => tracing::info!(account = %self.id(), "unregistered"),
                Ok(Err(e)) => tracing::warn!(account = %self.id(), error = %e, "unregister failed"),
                Err(_) => tracing::warn!(
                    account = %self.id(),
                    timeout_secs = timeout.as_secs(),
                    "unregister timed out"
                ),
            }
        }

        let mut status = self.status.lock();
        status.state = RegistrationState::Unregistered;
        status.reason = None;
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
