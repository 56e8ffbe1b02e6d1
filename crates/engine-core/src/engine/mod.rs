//! The orchestration engine
//!
//! [`Engine`] owns the account and call collections, runs the background
//! registration and inbound-call tasks, and funnels everything observable
//! into one bounded [`EventStream`].
//!
//! # Lifecycle
//!
//! 1. [`Engine::new`] builds the provider (injecting the trace bridge so no
//!    message is missed) and one account per enabled definition.
//! 2. [`Engine::start`] brings up the inbound listener, then launches one
//!    registration task per account that asks for it. Outcomes arrive as
//!    events; `start` does not wait for them.
//! 3. Commands ([`Engine::dial`], [`Engine::answer`], [`Engine::hangup`], ...)
//!    validate synchronously and report asynchronous outcomes as events.
//! 4. [`Engine::stop`] unregisters, stops the listener, releases the agent and
//!    closes the stream. The stream yields `None` once drained.
//!
//! # Example
//!
//! ```rust,no_run
//! use siptty_engine_core::config::Config;
//! use siptty_engine_core::provider::ProviderFactory;
//! use siptty_engine_core::Engine;
//! use tokio_stream::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(config: Config, factory: &dyn ProviderFactory) -> Result<(), Box<dyn std::error::Error>> {
//!     let (engine, mut events) = Engine::new(&config, factory)?;
//!     engine.start(CancellationToken::new()).await?;
//!
//!     engine.dial("work", "sip:100@pbx")?;
//!     while let Some(event) = events.next().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Locking
//!
//! The collections sit behind one reader/writer lock that is only ever held
//! for the lookup or insertion itself, never across a provider call. Each call
//! has its own state lock (see [`crate::call`]).

mod commands;
mod inbound;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountInfo};
use crate::call::{Call, CallId, CallInfo};
use crate::config::{user_part, Config};
use crate::error::{EngineError, EngineResult};
use crate::event::{EventPublisher, EventStream, DEFAULT_EVENT_CAPACITY};
use crate::provider::{AgentOptions, ProviderFactory, SignalingProvider};
use crate::trace::TraceBridge;

use inbound::InboundDispatcher;

/// Identity advertised when no enabled account has a user part
pub const FALLBACK_IDENTITY: &str = "siptty";

/// Hostname advertised by the local agent
pub const AGENT_HOSTNAME: &str = "localhost";

/// Bounds on provider operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub unregister: Duration,
    pub hangup: Duration,
    pub transfer: Duration,
    pub dial: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            unregister: Duration::from_secs(5),
            hangup: Duration::from_secs(5),
            transfer: Duration::from_secs(10),
            dial: Duration::from_secs(30),
        }
    }
}

/// Engine construction options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Capacity of the event channel
    pub event_capacity: usize,
    pub timeouts: Timeouts,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            timeouts: Timeouts::default(),
        }
    }
}

/// User part of the first enabled account's address.
///
/// Registrars such as Asterisk validate the digest identity against the
/// advertised agent name, so it has to be the extension.
pub fn derive_identity(config: &Config) -> String {
    config
        .enabled_accounts()
        .map(|account| user_part(&account.sip_uri))
        .next()
        .filter(|user| !user.is_empty())
        .unwrap_or(FALLBACK_IDENTITY)
        .to_string()
}

#[derive(Default)]
struct Registry {
    /// Configuration order
    accounts: Vec<Arc<Account>>,
    calls: HashMap<CallId, Arc<Call>>,
    next_call_id: u64,
}

pub(crate) struct EngineInner {
    options: EngineOptions,
    provider: Arc<dyn SignalingProvider>,
    events: EventPublisher,
    tracer: Arc<TraceBridge>,
    registry: RwLock<Registry>,
    started: AtomicBool,
    stopped: AtomicBool,
    serve_cancel: Mutex<Option<CancellationToken>>,
    /// Fires on stop; background watchers exit without emitting
    shutdown: CancellationToken,
}

/// The orchestration engine; cheap to clone
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine with default options.
    ///
    /// Returns the engine and the read side of its event stream.
    pub fn new(config: &Config, factory: &dyn ProviderFactory) -> EngineResult<(Self, EventStream)> {
        Self::with_options(config, factory, EngineOptions::default())
    }

    pub fn with_options(
        config: &Config,
        factory: &dyn ProviderFactory,
        options: EngineOptions,
    ) -> EngineResult<(Self, EventStream)> {
        let (events, stream) = EventPublisher::channel(options.event_capacity);

        // The tracer goes in before the provider exists so nothing escapes it
        let tracer = Arc::new(TraceBridge::new(events.clone()));
        let transport = config
            .enabled_accounts()
            .next()
            .map(|account| account.transport)
            .unwrap_or_default();
        let agent = AgentOptions {
            user_agent: config.general.user_agent.clone(),
            identity: derive_identity(config),
            hostname: AGENT_HOSTNAME.to_string(),
            transport,
            bind_host: config.general.bind_host.clone(),
            bind_port: config.general.bind_port,
        };
        tracing::debug!(identity = %agent.identity, transport = %agent.transport, "creating signaling provider");
        let provider = factory.create(agent, tracer.clone())?;

        let accounts: Vec<_> = config
            .enabled_accounts()
            .cloned()
            .map(|account| Arc::new(Account::new(account)))
            .collect();
        tracing::info!(accounts = accounts.len(), "engine created");

        let inner = EngineInner {
            options,
            provider,
            events,
            tracer,
            registry: RwLock::new(Registry {
                accounts,
                ..Registry::default()
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            serve_cancel: Mutex::new(None),
            shutdown: CancellationToken::new(),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            stream,
        ))
    }

    /// Start the inbound listener, then the registration tasks.
    ///
    /// Everything started here unwinds when `cancel` fires. Fails with
    /// [`EngineError::Listener`] if the listener cannot be started, in which
    /// case nothing else was started.
    pub async fn start(&self, cancel: CancellationToken) -> EngineResult<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        let serve_token = cancel.child_token();
        let handler = Arc::new(InboundDispatcher::new(Arc::downgrade(inner)));
        if let Err(e) = inner.provider.serve(serve_token.clone(), handler).await {
            serve_token.cancel();
            inner.started.store(false, Ordering::SeqCst);
            tracing::error!(error = %e, "failed to start inbound listener");
            return Err(EngineError::Listener(e));
        }
        *inner.serve_cancel.lock() = Some(serve_token);

        for account in inner.accounts() {
            if account.config().register {
                account.start_registration(Arc::clone(&inner.provider), inner.events.clone(), &cancel);
            }
        }
        tracing::info!("engine started");
        Ok(())
    }

    /// Unregister every account, stop the listener, release the agent and
    /// close the event stream.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for account in inner.accounts() {
            account.unregister(inner.options.timeouts.unregister).await;
        }
        if let Some(token) = inner.serve_cancel.lock().take() {
            token.cancel();
        }
        inner.shutdown.cancel();
        inner.provider.close().await;
        inner.events.close();
        tracing::info!("engine stopped");
    }

    /// Account identities in configuration order
    pub fn accounts(&self) -> Vec<String> {
        self.inner
            .accounts()
            .iter()
            .map(|account| account.id().to_string())
            .collect()
    }

    pub fn account_infos(&self) -> Vec<AccountInfo> {
        self.inner.accounts().iter().map(|account| account.info()).collect()
    }

    /// Every call the engine knows about, oldest first.
    ///
    /// Waits on each call's state lock, which is held while that call's
    /// events are published. Never await this on the task that drains the
    /// event stream.
    pub async fn calls(&self) -> Vec<CallInfo> {
        let calls: Vec<_> = self.inner.registry.read().calls.values().cloned().collect();
        let mut infos = Vec::with_capacity(calls.len());
        for call in calls {
            infos.push(call.info().await);
        }
        infos.sort_by_key(|info| info.call_id.sequence());
        infos
    }

    /// Trace events dropped by backpressure so far
    pub fn dropped_traces(&self) -> u64 {
        self.inner.tracer.dropped()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.inner.options)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl EngineInner {
    fn accounts(&self) -> Vec<Arc<Account>> {
        self.registry.read().accounts.clone()
    }

    fn account(&self, id: &str) -> EngineResult<Arc<Account>> {
        self.registry
            .read()
            .accounts
            .iter()
            .find(|account| account.id() == id)
            .cloned()
            .ok_or_else(|| EngineError::account_not_found(id))
    }

    fn call(&self, id: &str) -> EngineResult<Arc<Call>> {
        self.registry
            .read()
            .calls
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::call_not_found(id))
    }

    fn allocate_call_id(&self) -> CallId {
        let mut registry = self.registry.write();
        registry.next_call_id += 1;
        CallId::from_counter(registry.next_call_id)
    }

    fn insert_call(&self, call: Arc<Call>) {
        self.registry.write().calls.insert(call.id().clone(), call);
    }
}
