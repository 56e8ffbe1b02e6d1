//! Scripted in-memory Signaling Provider
//!
//! Lets engine users test against realistic provider behavior without a
//! network: registrations and invites follow scripted outcomes, inbound
//! sessions and remote hangups are simulated on demand, and every operation
//! the engine performs on a session is recorded for assertions.
//!
//! ```rust,no_run
//! use siptty_engine_core::config::{AccountConfig, Config};
//! use siptty_engine_core::testing::FakeProviderFactory;
//! use siptty_engine_core::Engine;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::default();
//! config.accounts.push(AccountConfig::new("work", "sip:alice@pbx", "sip:pbx"));
//!
//! let factory = FakeProviderFactory::new();
//! let (engine, _events) = Engine::new(&config, &factory)?;
//! engine.start(CancellationToken::new()).await?;
//!
//! let provider = factory.provider().expect("provider created");
//! let session = provider.offer_inbound("sip:bob@pbx");
//! session.remote_hangup();
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Transport;
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{
    AgentOptions, ClientSession, DialogSession, InboundHandler, InviteOptions, Playback,
    ProviderFactory, Registration, RegisterOptions, ServerSession, SignalingProvider, SipTracer,
};

const LOCAL_ADDR: &str = "127.0.0.1:5060";
const REMOTE_ADDR: &str = "192.0.2.10:5060";

/// Agent options used when a test builds a provider directly
pub fn agent_options() -> AgentOptions {
    AgentOptions {
        user_agent: "siptty-test".to_string(),
        identity: "alice".to_string(),
        hostname: "localhost".to_string(),
        transport: Transport::Udp,
        bind_host: "127.0.0.1".to_string(),
        bind_port: 0,
    }
}

/// Scripted result of a registration, keyed by digest username
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Succeeds,
    PrepareFails(ProviderError),
    RegisterFails(ProviderError),
    /// Registers, but the later unregister fails
    UnregisterFails(ProviderError),
    /// REGISTER never gets a final response
    Hang,
}

/// Scripted result of an outbound INVITE
#[derive(Debug, Clone)]
pub enum InviteOutcome {
    Answered,
    /// Answered once the delay has passed
    AnsweredAfter(Duration),
    Fails(ProviderError),
    /// No final response ever arrives
    Hang,
}

#[derive(Default)]
struct Script {
    create_error: Option<ProviderError>,
    serve_error: Option<ProviderError>,
    register: HashMap<String, RegisterOutcome>,
    invites: VecDeque<InviteOutcome>,
}

/// Builds [`FakeProvider`]s and keeps the last one for inspection
#[derive(Default)]
pub struct FakeProviderFactory {
    script: Arc<Mutex<Script>>,
    created: Mutex<Option<Arc<FakeProvider>>>,
    options: Mutex<Option<AgentOptions>>,
}

impl FakeProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail
    pub fn fail_create(&self, error: ProviderError) {
        self.script.lock().create_error = Some(error);
    }

    /// Make `serve` fail
    pub fn fail_serve(&self, error: ProviderError) {
        self.script.lock().serve_error = Some(error);
    }

    /// Script the registration of the account whose digest user is `username`
    pub fn script_register(&self, username: &str, outcome: RegisterOutcome) {
        self.script.lock().register.insert(username.to_string(), outcome);
    }

    /// Queue the outcome of the next unscripted INVITE; defaults to answered
    pub fn script_invite(&self, outcome: InviteOutcome) {
        self.script.lock().invites.push_back(outcome);
    }

    /// The provider built by the last successful `create`
    pub fn provider(&self) -> Option<Arc<FakeProvider>> {
        self.created.lock().clone()
    }

    /// Options the engine passed to `create`
    pub fn agent_options(&self) -> Option<AgentOptions> {
        self.options.lock().clone()
    }
}

impl ProviderFactory for FakeProviderFactory {
    fn create(
        &self,
        options: AgentOptions,
        tracer: Arc<dyn SipTracer>,
    ) -> ProviderResult<Arc<dyn SignalingProvider>> {
        if let Some(error) = self.script.lock().create_error.clone() {
            return Err(error);
        }
        *self.options.lock() = Some(options.clone());

        let provider = Arc::new(FakeProvider {
            options,
            tracer,
            script: Arc::clone(&self.script),
            handler: Mutex::new(None),
            log: Arc::new(Mutex::new(Vec::new())),
            registrations: Mutex::new(Vec::new()),
            invites: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            inbound: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        *self.created.lock() = Some(Arc::clone(&provider));
        Ok(provider)
    }
}

/// In-memory provider; see the module docs
pub struct FakeProvider {
    options: AgentOptions,
    tracer: Arc<dyn SipTracer>,
    script: Arc<Mutex<Script>>,
    handler: Mutex<Option<(Arc<dyn InboundHandler>, CancellationToken)>>,
    log: Arc<Mutex<Vec<String>>>,
    registrations: Mutex<Vec<(String, RegisterOptions)>>,
    invites: Mutex<Vec<(String, InviteOptions)>>,
    outbound: Mutex<Vec<Arc<FakeSession>>>,
    inbound: Mutex<Vec<Arc<FakeSession>>>,
    closed: AtomicBool,
}

impl FakeProvider {
    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Ordered record of provider operations, e.g. `serve`, `register:alice`
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Registrar and options of every prepared registration
    pub fn registrations(&self) -> Vec<(String, RegisterOptions)> {
        self.registrations.lock().clone()
    }

    /// Usernames whose binding was removed
    pub fn unregisters(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|entry| entry.strip_prefix("unregister:"))
            .map(str::to_string)
            .collect()
    }

    /// Target and options of every INVITE
    pub fn invites(&self) -> Vec<(String, InviteOptions)> {
        self.invites.lock().clone()
    }

    /// Sessions created by answered INVITEs, in order
    pub fn outbound_sessions(&self) -> Vec<Arc<FakeSession>> {
        self.outbound.lock().clone()
    }

    /// Sessions offered through [`FakeProvider::offer_inbound`]
    pub fn inbound_sessions(&self) -> Vec<Arc<FakeSession>> {
        self.inbound.lock().clone()
    }

    /// Whether the inbound listener is live
    pub fn is_serving(&self) -> bool {
        self.handler
            .lock()
            .as_ref()
            .is_some_and(|(_, cancel)| !cancel.is_cancelled())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate an INVITE arriving from `remote`.
    ///
    /// The handler runs on its own task. Panics if the listener is not live.
    pub fn offer_inbound(&self, remote: &str) -> Arc<FakeSession> {
        let handler = match self.handler.lock().as_ref() {
            Some((handler, cancel)) if !cancel.is_cancelled() => Arc::clone(handler),
            _ => panic!("inbound session offered while the listener is not serving"),
        };

        let session = FakeSession::new(remote);
        self.inbound.lock().push(Arc::clone(&session));
        self.trace_read(&format!("INVITE sip:{}@localhost SIP/2.0", self.options.identity));

        let server: Arc<dyn ServerSession> = session.clone();
        tokio::spawn(async move { handler.on_session(server).await });
        session
    }

    /// Push `count` received messages through the tracer
    pub fn emit_traces(&self, count: usize) {
        for i in 0..count {
            self.trace_read(&format!("OPTIONS sip:localhost SIP/2.0\r\nCSeq: {i} OPTIONS"));
        }
    }

    fn trace_read(&self, message: &str) {
        self.tracer
            .trace_read(self.options.transport.as_str(), LOCAL_ADDR, REMOTE_ADDR, message.as_bytes());
    }

    fn trace_write(&self, message: &str) {
        self.tracer
            .trace_write(self.options.transport.as_str(), LOCAL_ADDR, REMOTE_ADDR, message.as_bytes());
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }
}

#[async_trait]
impl SignalingProvider for FakeProvider {
    async fn prepare_registration(
        &self,
        registrar: &rsip::Uri,
        options: RegisterOptions,
    ) -> ProviderResult<Box<dyn Registration>> {
        self.registrations
            .lock()
            .push((registrar.to_string(), options.clone()));

        let outcome = self
            .script
            .lock()
            .register
            .get(&options.username)
            .cloned()
            .unwrap_or(RegisterOutcome::Succeeds);
        if let RegisterOutcome::PrepareFails(error) = outcome {
            return Err(error);
        }

        Ok(Box::new(FakeRegistration {
            username: options.username,
            outcome,
            log: Arc::clone(&self.log),
        }))
    }

    async fn serve(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn InboundHandler>,
    ) -> ProviderResult<()> {
        if let Some(error) = self.script.lock().serve_error.clone() {
            return Err(error);
        }
        self.record("serve".to_string());
        *self.handler.lock() = Some((handler, cancel));
        Ok(())
    }

    async fn invite(
        &self,
        target: &rsip::Uri,
        options: InviteOptions,
    ) -> ProviderResult<Arc<dyn ClientSession>> {
        let target = target.to_string();
        self.record(format!("invite:{target}"));
        self.invites.lock().push((target.clone(), options));
        self.trace_write(&format!("INVITE {target} SIP/2.0"));

        let outcome = self
            .script
            .lock()
            .invites
            .pop_front()
            .unwrap_or(InviteOutcome::Answered);
        if let InviteOutcome::AnsweredAfter(delay) = outcome {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            InviteOutcome::Answered | InviteOutcome::AnsweredAfter(_) => {
                self.trace_read("SIP/2.0 200 OK");
                let session = FakeSession::new(&target);
                self.outbound.lock().push(Arc::clone(&session));
                Ok(session)
            }
            InviteOutcome::Fails(error) => Err(error),
            InviteOutcome::Hang => std::future::pending().await,
        }
    }

    async fn close(&self) {
        self.record("close".to_string());
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeRegistration {
    username: String,
    outcome: RegisterOutcome,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Registration for FakeRegistration {
    async fn register(&self) -> ProviderResult<()> {
        self.log.lock().push(format!("register:{}", self.username));
        match &self.outcome {
            RegisterOutcome::RegisterFails(error) => Err(error.clone()),
            RegisterOutcome::Hang => std::future::pending().await,
            _ => Ok(()),
        }
    }

    async fn unregister(&self) -> ProviderResult<()> {
        self.log.lock().push(format!("unregister:{}", self.username));
        match &self.outcome {
            RegisterOutcome::UnregisterFails(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }
}

/// Fake dialog usable in either role
pub struct FakeSession {
    remote: String,
    terminated: CancellationToken,
    hangups: AtomicUsize,
    answered: AtomicBool,
    rejected: Mutex<Option<(u16, String)>>,
    answer_error: Mutex<Option<ProviderError>>,
    hangup_error: Mutex<Option<ProviderError>>,
    playback_error: Mutex<Option<ProviderError>>,
    digits_sent: Mutex<Vec<char>>,
    refers: Mutex<Vec<String>>,
    plays: Arc<Mutex<Vec<PathBuf>>>,
    digit_tx: mpsc::Sender<char>,
    digit_rx: Mutex<Option<mpsc::Receiver<char>>>,
}

impl FakeSession {
    pub fn new(remote: &str) -> Arc<Self> {
        let (digit_tx, digit_rx) = mpsc::channel(32);
        Arc::new(Self {
            remote: remote.to_string(),
            terminated: CancellationToken::new(),
            hangups: AtomicUsize::new(0),
            answered: AtomicBool::new(false),
            rejected: Mutex::new(None),
            answer_error: Mutex::new(None),
            hangup_error: Mutex::new(None),
            playback_error: Mutex::new(None),
            digits_sent: Mutex::new(Vec::new()),
            refers: Mutex::new(Vec::new()),
            plays: Arc::new(Mutex::new(Vec::new())),
            digit_tx,
            digit_rx: Mutex::new(Some(digit_rx)),
        })
    }

    /// The remote party ends the dialog
    pub fn remote_hangup(&self) {
        self.terminated.cancel();
    }

    /// The remote party sends a DTMF digit
    pub async fn receive_digit(&self, digit: char) {
        let _ = self.digit_tx.send(digit).await;
    }

    pub fn fail_answer(&self, error: ProviderError) {
        *self.answer_error.lock() = Some(error);
    }

    pub fn fail_hangup(&self, error: ProviderError) {
        *self.hangup_error.lock() = Some(error);
    }

    pub fn fail_playback(&self, error: ProviderError) {
        *self.playback_error.lock() = Some(error);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    pub fn hangups(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    pub fn rejection(&self) -> Option<(u16, String)> {
        self.rejected.lock().clone()
    }

    pub fn digits_sent(&self) -> Vec<char> {
        self.digits_sent.lock().clone()
    }

    pub fn refers(&self) -> Vec<String> {
        self.refers.lock().clone()
    }

    pub fn plays(&self) -> Vec<PathBuf> {
        self.plays.lock().clone()
    }

    fn ensure_live(&self) -> ProviderResult<()> {
        if self.terminated.is_cancelled() {
            Err(ProviderError::SessionTerminated)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DialogSession for FakeSession {
    async fn hangup(&self) -> ProviderResult<()> {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        self.terminated.cancel();
        match self.hangup_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn send_dtmf(&self, digit: char) -> ProviderResult<()> {
        self.ensure_live()?;
        self.digits_sent.lock().push(digit);
        Ok(())
    }

    async fn refer(&self, target: &rsip::Uri) -> ProviderResult<()> {
        self.ensure_live()?;
        self.refers.lock().push(target.to_string());
        Ok(())
    }

    fn create_playback(&self) -> ProviderResult<Box<dyn Playback>> {
        self.ensure_live()?;
        Ok(Box::new(FakePlayback {
            plays: Arc::clone(&self.plays),
            error: self.playback_error.lock().clone(),
        }))
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    fn take_dtmf_receiver(&self) -> Option<mpsc::Receiver<char>> {
        self.digit_rx.lock().take()
    }
}

impl ClientSession for FakeSession {}

#[async_trait]
impl ServerSession for FakeSession {
    fn remote_uri(&self) -> String {
        self.remote.clone()
    }

    async fn answer(&self) -> ProviderResult<()> {
        self.ensure_live()?;
        if let Some(error) = self.answer_error.lock().clone() {
            return Err(error);
        }
        self.answered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, code: u16, reason: &str) -> ProviderResult<()> {
        *self.rejected.lock() = Some((code, reason.to_string()));
        self.terminated.cancel();
        Ok(())
    }
}

struct FakePlayback {
    plays: Arc<Mutex<Vec<PathBuf>>>,
    error: Option<ProviderError>,
}

#[async_trait]
impl Playback for FakePlayback {
    async fn play_file(&mut self, path: &Path) -> ProviderResult<()> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        self.plays.lock().push(path.to_path_buf());
        Ok(())
    }
}
