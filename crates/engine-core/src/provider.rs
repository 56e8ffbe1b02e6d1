//! Signaling Provider seam
//!
//! The engine does not speak SIP itself. Everything on the wire (REGISTER,
//! INVITE, digest challenges, retransmissions, media) is delegated to a
//! provider implementing the traits in this module. The engine only
//! coordinates calls to it and turns its outcomes into events.
//!
//! # Construction
//!
//! Providers are built through a [`ProviderFactory`] that receives the
//! engine's [`SipTracer`] as a constructor argument, so every message the
//! provider ever sends or receives is traced and several engines can live in
//! one process without sharing a global tracer.
//!
//! # Roles
//!
//! An outbound dialog is a [`ClientSession`], an inbound one a
//! [`ServerSession`]. A call owns exactly one of them through
//! [`SessionHandle`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Transport;
use crate::error::{EngineError, EngineResult, ProviderResult};

/// Options for the provider's local signaling agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    /// User-Agent header value
    pub user_agent: String,
    /// Identity advertised in From headers.
    ///
    /// This is the user part of the first enabled account. Registrars such as
    /// Asterisk reject digest authentication when the challenge identity does
    /// not match the From user.
    pub identity: String,
    /// Hostname advertised by the agent
    pub hostname: String,
    pub transport: Transport,
    pub bind_host: String,
    pub bind_port: u16,
}

/// Credentials and expiry for a REGISTER exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    pub username: String,
    pub password: String,
    /// Expiry in seconds
    pub expiry: u32,
    /// Extra headers from the account configuration
    pub headers: BTreeMap<String, String>,
}

/// Credentials for an outbound INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteOptions {
    pub username: String,
    pub password: String,
    pub headers: BTreeMap<String, String>,
}

/// Receives every raw message the provider sends or writes.
///
/// Called synchronously from the provider's networking code, possibly at high
/// rate and from tasks the provider owns. Implementations must not block.
pub trait SipTracer: Send + Sync {
    /// A message arrived from `remote_addr`
    fn trace_read(&self, transport: &str, local_addr: &str, remote_addr: &str, message: &[u8]);

    /// A message was written to `remote_addr`
    fn trace_write(&self, transport: &str, local_addr: &str, remote_addr: &str, message: &[u8]);
}

/// Builds the provider for one engine
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        options: AgentOptions,
        tracer: Arc<dyn SipTracer>,
    ) -> ProviderResult<Arc<dyn SignalingProvider>>;
}

/// Callback the provider invokes for each accepted inbound session.
///
/// The provider calls it on a task of its own; the dialog lives as long as the
/// returned future runs.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_session(&self, session: Arc<dyn ServerSession>);
}

/// Wire-level SIP stack consumed by the engine
#[async_trait]
pub trait SignalingProvider: Send + Sync {
    /// Prepare a REGISTER exchange against `registrar`
    async fn prepare_registration(
        &self,
        registrar: &rsip::Uri,
        options: RegisterOptions,
    ) -> ProviderResult<Box<dyn Registration>>;

    /// Start accepting inbound sessions in the background.
    ///
    /// Returns once the listener is live. The listener stops when `cancel`
    /// fires.
    async fn serve(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn InboundHandler>,
    ) -> ProviderResult<()>;

    /// Send an INVITE and wait for the dialog to be established
    async fn invite(
        &self,
        target: &rsip::Uri,
        options: InviteOptions,
    ) -> ProviderResult<Arc<dyn ClientSession>>;

    /// Release the local agent and its transports
    async fn close(&self);
}

/// A prepared registration binding
#[async_trait]
pub trait Registration: Send + Sync {
    /// Send REGISTER (answering challenges) until a final response
    async fn register(&self) -> ProviderResult<()>;

    /// Remove the binding (REGISTER with Expires: 0)
    async fn unregister(&self) -> ProviderResult<()>;
}

/// Operations shared by both dialog roles
#[async_trait]
pub trait DialogSession: Send + Sync {
    /// Send BYE (or CANCEL before establishment)
    async fn hangup(&self) -> ProviderResult<()>;

    /// Send one RFC 4733 telephone-event
    async fn send_dtmf(&self, digit: char) -> ProviderResult<()>;

    /// Blind transfer via REFER
    async fn refer(&self, target: &rsip::Uri) -> ProviderResult<()>;

    /// Create a playback resource on the session's media
    fn create_playback(&self) -> ProviderResult<Box<dyn Playback>>;

    /// Fires when the dialog ends for any reason (BYE either way, timeout)
    fn terminated(&self) -> CancellationToken;

    /// Digits received from the remote party, available once
    fn take_dtmf_receiver(&self) -> Option<mpsc::Receiver<char>> {
        None
    }
}

/// Outbound (UAC) dialog
pub trait ClientSession: DialogSession {}

/// Inbound (UAS) dialog
#[async_trait]
pub trait ServerSession: DialogSession {
    /// From address of the INVITE
    fn remote_uri(&self) -> String;

    /// Accept the INVITE with 200 OK
    async fn answer(&self) -> ProviderResult<()>;

    /// Decline the INVITE with a final error response
    async fn reject(&self, code: u16, reason: &str) -> ProviderResult<()>;
}

/// Audio playback into a session
#[async_trait]
pub trait Playback: Send {
    /// Start playing a WAV file
    async fn play_file(&mut self, path: &Path) -> ProviderResult<()>;
}

/// The session a call owns, tagged by role
#[derive(Clone)]
pub enum SessionHandle {
    Client(Arc<dyn ClientSession>),
    Server(Arc<dyn ServerSession>),
}

impl SessionHandle {
    pub async fn hangup(&self) -> ProviderResult<()> {
        match self {
            SessionHandle::Client(s) => s.hangup().await,
            SessionHandle::Server(s) => s.hangup().await,
        }
    }

    pub async fn send_dtmf(&self, digit: char) -> ProviderResult<()> {
        match self {
            SessionHandle::Client(s) => s.send_dtmf(digit).await,
            SessionHandle::Server(s) => s.send_dtmf(digit).await,
        }
    }

    pub async fn refer(&self, target: &rsip::Uri) -> ProviderResult<()> {
        match self {
            SessionHandle::Client(s) => s.refer(target).await,
            SessionHandle::Server(s) => s.refer(target).await,
        }
    }

    pub fn create_playback(&self) -> ProviderResult<Box<dyn Playback>> {
        match self {
            SessionHandle::Client(s) => s.create_playback(),
            SessionHandle::Server(s) => s.create_playback(),
        }
    }

    pub fn terminated(&self) -> CancellationToken {
        match self {
            SessionHandle::Client(s) => s.terminated(),
            SessionHandle::Server(s) => s.terminated(),
        }
    }

    pub fn take_dtmf_receiver(&self) -> Option<mpsc::Receiver<char>> {
        match self {
            SessionHandle::Client(s) => s.take_dtmf_receiver(),
            SessionHandle::Server(s) => s.take_dtmf_receiver(),
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, SessionHandle::Client(_))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionHandle::Client(_) => f.write_str("SessionHandle::Client"),
            SessionHandle::Server(_) => f.write_str("SessionHandle::Server"),
        }
    }
}

/// Parse a `sip:`/`sips:` address
pub fn parse_sip_uri(uri: &str) -> EngineResult<rsip::Uri> {
    let uri = uri.trim();
    let has_scheme = uri.len() > 4 && (uri.starts_with("sip:") || uri.starts_with("sips:"));
    if !has_scheme {
        return Err(EngineError::invalid_uri(uri, "expected a sip: or sips: URI"));
    }
    rsip::Uri::try_from(uri).map_err(|e| EngineError::invalid_uri(uri, e))
}
