//! # siptty engine core
//!
//! The orchestration engine behind the siptty SIP terminal client. It owns
//! account registration and call lifecycle state, turns everything the SIP
//! stack reports into one bounded stream of [`Event`]s, and exposes a small
//! command surface (dial, answer, reject, hang up, send digits, transfer,
//! play audio) to a presentation layer.
//!
//! The engine does not speak SIP. The wire protocol is delegated to a
//! [`SignalingProvider`](provider::SignalingProvider) built by a
//! [`ProviderFactory`](provider::ProviderFactory) the embedder supplies.
//!
//! ## Architecture
//!
//! ```text
//!   Command Source ──► Engine ──► Signaling Provider
//!                        │  ▲            │
//!                        │  └── inbound ─┘ (sessions, SIP trace)
//!                        ▼
//!                   EventStream ──► Event Sink
//! ```
//!
//! ## Delivery guarantees
//!
//! - Registration, call state and digit events are never dropped.
//! - SIP trace events are dropped when the stream is full, so a slow consumer
//!   can never stall signaling. A single warning is logged the first time.
//! - A call's state events always appear in the order
//!   `calling|incoming -> confirmed -> disconnected` (or
//!   `incoming -> disconnected`) and nothing follows `disconnected`.
//! - The stream ends after [`Engine::stop`] once queued events are consumed.

pub mod account;
pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod provider;
pub mod trace;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use account::AccountInfo;
pub use call::{CallId, CallInfo};
pub use config::Config;
pub use engine::{Engine, EngineOptions, Timeouts};
pub use error::{EngineError, EngineResult, ProviderError, ProviderResult};
pub use event::{
    CallDirection, CallState, CallStateEvent, DigitEvent, Event, EventStream, RegistrationEvent,
    RegistrationState, TraceDirection, TraceEvent,
};
