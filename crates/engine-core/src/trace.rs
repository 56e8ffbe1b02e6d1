//! SIP trace bridge
//!
//! Turns every raw message the provider reports into a trace event. The
//! provider calls in synchronously from its networking code, so delivery is
//! strictly non-blocking: when the event channel is full the trace is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use chrono::Utc;

use crate::event::{Event, EventPublisher, TraceDirection, TraceEvent, TryPublish};
use crate::provider::SipTracer;

/// Guards the drop warning; one warning per process, not per drop.
static DROP_WARNING: Once = Once::new();

/// [`SipTracer`] that forwards messages onto the engine's event stream
pub struct TraceBridge {
    events: EventPublisher,
    dropped: AtomicU64,
}

impl TraceBridge {
    pub(crate) fn new(events: EventPublisher) -> Self {
        Self {
            events,
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of trace events dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn forward(
        &self,
        direction: TraceDirection,
        transport: &str,
        local_addr: &str,
        remote_addr: &str,
        message: &[u8],
    ) {
        let event = Event::Trace(TraceEvent {
            direction,
            message: String::from_utf8_lossy(message).into_owned(),
            timestamp: Utc::now(),
            transport: transport.to_string(),
            local_addr: local_addr.to_string(),
            remote_addr: remote_addr.to_string(),
        });

        match self.events.try_publish(event) {
            TryPublish::Sent | TryPublish::Closed => {}
            TryPublish::Full => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                DROP_WARNING.call_once(|| {
                    tracing::warn!("SIP trace events dropped: event channel full, consumer too slow");
                });
            }
        }
    }
}

impl SipTracer for TraceBridge {
    fn trace_read(&self, transport: &str, local_addr: &str, remote_addr: &str, message: &[u8]) {
        self.forward(TraceDirection::Received, transport, local_addr, remote_addr, message);
    }

    fn trace_write(&self, transport: &str, local_addr: &str, remote_addr: &str, message: &[u8]) {
        self.forward(TraceDirection::Sent, transport, local_addr, remote_addr, message);
    }
}
