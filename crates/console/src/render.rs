//! One-line text rendering of engine events and snapshots

use siptty_engine_core::{AccountInfo, CallInfo, Event, TraceDirection};

/// Render an event as a single console line
pub fn render_event(event: &Event) -> String {
    match event {
        Event::Registration(reg) => match &reg.reason {
            Some(reason) => format!("[reg] {} {}: {}", reg.account, reg.state, reason),
            None => format!("[reg] {} {}", reg.account, reg.state),
        },
        Event::CallState(call) => format!(
            "[call {}] {} {} {}",
            call.call_id, call.state, call.direction, call.remote_uri
        ),
        Event::Trace(trace) => {
            let arrow = match trace.direction {
                TraceDirection::Sent => "->",
                TraceDirection::Received => "<-",
            };
            let first_line = trace.message.lines().next().unwrap_or_default();
            format!(
                "[sip {}] {} {} {} ({} bytes) {}",
                trace.timestamp.format("%H:%M:%S%.3f"),
                trace.transport,
                arrow,
                trace.remote_addr,
                trace.message.len(),
                first_line
            )
        }
        Event::Digit(digit) => format!("[call {}] dtmf {}", digit.call_id, digit.digit),
    }
}

pub fn render_account(account: &AccountInfo) -> String {
    match &account.reason {
        Some(reason) => format!("{:<16} {} ({})", account.id, account.state, reason),
        None => format!("{:<16} {}", account.id, account.state),
    }
}

pub fn render_call(call: &CallInfo) -> String {
    format!(
        "{:>4}  {:<12} {:<8} {}  since {}",
        call.call_id.as_str(),
        call.state.as_str(),
        call.direction.as_str(),
        call.remote_uri,
        call.created_at.format("%H:%M:%S")
    )
}
