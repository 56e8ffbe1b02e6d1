//! Line-oriented console driver
//!
//! Reads operator commands from an input, renders engine events to an
//! output, and on `quit`, end of input or shutdown stops the engine and drains
//! the event stream until it closes.
//!
//! The engine's stream is drained on a task of its own. Commands such as
//! `hangup` wait for the engine to publish a state event, so the task running
//! them must never be the one the engine is waiting on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use siptty_engine_core::{Engine, EngineResult, Event, EventStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, HELP};
use crate::render::{render_account, render_call, render_event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Console bound to one engine and one output
pub struct Console<W> {
    engine: Engine,
    output: W,
    /// Shared with the drain task, which discards hidden traces
    show_traces: Arc<AtomicBool>,
}

impl<W> Console<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(engine: Engine, output: W) -> Self {
        Self {
            engine,
            output,
            show_traces: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start with SIP trace rendering on or off (off by default)
    pub fn with_traces(self, show: bool) -> Self {
        self.show_traces.store(show, Ordering::Relaxed);
        self
    }

    /// Run until `quit`, end of input, `shutdown` or the stream closing.
    ///
    /// The engine is always stopped and the stream drained before returning.
    /// Returns the output so callers can inspect or reuse it.
    pub async fn run<R>(
        mut self,
        stream: EventStream,
        input: R,
        shutdown: CancellationToken,
    ) -> anyhow::Result<W>
    where
        R: AsyncBufRead + Unpin,
    {
        let (tx, mut events) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_events(stream, tx, Arc::clone(&self.show_traces)));

        let mut lines = input.lines();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("console shutting down");
                    break;
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("reading console input")? else {
                        tracing::debug!("console input closed");
                        break;
                    };
                    if self.handle_line(&line).await? == Flow::Quit {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.show(&event).await?;
                }
            }
        }

        self.engine.stop().await;
        while let Some(event) = events.recv().await {
            self.show(&event).await?;
        }
        if let Err(e) = drain.await {
            tracing::warn!(error = %e, "event drain task failed");
        }
        self.write_line("stopped").await?;
        self.output.flush().await.context("flushing console output")?;
        Ok(self.output)
    }

    async fn handle_line(&mut self, line: &str) -> anyhow::Result<Flow> {
        if line.trim().is_empty() {
            return Ok(Flow::Continue);
        }
        match line.parse::<Command>() {
            Ok(command) => self.execute(command).await,
            Err(e) => {
                self.write_line(&format!("error: {e}")).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn execute(&mut self, command: Command) -> anyhow::Result<Flow> {
        tracing::debug!(%command, "executing console command");
        let engine = self.engine.clone();

        let result = match command {
            Command::Accounts => {
                for account in engine.account_infos() {
                    self.write_line(&render_account(&account)).await?;
                }
                Ok(())
            }
            Command::Calls => {
                let calls = engine.calls().await;
                if calls.is_empty() {
                    self.write_line("no calls").await?;
                }
                for call in calls {
                    self.write_line(&render_call(&call)).await?;
                }
                Ok(())
            }
            Command::Dial { account, uri } => engine.dial(&account, &uri),
            Command::Answer { call_id } => engine.answer(&call_id),
            Command::Reject { call_id } => engine.reject(&call_id),
            Command::Hangup { call_id } => engine.hangup(&call_id).await,
            Command::Dtmf { call_id, digits } => send_digits(&engine, &call_id, &digits).await,
            Command::Transfer { call_id, uri } => engine.transfer(&call_id, &uri).await,
            Command::Play { call_id, path } => engine.play_audio(&call_id, &path).await,
            Command::Traces(show) => {
                self.show_traces.store(show, Ordering::Relaxed);
                self.write_line(if show { "traces on" } else { "traces off" }).await?;
                Ok(())
            }
            Command::Help => {
                self.write_line(HELP).await?;
                Ok(())
            }
            Command::Quit => return Ok(Flow::Quit),
        };

        if let Err(e) = result {
            self.write_line(&format!("error: {e}")).await?;
        }
        Ok(Flow::Continue)
    }

    async fn show(&mut self, event: &Event) -> anyhow::Result<()> {
        if event.is_trace() && !self.show_traces.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.write_line(&render_event(event)).await
    }

    async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.output
            .write_all(line.as_bytes())
            .await
            .context("writing console output")?;
        self.output.write_all(b"\n").await.context("writing console output")?;
        self.output.flush().await.context("flushing console output")
    }
}

/// Move events off the engine's stream as fast as they arrive.
///
/// Hidden traces are discarded here; everything else is queued for the
/// console without bound so the engine never waits on the operator.
async fn drain_events(
    mut events: EventStream,
    tx: mpsc::UnboundedSender<Event>,
    show_traces: Arc<AtomicBool>,
) {
    while let Some(event) = events.next().await {
        if event.is_trace() && !show_traces.load(Ordering::Relaxed) {
            continue;
        }
        if tx.send(event).is_err() {
            break;
        }
    }
}

/// Send each digit in turn, stopping at the first failure
async fn send_digits(engine: &Engine, call_id: &str, digits: &str) -> EngineResult<()> {
    for digit in digits.chars() {
        engine.send_dtmf(call_id, digit).await?;
    }
    Ok(())
}
