//! Line-oriented operator console for the daemon.
//!
//! ```text
//! start [pid] [samples_per_second]
//! stop
//! status
//! quit
//! ```
//!
//! While a stop is waiting for producers only `status` and `quit` are
//! served; `quit` cuts the wait short.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use captureproto::CaptureOptions;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::lifecycle::{CaptureLifecycle, StopOutcome};
use crate::sink::CountingSink;

pub const DEFAULT_SAMPLES_PER_SECOND: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Start { pid: u32, samples_per_second: f64 },
    Stop,
    Status,
    Quit,
}

impl FromStr for OperatorCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };

        let command = match verb {
            "start" => {
                let pid = match words.next() {
                    Some(pid) => pid.parse().with_context(|| format!("bad pid '{}'", pid))?,
                    None => 0,
                };
                let samples_per_second = match words.next() {
                    Some(rate) => rate
                        .parse()
                        .with_context(|| format!("bad samples_per_second '{}'", rate))?,
                    None => DEFAULT_SAMPLES_PER_SECOND,
                };
                OperatorCommand::Start {
                    pid,
                    samples_per_second,
                }
            }
            "stop" => OperatorCommand::Stop,
            "status" => OperatorCommand::Status,
            "quit" | "exit" => OperatorCommand::Quit,
            other => bail!("unknown command '{}'", other),
        };

        if let Some(extra) = words.next() {
            bail!("unexpected argument '{}'", extra);
        }
        Ok(command)
    }
}

/// Read commands from `input` until `quit` or end of input.
///
/// `quit` requests shutdown; end of input just stops reading.
pub async fn run_operator_loop<R, W>(
    lifecycle: Arc<CaptureLifecycle>,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut capture_sink: Option<Arc<CountingSink>> = None;

    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                reply(&mut output, &format!("error: {:#}", e)).await?;
                continue;
            }
            None => continue,
        };

        match command {
            OperatorCommand::Start {
                pid,
                samples_per_second,
            } => {
                let sink = Arc::new(CountingSink::new());
                let options = CaptureOptions::new(pid, samples_per_second);
                let text = match lifecycle.request_start(options, sink.clone()) {
                    Some(_) => {
                        capture_sink = Some(sink);
                        format!("phase: {}", lifecycle.phase())
                    }
                    None => format!("ignored, phase: {}", lifecycle.phase()),
                };
                reply(&mut output, &text).await?;
            }
            OperatorCommand::Stop => {
                let mut quit = false;
                let mut input_open = true;
                let stop = lifecycle.request_stop();
                tokio::pin!(stop);

                let outcome = loop {
                    tokio::select! {
                        biased;
                        outcome = &mut stop => break outcome,
                        line = lines.next_line(), if input_open => {
                            match line?.as_deref().map(parse_line) {
                                None => input_open = false,
                                Some(None) => {}
                                Some(Some(Ok(OperatorCommand::Status))) => {
                                    reply(&mut output, &status_line(&lifecycle)).await?;
                                }
                                Some(Some(Ok(OperatorCommand::Quit))) => {
                                    info!("quit requested by operator during stop");
                                    lifecycle.request_shutdown();
                                    quit = true;
                                    input_open = false;
                                }
                                Some(Some(Ok(_))) => {
                                    reply(&mut output, "error: stop in progress").await?;
                                }
                                Some(Some(Err(e))) => {
                                    reply(&mut output, &format!("error: {:#}", e)).await?;
                                }
                            }
                        }
                    }
                };

                let text = match capture_sink.take() {
                    Some(sink) if outcome != StopOutcome::NotRunning => {
                        sink.log_totals();
                        format!("stopped ({:?}), {} events", outcome, sink.total_events())
                    }
                    _ => format!("stopped ({:?})", outcome),
                };
                reply(&mut output, &text).await?;
                if quit {
                    reply(&mut output, "bye").await?;
                    return Ok(());
                }
            }
            OperatorCommand::Status => reply(&mut output, &status_line(&lifecycle)).await?,
            OperatorCommand::Quit => {
                info!("quit requested by operator");
                lifecycle.request_shutdown();
                reply(&mut output, "bye").await?;
                return Ok(());
            }
        }
    }

    Ok(())
}

/// `None` for blank lines.
fn parse_line(line: &str) -> Option<Result<OperatorCommand>> {
    if line.trim().is_empty() {
        None
    } else {
        Some(line.parse())
    }
}

fn status_line(lifecycle: &CaptureLifecycle) -> String {
    let state = lifecycle.snapshot();
    format!(
        "phase: {}, capture: {}, producers connected: {}, remaining: {}, shutdown: {}",
        state.phase,
        state.generation,
        lifecycle.connected_producers(),
        state.producers_remaining,
        state.shutdown_requested
    )
}

async fn reply<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
