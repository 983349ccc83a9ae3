//! Chat panel protocol over JSON lines.
//!
//! An editor spawns `deepcode bridge` and exchanges one JSON object per line:
//! `{"command":"chat","text":..}` and `{"command":"cancel"}` in,
//! `chatResponse`, `chatDone` and `chatRejected` messages out.

use crate::relay::{PanelMessage, RelayState, Session, SessionError};
use anyhow::Context;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub const CHAT_DONE: &str = "chatDone";
pub const CHAT_REJECTED: &str = "chatRejected";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
enum Inbound {
    Chat { text: String },
    Cancel,
}

pub async fn cmd_bridge(session: Arc<Session>) -> anyhow::Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run(session, stdin, tokio::io::stdout()).await
}

/// Serve requests from `input` until it closes, then wait for in-flight output.
pub async fn run<R, W>(session: Arc<Session>, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<PanelMessage>();
    let writer = tokio::spawn(write_messages(rx, output));

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("failed to read bridge input")? {
        if line.trim().is_empty() {
            continue;
        }

        let msg = match serde_json::from_str::<Inbound>(&line) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unrecognized bridge message");
                continue;
            }
        };

        match msg {
            Inbound::Chat { text } => dispatch(&session, &text, &tx),
            Inbound::Cancel => {
                if !session.cancel() {
                    tracing::debug!("cancel with nothing in flight");
                }
            }
        }
    }

    tracing::debug!("bridge input closed");
    // Relay tasks hold their own senders; the writer ends when the last one finishes.
    drop(tx);
    writer.await.context("bridge writer task panicked")?
}

fn dispatch(session: &Arc<Session>, prompt: &str, tx: &mpsc::UnboundedSender<PanelMessage>) {
    let sink_tx = tx.clone();
    let sink = move |m: PanelMessage| {
        let _ = sink_tx.send(m);
    };

    match session.start(prompt, sink) {
        Ok(relay) => {
            let done_tx = tx.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let outcome = relay.await;
                tracing::debug!(state = ?outcome.state(), "bridge relay finished");
                // A superseded relay ends while its replacement streams; the
                // panel's `chatDone` belongs to the replacement.
                if outcome.state() == RelayState::Cancelled && session.is_streaming() {
                    return;
                }
                let _ = done_tx.send(PanelMessage::new(CHAT_DONE, ""));
            });
        }
        Err(SessionError::EmptyPrompt) => {
            tracing::warn!("ignoring empty prompt");
        }
        Err(e @ SessionError::Busy) => {
            tracing::info!(model = session.model(), "prompt rejected while streaming");
            let _ = tx.send(PanelMessage::new(CHAT_REJECTED, e.to_string()));
        }
    }
}

async fn write_messages<W>(mut rx: mpsc::UnboundedReceiver<PanelMessage>, mut output: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let mut line = serde_json::to_vec(&msg).context("failed to encode panel message")?;
        line.push(b'\n');
        output.write_all(&line).await.context("failed to write bridge output")?;
        output.flush().await.context("failed to flush bridge output")?;
    }
    Ok(())
}
