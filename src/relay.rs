//! Prompt relay: one prompt in, one streamed response out to a display sink.
//!
//! The relay owns the [`Transcript`] for the duration of a request and hands
//! the whole text to the sink after every fragment. The sink never reads it
//! back. A [`Session`] wraps the relay with a single-flight guard.

use crate::provider::{ChatRequest, Provider};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

pub const CHAT_RESPONSE: &str = "chatResponse";

/// A `(command, text)` pair for the display surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelMessage {
    pub command: String,
    pub text: String,
}

impl PanelMessage {
    pub fn new(command: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            text: text.into(),
        }
    }

    pub fn chat_response(text: impl Into<String>) -> Self {
        Self::new(CHAT_RESPONSE, text)
    }
}

/// Anything that can render panel messages.
pub trait DisplaySink {
    fn post(&mut self, msg: PanelMessage);
}

impl<F: FnMut(PanelMessage)> DisplaySink for F {
    fn post(&mut self, msg: PanelMessage) {
        self(msg)
    }
}

/// Append-only accumulation of fragments for one prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript(String);

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        self.0.push_str(fragment);
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed(Transcript),
    /// Display text already posted, starting with `Error: ` in replace mode.
    Failed(String),
    /// Partial transcript at the moment of cancellation. Nothing is posted.
    Cancelled(Transcript),
}

impl RelayOutcome {
    pub fn state(&self) -> RelayState {
        match self {
            RelayOutcome::Completed(_) => RelayState::Completed,
            RelayOutcome::Failed(_) => RelayState::Failed,
            RelayOutcome::Cancelled(_) => RelayState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// How a failure is shown relative to the partial transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDisplay {
    /// `Error: ...` replaces whatever was shown.
    #[default]
    Replace,
    /// `Error: ...` is appended after the partial transcript.
    Append,
}

impl ErrorDisplay {
    fn render(self, transcript: &Transcript, err: &anyhow::Error) -> String {
        let msg = format!("Error: {err:#}");
        match self {
            ErrorDisplay::Replace => msg,
            ErrorDisplay::Append if transcript.is_empty() => msg,
            ErrorDisplay::Append => format!("{}\n\n{msg}", transcript.as_str()),
        }
    }
}

/// Stream one request into `sink`.
///
/// Every fragment is appended to a fresh transcript and the full transcript
/// is posted. Any failure posts exactly one error message and stops. When
/// `cancel` fires the backend stream is dropped and nothing more is posted.
pub async fn relay<S>(
    provider: &(dyn Provider + Send + Sync),
    req: ChatRequest,
    sink: &mut S,
    cancel: &CancellationToken,
    on_error: ErrorDisplay,
) -> RelayOutcome
where
    S: DisplaySink + ?Sized,
{
    let model = req.model.clone();
    let mut transcript = Transcript::new();
    tracing::debug!(provider = provider.name(), %model, "relay started");

    // Cancellation is checked first so a ready fragment never wins the race.
    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(%model, "relay cancelled before the stream opened");
            return RelayOutcome::Cancelled(transcript);
        }
        r = provider.stream_chat(req) => r,
    };

    let mut stream = match started {
        Ok(s) => s,
        Err(e) => return fail(sink, &transcript, e, on_error, &model, 0),
    };

    let mut fragments = 0usize;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(%model, fragments, chars = transcript.len(), "relay cancelled");
                return RelayOutcome::Cancelled(transcript);
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(chunk)) => {
                fragments += 1;
                transcript.push(&chunk.text);
                sink.post(PanelMessage::chat_response(transcript.as_str()));
            }
            Some(Err(e)) => return fail(sink, &transcript, e, on_error, &model, fragments),
            None => break,
        }
    }

    tracing::info!(%model, fragments, chars = transcript.len(), "relay completed");
    RelayOutcome::Completed(transcript)
}

fn fail<S: DisplaySink + ?Sized>(
    sink: &mut S,
    transcript: &Transcript,
    err: anyhow::Error,
    on_error: ErrorDisplay,
    model: &str,
    fragments: usize,
) -> RelayOutcome {
    tracing::warn!(%model, fragments, error = %format!("{err:#}"), "relay failed");
    let text = on_error.render(transcript, &err);
    sink.post(PanelMessage::chat_response(text.clone()));
    RelayOutcome::Failed(text)
}

/// What a session does with a prompt that arrives mid-stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Refuse the new prompt; the running one continues.
    #[default]
    Reject,
    /// Cancel the running prompt and start the new one.
    Supersede,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a response is already streaming; wait for it or cancel it first")]
    Busy,
    #[error("prompt is empty")]
    EmptyPrompt,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub busy_policy: BusyPolicy,
    pub on_error: ErrorDisplay,
}

struct Flight {
    id: u64,
    cancel: CancellationToken,
}

struct Slot {
    state: RelayState,
    flight: Option<Flight>,
    next_id: u64,
}

/// Single-flight owner of relays for one display surface.
pub struct Session {
    provider: Arc<dyn Provider + Send + Sync>,
    opts: SessionOptions,
    slot: Arc<Mutex<Slot>>,
}

impl Session {
    pub fn new(provider: Arc<dyn Provider + Send + Sync>, opts: SessionOptions) -> Self {
        Self {
            provider,
            opts,
            slot: Arc::new(Mutex::new(Slot {
                state: RelayState::Idle,
                flight: None,
                next_id: 0,
            })),
        }
    }

    pub fn model(&self) -> &str {
        &self.opts.model
    }

    pub fn state(&self) -> RelayState {
        lock(&self.slot).state
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.slot).flight.is_some()
    }

    /// Cancel the in-flight relay, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match lock(&self.slot).flight.as_ref() {
            Some(f) => {
                f.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Relay `prompt` to `sink` under the session's busy policy.
    pub async fn submit<S>(&self, prompt: &str, sink: &mut S) -> Result<RelayOutcome, SessionError>
    where
        S: DisplaySink + ?Sized,
    {
        let (guard, req) = self.begin(prompt)?;
        let outcome = relay(self.provider.as_ref(), req, sink, &guard.cancel, self.opts.on_error).await;
        guard.finish(outcome.state());
        Ok(outcome)
    }

    /// Claim the flight slot now and return the relay as a detached future.
    ///
    /// Unlike [`Session::submit`], the busy check happens before this returns,
    /// so prompts spawned in order are admitted in order.
    pub fn start<S>(
        &self,
        prompt: &str,
        mut sink: S,
    ) -> Result<impl std::future::Future<Output = RelayOutcome> + Send + 'static, SessionError>
    where
        S: DisplaySink + Send + 'static,
    {
        let (guard, req) = self.begin(prompt)?;
        let provider = self.provider.clone();
        let on_error = self.opts.on_error;

        Ok(async move {
            let outcome = relay(provider.as_ref(), req, &mut sink, &guard.cancel, on_error).await;
            guard.finish(outcome.state());
            outcome
        })
    }

    fn begin(&self, prompt: &str) -> Result<(FlightGuard, ChatRequest), SessionError> {
        if prompt.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let mut slot = lock(&self.slot);
        if let Some(running) = slot.flight.take() {
            match self.opts.busy_policy {
                BusyPolicy::Reject => {
                    slot.flight = Some(running);
                    tracing::debug!("prompt rejected: relay in flight");
                    return Err(SessionError::Busy);
                }
                BusyPolicy::Supersede => {
                    tracing::debug!(superseded = running.id, "cancelling in-flight relay");
                    running.cancel.cancel();
                }
            }
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let cancel = CancellationToken::new();
        slot.flight = Some(Flight {
            id,
            cancel: cancel.clone(),
        });
        slot.state = RelayState::Streaming;

        let guard = FlightGuard {
            slot: self.slot.clone(),
            id,
            cancel,
            done: false,
        };
        Ok((guard, ChatRequest::user_prompt(self.opts.model.clone(), prompt)))
    }
}

fn lock(slot: &Mutex<Slot>) -> std::sync::MutexGuard<'_, Slot> {
    // Slot updates never panic midway, so a poisoned lock is still consistent.
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the flight slot when the relay ends or its future is dropped.
struct FlightGuard {
    slot: Arc<Mutex<Slot>>,
    id: u64,
    cancel: CancellationToken,
    done: bool,
}

impl FlightGuard {
    fn finish(mut self, state: RelayState) {
        self.release(state);
        self.done = true;
    }

    fn release(&self, state: RelayState) {
        let mut slot = lock(&self.slot);
        // A superseding prompt owns the slot now.
        if slot.flight.as_ref().is_some_and(|f| f.id == self.id) {
            slot.flight = None;
            slot.state = state;
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
            self.release(RelayState::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::StubProvider;
    use crate::provider::{ChatChunk, ChatStream};
    use anyhow::anyhow;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn texts(msgs: &[PanelMessage]) -> Vec<&str> {
        msgs.iter().map(|m| m.text.as_str()).collect()
    }

    async fn run(provider: StubProvider, on_error: ErrorDisplay) -> (RelayOutcome, Vec<PanelMessage>) {
        let mut seen = Vec::new();
        let outcome = relay(
            &provider,
            ChatRequest::user_prompt("deepseek-r1", "prompt"),
            &mut |m: PanelMessage| seen.push(m),
            &CancellationToken::new(),
            on_error,
        )
        .await;
        (outcome, seen)
    }

    fn session(provider: impl Provider + Send + Sync + 'static, busy_policy: BusyPolicy) -> Arc<Session> {
        Arc::new(Session::new(
            Arc::new(provider),
            SessionOptions {
                model: "deepseek-r1".to_string(),
                busy_policy,
                on_error: ErrorDisplay::Replace,
            },
        ))
    }

    /// Provider whose fragments are fed by the test, one request at a time.
    struct ChannelProvider {
        streams: Mutex<Vec<mpsc::Receiver<anyhow::Result<ChatChunk>>>>,
    }

    impl ChannelProvider {
        fn new(n: usize) -> (Self, Vec<mpsc::Sender<anyhow::Result<ChatChunk>>>) {
            let (txs, rxs): (Vec<_>, Vec<_>) = (0..n).map(|_| mpsc::channel(8)).unzip();
            let mut rxs = rxs;
            rxs.reverse();
            (Self { streams: Mutex::new(rxs) }, txs)
        }
    }

    impl Provider for ChannelProvider {
        fn name(&self) -> &'static str {
            "channel"
        }

        fn stream_chat(
            &self,
            _req: ChatRequest,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ChatStream>> + Send>>
        {
            let rx = self.streams.lock().unwrap().pop();
            Box::pin(async move {
                let rx = rx.ok_or_else(|| anyhow!("no more scripted streams"))?;
                Ok(Box::pin(ReceiverStream::new(rx)) as ChatStream)
            })
        }
    }

    fn chunk(text: &str) -> anyhow::Result<ChatChunk> {
        Ok(ChatChunk { text: text.to_string() })
    }

    /// Sink that forwards to a channel so tests can await individual updates.
    fn channel_sink() -> (impl DisplaySink + Send, mpsc::UnboundedReceiver<PanelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |m: PanelMessage| { let _ = tx.send(m); }, rx)
    }

    #[tokio::test]
    async fn prefix_accumulation() {
        let (outcome, seen) = run(StubProvider::scripted(["He", "llo ", "there"]), ErrorDisplay::Replace).await;
        assert_eq!(texts(&seen), vec!["He", "Hello ", "Hello there"]);
        assert!(seen.iter().all(|m| m.command == CHAT_RESPONSE));
        assert_eq!(outcome, RelayOutcome::Completed(Transcript("Hello there".into())));
    }

    #[tokio::test]
    async fn single_fragment() {
        let (outcome, seen) = run(StubProvider::scripted(["4"]), ErrorDisplay::Replace).await;
        assert_eq!(texts(&seen), vec!["4"]);
        assert_eq!(outcome.state(), RelayState::Completed);
    }

    #[tokio::test]
    async fn empty_stream_posts_nothing() {
        let (outcome, seen) = run(StubProvider::scripted(Vec::<String>::new()), ErrorDisplay::Replace).await;
        assert!(seen.is_empty());
        assert_eq!(outcome, RelayOutcome::Completed(Transcript::new()));
    }

    #[tokio::test]
    async fn failure_after_k_fragments() {
        for k in 0..3 {
            let provider = StubProvider::scripted(["a", "b", "c"]).failing_after(k, "connection reset");
            let (outcome, seen) = run(provider, ErrorDisplay::Replace).await;

            assert_eq!(seen.len(), k + 1, "k = {k}");
            let last = &seen.last().unwrap().text;
            assert!(last.starts_with("Error: "), "{last}");
            assert!(last.contains("connection reset"));
            assert_eq!(outcome, RelayOutcome::Failed(last.clone()));
        }
    }

    #[tokio::test]
    async fn connection_refused_posts_one_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let provider =
            crate::provider::ollama::OllamaProvider::new(reqwest::Client::new(), &format!("127.0.0.1:{port}")).unwrap();
        let mut seen = Vec::new();
        let outcome = relay(
            &provider,
            ChatRequest::user_prompt("deepseek-r1", "2+2"),
            &mut |m: PanelMessage| seen.push(m),
            &CancellationToken::new(),
            ErrorDisplay::Replace,
        )
        .await;

        assert_eq!(seen.len(), 1);
        assert!(seen[0].text.starts_with("Error: "), "{}", seen[0].text);
        assert_eq!(outcome.state(), RelayState::Failed);
    }

    /// Cancels the caller's token while opening, then hands back a stream
    /// that already holds a fragment.
    struct CancelOnOpen(CancellationToken);

    impl Provider for CancelOnOpen {
        fn name(&self) -> &'static str {
            "cancel-on-open"
        }

        fn stream_chat(
            &self,
            _req: ChatRequest,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ChatStream>> + Send>>
        {
            let cancel = self.0.clone();
            Box::pin(async move {
                let (tx, rx) = mpsc::channel(1);
                tx.send(chunk("late")).await.map_err(|_| anyhow!("receiver gone"))?;
                cancel.cancel();
                Ok(Box::pin(ReceiverStream::new(rx)) as ChatStream)
            })
        }
    }

    #[tokio::test]
    async fn cancel_wins_over_queued_fragment() {
        for _ in 0..100 {
            let cancel = CancellationToken::new();
            let provider = CancelOnOpen(cancel.clone());
            let mut seen = Vec::new();
            let outcome = relay(
                &provider,
                ChatRequest::user_prompt("deepseek-r1", "x"),
                &mut |m: PanelMessage| seen.push(m),
                &cancel,
                ErrorDisplay::Replace,
            )
            .await;

            assert!(seen.is_empty(), "posted after cancel: {seen:?}");
            assert_eq!(outcome, RelayOutcome::Cancelled(Transcript::new()));
        }
    }

    #[tokio::test]
    async fn append_mode_keeps_partial_output() {
        let provider = StubProvider::scripted(["par", "tial"]).failing_after(2, "boom");
        let (outcome, seen) = run(provider, ErrorDisplay::Append).await;
        assert_eq!(texts(&seen), vec!["par", "partial", "partial\n\nError: boom"]);
        assert_eq!(outcome.state(), RelayState::Failed);

        let (_, seen) = run(StubProvider::new().failing_after(0, "refused"), ErrorDisplay::Append).await;
        assert_eq!(texts(&seen), vec!["Error: refused"]);
    }

    #[tokio::test]
    async fn sequential_runs_are_identical() {
        let s = session(StubProvider::scripted(["x", "y"]), BusyPolicy::Reject);
        let mut first = Vec::new();
        let mut second = Vec::new();
        let a = s.submit("same", &mut |m: PanelMessage| first.push(m)).await.unwrap();
        let b = s.submit("same", &mut |m: PanelMessage| second.push(m)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(first, second);
        assert_eq!(s.state(), RelayState::Completed);
        assert!(!s.is_streaming());
    }

    #[tokio::test]
    async fn session_recovers_after_failure() {
        let s = session(StubProvider::new().failing_after(0, "refused"), BusyPolicy::Reject);
        let mut seen = Vec::new();
        let out = s.submit("hi", &mut |m: PanelMessage| seen.push(m)).await.unwrap();
        assert_eq!(out.state(), RelayState::Failed);
        assert_eq!(s.state(), RelayState::Failed);
        assert!(!s.is_streaming());
        assert!(s.submit("again", &mut |m: PanelMessage| seen.push(m)).await.is_ok());
    }

    #[tokio::test]
    async fn empty_prompt_rejected() {
        let s = session(StubProvider::scripted(["x"]), BusyPolicy::Reject);
        let err = s.submit("  \n", &mut |_: PanelMessage| {}).await.unwrap_err();
        assert_eq!(err, SessionError::EmptyPrompt);
        assert_eq!(s.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn reject_policy_keeps_first_stream() {
        let (provider, txs) = ChannelProvider::new(1);
        let s = session(provider, BusyPolicy::Reject);

        let (mut sink, mut updates) = channel_sink();
        let first = tokio::spawn({
            let s = s.clone();
            async move { s.submit("one", &mut sink).await }
        });

        txs[0].send(chunk("a")).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().text, "a");
        assert!(s.is_streaming());

        let err = s.submit("two", &mut |_: PanelMessage| {}).await.unwrap_err();
        assert_eq!(err, SessionError::Busy);

        txs[0].send(chunk("b")).await.unwrap();
        drop(txs);
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, RelayOutcome::Completed(Transcript("ab".into())));
        assert_eq!(updates.recv().await.unwrap().text, "ab");
    }

    #[tokio::test]
    async fn start_claims_slot_before_polling() {
        let (provider, txs) = ChannelProvider::new(1);
        let s = session(provider, BusyPolicy::Reject);

        let (sink, mut updates) = channel_sink();
        let fut = s.start("one", sink).unwrap();
        assert!(s.is_streaming());
        assert_eq!(s.start("two", |_: PanelMessage| {}).err(), Some(SessionError::Busy));

        let task = tokio::spawn(fut);
        txs[0].send(chunk("done")).await.unwrap();
        drop(txs);
        assert_eq!(task.await.unwrap(), RelayOutcome::Completed(Transcript("done".into())));
        assert_eq!(updates.recv().await.unwrap().text, "done");
    }

    #[tokio::test]
    async fn supersede_policy_cancels_first_stream() {
        let (provider, txs) = ChannelProvider::new(2);
        let s = session(provider, BusyPolicy::Supersede);

        let (mut sink, mut updates) = channel_sink();
        let first = tokio::spawn({
            let s = s.clone();
            async move { s.submit("one", &mut sink).await }
        });
        txs[0].send(chunk("old")).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().text, "old");

        let (mut sink2, mut updates2) = channel_sink();
        let second = tokio::spawn({
            let s = s.clone();
            async move { s.submit("two", &mut sink2).await }
        });

        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, RelayOutcome::Cancelled(Transcript("old".into())));
        // Cancelled relay posts nothing further and the old sink is gone.
        assert!(updates.recv().await.is_none());

        txs[1].send(chunk("new")).await.unwrap();
        assert_eq!(updates2.recv().await.unwrap().text, "new");
        drop(txs);
        let outcome = second.await.unwrap().unwrap();
        assert_eq!(outcome, RelayOutcome::Completed(Transcript("new".into())));
        assert_eq!(s.state(), RelayState::Completed);
    }

    #[tokio::test]
    async fn explicit_cancel() {
        let (provider, txs) = ChannelProvider::new(1);
        let s = session(provider, BusyPolicy::Reject);
        assert!(!s.cancel());

        let (mut sink, mut updates) = channel_sink();
        let task = tokio::spawn({
            let s = s.clone();
            async move { s.submit("one", &mut sink).await }
        });
        txs[0].send(chunk("half")).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().text, "half");

        assert!(s.cancel());
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.state(), RelayState::Cancelled);
        assert_eq!(s.state(), RelayState::Cancelled);
        assert!(!s.is_streaming());
        // The backend side sees the stream dropped.
        assert!(txs[0].is_closed());
    }

    #[tokio::test]
    async fn dropped_submit_frees_the_slot() {
        let (provider, _txs) = ChannelProvider::new(1);
        let s = session(provider, BusyPolicy::Reject);

        let task = tokio::spawn({
            let s = s.clone();
            async move { s.submit("one", &mut |_: PanelMessage| {}).await }
        });
        while !s.is_streaming() {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        assert!(!s.is_streaming());
        assert_eq!(s.state(), RelayState::Cancelled);
    }
}
