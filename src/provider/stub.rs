use super::{ChatChunk, ChatRequest, ChatStream, Provider};
use anyhow::anyhow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Offline provider that drips a fixed script of fragments.
///
/// Without a script it echoes the last user message back in a few pieces.
#[derive(Debug, Default, Clone)]
pub struct StubProvider {
    script: Option<Vec<String>>,
    fail_after: Option<(usize, String)>,
    delay: Duration,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default().with_delay(Duration::from_millis(120))
    }

    /// Always stream exactly these fragments, with no delay between them.
    #[cfg(test)]
    pub fn scripted<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Some(fragments.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Fail with `message` once `after` fragments have been sent.
    #[cfg(test)]
    pub fn failing_after(mut self, after: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((after, message.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fragments_for(&self, req: &ChatRequest) -> Vec<String> {
        if let Some(script) = &self.script {
            return script.clone();
        }
        let prompt = req
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        vec![
            format!("[stub provider, model: {}]\n", req.model),
            "You said: ".to_string(),
            prompt.to_string(),
        ]
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ChatStream>> + Send>>
    {
        let fragments = self.fragments_for(&req);
        let fail_after = self.fail_after.clone();
        let delay = self.delay;

        Box::pin(async move {
            if let Some((0, msg)) = &fail_after {
                return Err(anyhow!("{msg}"));
            }

            let (tx, rx) = mpsc::channel::<anyhow::Result<ChatChunk>>(32);

            tokio::spawn(async move {
                for (sent, text) in fragments.into_iter().enumerate() {
                    if let Some((after, msg)) = &fail_after {
                        if sent == *after {
                            let _ = tx.send(Err(anyhow!("{msg}"))).await;
                            return;
                        }
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if tx.send(Ok(ChatChunk { text })).await.is_err() {
                        return;
                    }
                }
                // Scripts no longer than `after` fail once they run out.
                if let Some((_, msg)) = fail_after {
                    let _ = tx.send(Err(anyhow!("{msg}"))).await;
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as ChatStream)
        })
    }
}
