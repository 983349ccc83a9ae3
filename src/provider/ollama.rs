use super::{ChatChunk, ChatMessage, ChatRequest, ChatStream, Provider};
use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub const DEFAULT_HOST: &str = "http://127.0.0.1:11434";

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    http: reqwest::Client,
    api_base: Url,
}

impl OllamaProvider {
    /// `host` may omit the scheme (`localhost:11434`), as `OLLAMA_HOST` often does.
    pub fn new(http: reqwest::Client, host: &str) -> anyhow::Result<Self> {
        let host = host.trim();
        let mut base = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_base =
            Url::parse(&base).with_context(|| format!("invalid Ollama host: {host}"))?;
        Ok(Self { http, api_base })
    }

    fn chat_url(&self) -> anyhow::Result<Url> {
        Ok(self.api_base.join("api/chat")?)
    }

    fn headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(ACCEPT, HeaderValue::from_static("application/x-ndjson"));
        h
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ChatStream>> + Send>>
    {
        let http = self.http.clone();
        let url = self.chat_url();

        Box::pin(async move {
            let url = url?;
            let body = ChatBody {
                model: req.model,
                messages: req.messages,
                stream: true,
            };

            tracing::debug!(%url, model = %body.model, "opening Ollama chat stream");
            let resp = http
                .post(url.clone())
                .headers(Self::headers())
                .json(&body)
                .send()
                .await
                .with_context(|| format!("failed to reach Ollama at {url}"))?;

            let status = resp.status();
            if !status.is_success() {
                let detail = match resp.text().await {
                    Ok(text) => error_text(&text),
                    Err(e) => format!("(failed to read error body: {e})"),
                };
                return Err(anyhow!("Ollama API error: HTTP {status}: {detail}"));
            }

            let (tx, rx) = mpsc::channel::<anyhow::Result<ChatChunk>>(64);

            tokio::spawn(async move {
                let mut stream = resp.bytes_stream();
                let mut parser = LineParser::new();

                loop {
                    // Dropping the receiver releases the connection without
                    // waiting for the backend's next byte.
                    let item = tokio::select! {
                        _ = tx.closed() => return,
                        item = stream.next() => item,
                    };

                    let ended = item.is_none();
                    let lines = match item {
                        Some(Ok(bytes)) => parser.push(&bytes),
                        Some(Err(e)) => {
                            let _ = tx.send(Err(anyhow!(e).context("network stream error"))).await;
                            return;
                        }
                        None => match parser.finish() {
                            Some(last) => vec![last],
                            None => Vec::new(),
                        },
                    };

                    for line in lines {
                        match line.and_then(|l| decode_line(&l)) {
                            Ok(Line::Fragment(text)) => {
                                if tx.send(Ok(ChatChunk { text })).await.is_err() {
                                    return;
                                }
                            }
                            Ok(Line::Empty) => {}
                            Ok(Line::Done) => return,
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }

                    if ended {
                        return;
                    }
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as ChatStream)
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatBody {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponseLine {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Fragment(String),
    Empty,
    Done,
}

fn decode_line(line: &str) -> anyhow::Result<Line> {
    let parsed: ChatResponseLine =
        serde_json::from_str(line).context("failed to parse Ollama response line")?;

    if let Some(err) = parsed.error {
        return Err(anyhow!("Ollama error: {err}"));
    }

    let text = parsed.message.map(|m| m.content).unwrap_or_default();
    if !text.is_empty() {
        // The final line normally has empty content, but don't drop it if not.
        return Ok(Line::Fragment(text));
    }
    if parsed.done {
        Ok(Line::Done)
    } else {
        Ok(Line::Empty)
    }
}

/// Pull the message out of an `{"error": "..."}` body, else return it as-is.
fn error_text(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(b) => b.error,
        Err(_) => body.trim().to_string(),
    }
}

/// Incremental newline-delimited JSON splitter.
///
/// - Buffers partial lines across network chunks
/// - Strips `\r\n` endings and skips blank lines
/// - `finish` yields a trailing line that had no newline
struct LineParser {
    buf: Vec<u8>,
}

impl LineParser {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<anyhow::Result<String>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            if let Some(l) = Self::decode(line) {
                out.push(l);
            }
        }

        out
    }

    fn finish(&mut self) -> Option<anyhow::Result<String>> {
        let line = std::mem::take(&mut self.buf);
        Self::decode(line)
    }

    fn decode(line: Vec<u8>) -> Option<anyhow::Result<String>> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(String::from_utf8(line).map_err(|e| anyhow!(e).context("response line is not valid UTF-8")))
    }
}
