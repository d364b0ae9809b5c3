//! HTTP Generation Backend
//!
//! One backend for every configured model: the model's protocol picks the
//! wire dialect, the backend owns the HTTP client, authentication, status
//! handling, stream framing and cancellation.

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::traits::{GenerationBackend, GenerationResponse, StreamingToken, TransportError};
use super::{anthropic, ollama, openai};
use crate::models::{ModelConfig, Protocol};
use crate::path::Turn;

/// Channel capacity between the reader task and the consumer
const TOKEN_BUFFER: usize = 100;

/// Connection establishment limit
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Health check limit
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP backend speaking the OpenAI, Anthropic and Ollama chat dialects
#[derive(Clone)]
pub struct HttpBackend {
    /// HTTP client
    http_client: reqwest::Client,
    /// Whole-request limit for non-streaming calls
    request_timeout: Duration,
}

impl HttpBackend {
    /// Create a backend with the given non-streaming request timeout
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http_client,
            request_timeout,
        })
    }

    /// API key to send, failing when the provider needs one and none is set
    fn credentials(model: &ModelConfig) -> Result<Option<&str>, TransportError> {
        match (model.api_key(), model.provider.requires_api_key()) {
            (None, true) => Err(TransportError::MissingCredentials {
                model: model.id.clone(),
            }),
            (key, _) => Ok(key),
        }
    }

    fn chat_request(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
        stream: bool,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let api_key = Self::credentials(model)?;

        let builder = match model.protocol() {
            Protocol::OpenAiChat => self
                .http_client
                .post(openai::chat_url(model))
                .json(&openai::request_body(turns, model, stream)),
            Protocol::AnthropicMessages => self
                .http_client
                .post(anthropic::chat_url(model))
                .header("anthropic-version", anthropic::API_VERSION)
                .json(&anthropic::request_body(turns, model, stream)),
            Protocol::OllamaChat => self
                .http_client
                .post(ollama::chat_url(model))
                .json(&ollama::request_body(turns, model, stream)),
        };

        Ok(match (api_key, model.protocol()) {
            (Some(key), Protocol::AnthropicMessages) => builder.header("x-api-key", key),
            (Some(key), _) => builder.bearer_auth(key),
            (None, _) => builder,
        })
    }

    async fn execute(
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        Ok(response)
    }

    async fn complete(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
    ) -> Result<GenerationResponse, TransportError> {
        let start = Instant::now();
        let builder = self
            .chat_request(turns, model, false)?
            .timeout(self.request_timeout);
        let response = Self::execute(builder).await?;
        let data: serde_json::Value = response.json().await?;

        let mut result = match model.protocol() {
            Protocol::OpenAiChat => openai::decode_response(data)?,
            Protocol::AnthropicMessages => anthropic::decode_response(data)?,
            Protocol::OllamaChat => ollama::decode_response(&data)?,
        };
        if result.model.is_empty() {
            result.model = model.model.clone();
        }
        result.duration_ms = Some(u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
        Ok(result)
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    async fn health_check(&self, model: &ModelConfig) -> bool {
        let url = match model.protocol() {
            Protocol::OpenAiChat => openai::health_url(model),
            Protocol::AnthropicMessages => anthropic::health_url(model),
            Protocol::OllamaChat => ollama::health_url(model),
        };
        let mut request = self.http_client.get(url).timeout(HEALTH_TIMEOUT);
        if let Some(key) = model.api_key() {
            request = match model.protocol() {
                Protocol::AnthropicMessages => request
                    .header("x-api-key", key)
                    .header("anthropic-version", anthropic::API_VERSION),
                _ => request.bearer_auth(key),
            };
        }
        request
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn send_streaming(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamingToken>, TransportError> {
        let (tx, rx) = mpsc::channel(TOKEN_BUFFER);

        if !model.stream {
            // Single payload, delivered as one chunk once the request finishes
            Self::credentials(model)?;
            let backend = self.clone();
            let turns = turns.to_vec();
            let model = model.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    result = backend.complete(&turns, &model) => result,
                };
                match result {
                    Ok(response) => {
                        if let Some(reasoning) = response.reasoning {
                            let _ = tx.send(StreamingToken::Reasoning(reasoning)).await;
                        }
                        if !response.content.is_empty() {
                            let _ = tx.send(StreamingToken::Content(response.content)).await;
                        }
                        let _ = tx.send(StreamingToken::Complete).await;
                    }
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e)).await;
                    }
                }
            });
            return Ok(rx);
        }

        let protocol = model.protocol();
        let request = self.chat_request(turns, model, true)?;
        debug!(model = %model.id, ?protocol, "Stream requested");
        tokio::spawn(stream_reply(request, protocol, tx, cancel));

        Ok(rx)
    }

    async fn send(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
    ) -> Result<GenerationResponse, TransportError> {
        self.complete(turns, model).await
    }
}

/// Open the response and pump it into `tx`
///
/// Cancellation is honoured while waiting for headers as well as while
/// reading the body.
async fn stream_reply(
    request: reqwest::RequestBuilder,
    protocol: Protocol,
    tx: mpsc::Sender<StreamingToken>,
    cancel: CancellationToken,
) {
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("Stream cancelled before response");
            return;
        }
        response = HttpBackend::execute(request) => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Stream failed to open");
            let _ = tx.send(StreamingToken::Error(e)).await;
            return;
        }
    };
    debug!(?protocol, "Stream opened");

    match protocol {
        Protocol::OllamaChat => pump_ndjson(response, tx, cancel).await,
        Protocol::OpenAiChat | Protocol::AnthropicMessages => {
            pump_sse(response, protocol, tx, cancel).await;
        }
    }
}

/// Forward tokens until a terminal one; false means stop reading
async fn forward(
    tx: &mpsc::Sender<StreamingToken>,
    decoded: Result<Vec<StreamingToken>, TransportError>,
    received_any: &mut bool,
) -> bool {
    match decoded {
        Ok(tokens) => {
            for token in tokens {
                let terminal = token.is_terminal();
                *received_any |= token.chunk().is_some();
                if tx.send(token).await.is_err() {
                    // Receiver dropped, stop streaming
                    return false;
                }
                if terminal {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            warn!(error = %e, "Stream reported an error");
            let _ = tx.send(StreamingToken::Error(e)).await;
            false
        }
    }
}

/// End-of-body without an explicit terminal event
async fn finish_unterminated(tx: &mpsc::Sender<StreamingToken>, received_any: bool) {
    let token = if received_any {
        StreamingToken::Complete
    } else {
        StreamingToken::Error(TransportError::Stream(
            "stream closed before any content".to_string(),
        ))
    };
    let _ = tx.send(token).await;
}

async fn pump_sse(
    response: reqwest::Response,
    protocol: Protocol,
    tx: mpsc::Sender<StreamingToken>,
    cancel: CancellationToken,
) {
    let mut events = response.bytes_stream().eventsource();
    let mut received_any = false;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Stream cancelled");
                return;
            }
            next = events.next() => next,
        };

        let decoded = match next {
            Some(Ok(event)) => match protocol {
                Protocol::AnthropicMessages => anthropic::decode_event(&event.event, &event.data),
                Protocol::OpenAiChat | Protocol::OllamaChat => openai::decode_event(&event.data),
            },
            Some(Err(e)) => Err(TransportError::Stream(e.to_string())),
            None => {
                finish_unterminated(&tx, received_any).await;
                return;
            }
        };

        if !forward(&tx, decoded, &mut received_any).await {
            return;
        }
    }
}

async fn pump_ndjson(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamingToken>,
    cancel: CancellationToken,
) {
    // Lines are decoded only once complete, so a character split across
    // network chunks survives
    let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
    let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());
    let mut received_any = false;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Stream cancelled");
                return;
            }
            next = lines.next() => next,
        };

        let decoded = match next {
            Some(Ok(line)) => ollama::decode_line(&line),
            Some(Err(e)) => Err(TransportError::Stream(e.to_string())),
            None => {
                finish_unterminated(&tx, received_any).await;
                return;
            }
        };

        if !forward(&tx, decoded, &mut received_any).await {
            return;
        }
    }
}
