use crate::error::{ApiError, Error, Result, ServerError, TransportError};
use crate::http::limiter::{RateLimiter, RequestContext};
use crate::http::request::{Body, RequestOptions};
use crate::http::route::{Method, Route};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

pub const API_BASE: &str = "https://accord.chat/api/v9";
pub const API_VERSION: u8 = 9;

const AUDIT_REASON_HEADER: &str = "x-audit-log-reason";

/// REST client configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub token: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: API_BASE.to_owned(),
            token: String::new(),
            user_agent: format!("accord-rs/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Decoded REST reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    NoContent,
    Json(Value),
    Bytes(Vec<u8>),
}

impl Reply {
    pub fn into_json(self) -> Value {
        match self {
            Self::Json(value) => value,
            Self::NoContent => Value::Null,
            Self::Bytes(_) => Value::Null,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            _ => Vec::new(),
        }
    }
}

/// REST dispatcher for the Accord API.
///
/// Owns one `reqwest::Client`, the rate-limit middleware, and the bot
/// authorization header. All endpoint helpers funnel into [`Http::request`].
#[derive(Debug, Clone)]
pub struct Http {
    inner: reqwest::Client,
    cfg: Arc<HttpConfig>,
    limiter: Arc<RateLimiter>,
}

impl Http {
    pub fn new(cfg: HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&cfg.user_agent)
                .map_err(|e| TransportError::Other(format!("invalid user-agent: {e}")))?,
        );
        let inner = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(cfg.timeout)
            .build()
            .map_err(map_reqwest_error)?;

        Ok(Self {
            inner,
            cfg: Arc::new(cfg),
            limiter: Arc::new(RateLimiter::new()),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Dispatches one request through the rate-limit middleware.
    ///
    /// 429 responses never surface: the middleware has already folded the
    /// wait into the bucket table, so the request is retried after the
    /// pre-emptive sleep.
    pub async fn request(&self, route: &Route, options: RequestOptions) -> Result<Reply> {
        let ctx = RequestContext::new(route.rate_limit_key());
        let path = route.formatted_path()?;
        let url = match options.query.encoded() {
            Some(query) => format!("{}{}?{}", self.cfg.base_url, path, query),
            None => format!("{}{}", self.cfg.base_url, path),
        };

        loop {
            let lease = self.limiter.acquire(&ctx).await;
            let request = self.build(route.method(), &url, &options, &ctx)?;
            let response = request.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            self.limiter.observe(&ctx, status, response.headers());
            drop(lease);

            match status {
                204 | 304 => return Ok(Reply::NoContent),
                200..=299 => {
                    let bytes = response.bytes().await.map_err(map_reqwest_error)?;
                    if options.raw {
                        return Ok(Reply::Bytes(bytes.to_vec()));
                    }
                    if bytes.is_empty() {
                        return Ok(Reply::Json(Value::Null));
                    }
                    return Ok(Reply::Json(serde_json::from_slice(&bytes)?));
                }
                429 => {
                    debug!(trace = %ctx.trace, rl_key = %ctx.rl_key, "rate limited, retrying");
                }
                400..=499 => {
                    let bytes = response.bytes().await.unwrap_or_default();
                    return Err(parse_api_error(status, &bytes, &ctx.trace));
                }
                _ => {
                    return Err(ServerError {
                        status,
                        trace: ctx.trace.clone(),
                    }
                    .into());
                }
            }
        }
    }

    /// [`Http::request`] plus JSON decoding into `T`.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        route: &Route,
        options: RequestOptions,
    ) -> Result<T> {
        let reply = self.request(route, options).await?;
        Ok(serde_json::from_value(reply.into_json())?)
    }

    fn build(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
        ctx: &RequestContext,
    ) -> Result<reqwest::RequestBuilder> {
        let method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .inner
            .request(method, url)
            .header(AUTHORIZATION, bot_authorization(&self.cfg.token));

        if let Some(reason) = &options.reason {
            builder = builder.header(AUDIT_REASON_HEADER, reason);
        }

        match &options.body {
            Body::None => {}
            Body::Json(value) => {
                builder = builder
                    .header(CONTENT_TYPE, "application/json")
                    .json(value);
            }
            Body::Multipart(mp) => {
                let mut form = reqwest::multipart::Form::new();
                if let Some(payload) = &mp.payload_json {
                    form = form.text("payload_json", serde_json::to_string(payload)?);
                }
                for (index, file) in mp.files.iter().enumerate() {
                    let mut part = reqwest::multipart::Part::bytes(file.bytes.clone())
                        .file_name(file.filename.clone());
                    if let Some(mime) = &file.content_type {
                        part = part.mime_str(mime).map_err(map_reqwest_error)?;
                    }
                    form = form.part(index.to_string(), part);
                }
                builder = builder.multipart(form);
            }
        }

        debug!(trace = %ctx.trace, rl_key = %ctx.rl_key, url, "dispatching request");
        Ok(builder)
    }
}

/// The `Bot ` prefix is enforced even when the caller already included it.
fn bot_authorization(token: &str) -> String {
    if token.starts_with("Bot ") {
        token.to_owned()
    } else {
        format!("Bot {token}")
    }
}

fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Transport(TransportError::Timeout)
    } else if err.is_request() {
        Error::Transport(TransportError::Canceled)
    } else {
        Error::Transport(TransportError::Other(err.to_string()))
    }
}

fn parse_api_error(status: u16, bytes: &[u8], trace: &str) -> Error {
    #[derive(serde::Deserialize)]
    struct Envelope {
        code: Option<i64>,
        message: Option<String>,
    }
    let envelope: Option<Envelope> = serde_json::from_slice(bytes).ok();
    let message = envelope
        .as_ref()
        .and_then(|v| v.message.clone())
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).to_string());
    let code = envelope.and_then(|v| v.code);
    Error::Api(ApiError::new(status, code, message, trace))
}
