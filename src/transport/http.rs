//! HTTP transport over reqwest

use super::{ByteStream, FetchRequest, FetchResponse, ResponseMeta, Transport, validate_url};
use crate::config::TransportConfig;
use crate::error::{Error, Result, TransferError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use std::time::Duration;

/// Production [`Transport`] backed by a shared `reqwest::Client`
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpTransport {
    /// Build a client with the configured timeouts and user agent
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to build HTTP client: {e}"),
                key: Some("transport".into()),
            })?;

        Ok(Self {
            client,
            read_timeout: config.read_timeout,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<FetchResponse, TransferError> {
        let url = validate_url(&request.url)?;

        let mut builder = self.client.get(url);
        if request.offset > 0 {
            builder = builder.header(header::RANGE, format!("bytes={}-", request.offset));
            if let Some(validator) = &request.validator {
                builder = builder.header(header::IF_RANGE, validator.as_str());
            }
        }

        let response = tokio::time::timeout(self.read_timeout, builder.send())
            .await
            .map_err(|_| TransferError::Timeout("waiting for response headers".into()))?
            .map_err(|e| classify_reqwest(&e))?;

        let status = response.status().as_u16();
        let meta = match status {
            200 => ResponseMeta {
                status,
                total_bytes: response.content_length(),
                validator: validator_from(response.headers()),
                supports_range: accepts_ranges(response.headers()),
                start_offset: 0,
            },
            206 => {
                let (start, total) = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .ok_or_else(|| TransferError::Stream("206 without a usable Content-Range".into()))?;
                ResponseMeta {
                    status,
                    total_bytes: total,
                    validator: validator_from(response.headers()),
                    supports_range: true,
                    start_offset: start,
                }
            }
            412 => return Err(TransferError::PreconditionFailed),
            416 => {
                return Err(TransferError::RangeNotSatisfiable {
                    offset: request.offset,
                });
            }
            other => return Err(TransferError::HttpStatus { status: other }),
        };

        tracing::debug!(
            url = %request.url,
            status,
            offset = request.offset,
            start = meta.start_offset,
            total = ?meta.total_bytes,
            "received response headers"
        );

        Ok(FetchResponse {
            meta,
            body: body_stream(response, self.read_timeout),
        })
    }
}

/// Body chunks, each bounded by the read timeout
fn body_stream(response: reqwest::Response, read_timeout: Duration) -> ByteStream {
    let chunks = response.bytes_stream().boxed();
    futures::stream::unfold(Some(chunks), move |state| async move {
        let mut chunks = state?;
        match tokio::time::timeout(read_timeout, chunks.next()).await {
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(chunks))),
            Ok(Some(Err(e))) => Some((Err(classify_reqwest(&e)), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(TransferError::Timeout("waiting for body data".into())),
                None,
            )),
        }
    })
    .boxed()
}

fn classify_reqwest(e: &reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransferError::Connect(e.to_string())
    } else if e.is_builder() {
        TransferError::InvalidUrl(e.to_string())
    } else {
        TransferError::Stream(e.to_string())
    }
}

/// Strong ETag if present, else Last-Modified
///
/// Weak ETags cannot be used with `If-Range`.
fn validator_from(headers: &HeaderMap) -> Option<String> {
    let text = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    text(header::ETAG)
        .filter(|etag| !etag.starts_with("W/"))
        .or_else(|| text(header::LAST_MODIFIED))
}

fn accepts_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
}

/// Parse `bytes <start>-<end>/<total|*>` into `(start, total)`
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }

    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse::<u64>().ok()?),
    };
    if total.is_some_and(|t| end >= t) {
        return None;
    }
    Some((start, total))
}
