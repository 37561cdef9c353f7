//! Range-capable fetch interface
//!
//! A [`Transport`] issues one GET per transfer attempt, starting at a byte
//! offset and conditioned on a validator. It reports what the server actually
//! sent in [`ResponseMeta`]; deciding whether that response is a valid
//! resume, a stale resource or an unsupported range is left to the worker.

mod http;

pub use http::HttpTransport;

pub use crate::error::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Stream of response body chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// One transfer attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Source URL
    pub url: String,
    /// First byte wanted (0 = whole resource)
    pub offset: u64,
    /// Validator captured earlier, sent as `If-Range`
    pub validator: Option<String>,
}

/// What the server answered, before the body is read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// HTTP status code (200 or 206)
    pub status: u16,
    /// Size of the complete resource, if reported
    pub total_bytes: Option<u64>,
    /// Strong ETag, else Last-Modified
    pub validator: Option<String>,
    /// The server honors byte ranges for this resource
    pub supports_range: bool,
    /// Offset of the first body byte within the resource
    pub start_offset: u64,
}

impl ResponseMeta {
    /// The body is a partial response
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

/// Response headers plus body stream
pub struct FetchResponse {
    /// Response metadata
    pub meta: ResponseMeta,
    /// Body chunks
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Abstraction over range-capable GETs, enabling testability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return once the response headers are in
    ///
    /// Non-success statuses are returned as classified [`TransferError`]s.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransferError>;
}

/// Parse and check that `raw` is an http(s) URL
pub fn validate_url(raw: &str) -> Result<url::Url, TransferError> {
    let parsed = url::Url::parse(raw).map_err(|e| TransferError::InvalidUrl(format!("{raw}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host().is_some() => Ok(parsed),
        "http" | "https" => Err(TransferError::InvalidUrl(format!("{raw}: missing host"))),
        scheme => Err(TransferError::InvalidUrl(format!(
            "{raw}: unsupported scheme {scheme}"
        ))),
    }
}
