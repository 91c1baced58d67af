//! Range transport contract
//!
//! A transport opens the remote resource at a byte offset and hands back the
//! body as a stream. It does not retry and does not touch the local payload;
//! both are the stream's job.

use super::DownloadError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::Url;
use std::collections::BTreeMap;
use std::pin::Pin;

/// Stream of body chunks from a transport
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Response to a range request
pub struct RangeResponse {
    /// Offset of the first body byte within the resource
    pub start: u64,
    /// Total resource length, when the server reports it
    pub total_length: Option<u64>,
    /// Response body
    pub body: ByteStream,
}

impl RangeResponse {
    /// Response with no body, used when the requested offset is already at EOF
    pub fn empty(start: u64, total_length: Option<u64>) -> Self {
        Self {
            start,
            total_length,
            body: Box::pin(futures_util::stream::empty()),
        }
    }
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("start", &self.start)
            .field("total_length", &self.total_length)
            .finish_non_exhaustive()
    }
}

/// Transport able to fetch a resource starting at an arbitrary byte offset
#[async_trait]
pub trait RangeTransport: Send + Sync {
    /// Open `uri` starting at `offset`.
    ///
    /// Servers that ignore range requests may answer from offset 0; the
    /// returned [`RangeResponse::start`] reports where the body really begins.
    async fn open(
        &self,
        uri: &Url,
        headers: &BTreeMap<String, String>,
        offset: u64,
    ) -> Result<RangeResponse, DownloadError>;
}

/// `Range` header value for an open-ended request starting at `offset`
pub fn range_header(offset: u64) -> String {
    format!("bytes={offset}-")
}

/// Parsed `Content-Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte (inclusive), `None` for unsatisfied ranges (`bytes */N`)
    pub start: Option<u64>,
    /// Last byte (inclusive)
    pub end: Option<u64>,
    /// Complete length, `None` when the server sent `*`
    pub total: Option<u64>,
}

/// Parse a `Content-Range` header such as `bytes 100-199/1000`,
/// `bytes 100-199/*` or `bytes */1000`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;

    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };

    let (start, end) = match range.trim() {
        "*" => (None, None),
        r => {
            let (start, end) = r.split_once('-')?;
            let start: u64 = start.trim().parse().ok()?;
            let end: u64 = end.trim().parse().ok()?;
            if end < start {
                return None;
            }
            (Some(start), Some(end))
        }
    };

    if start.is_none() && total.is_none() {
        return None;
    }

    Some(ContentRange { start, end, total })
}
