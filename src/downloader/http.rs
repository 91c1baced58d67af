//! HTTP range transport backed by `reqwest`

use super::transport::{parse_content_range, range_header, RangeResponse, RangeTransport};
use super::DownloadError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode, Url};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Connection timeout for range requests
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP transport issuing `Range: bytes=N-` requests
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with default client settings
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| DownloadError::NetworkError(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Create a transport from an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RangeTransport for HttpTransport {
    async fn open(
        &self,
        uri: &Url,
        headers: &BTreeMap<String, String>,
        offset: u64,
    ) -> Result<RangeResponse, DownloadError> {
        let mut request = self.client.get(uri.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if offset > 0 {
            request = request.header(RANGE, range_header(offset));
        }

        debug!(host = uri.host_str().unwrap_or_default(), offset, "Opening range request");

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::NetworkError(e.to_string()))?;

        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let (start, total_length) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let range = content_range.ok_or_else(|| {
                    DownloadError::InvalidResponse("206 response without Content-Range".to_string())
                })?;
                let start = range.start.ok_or_else(|| {
                    DownloadError::InvalidResponse("206 response with unsatisfied range".to_string())
                })?;
                (start, range.total)
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // Asking for bytes past the end of a fully downloaded file.
                match content_range.and_then(|r| r.total) {
                    Some(total) if total == offset => return Ok(RangeResponse::empty(offset, Some(total))),
                    _ => return Err(DownloadError::HttpStatus(status.as_u16())),
                }
            }
            s if s.is_success() => (0, response.content_length()),
            s => return Err(DownloadError::HttpStatus(s.as_u16())),
        };

        debug!(status = status.as_u16(), start, ?total_length, "Range request opened");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| DownloadError::NetworkError(e.to_string())));

        Ok(RangeResponse {
            start,
            total_length,
            body: Box::pin(body),
        })
    }
}
