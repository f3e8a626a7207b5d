// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use reqwest::{
    StatusCode,
    header::{self, HeaderMap},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::error::{RequestSnafu, StatusSnafu, TimeoutSnafu, TransportError};

/// What the server tells us about a resource before we fetch it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub total_size:              Option<u64>,
    pub supports_range_requests: bool,
    /// Entity tag, or Last-Modified when the server sends no tag
    pub validator:               Option<String>,
}

impl ResourceMetadata {
    /// Interpret the headers of a successful HEAD response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let encoded = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| !v.trim().eq_ignore_ascii_case("identity"));

        let total_size = if encoded {
            None
        } else {
            headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        };

        let accepts_bytes = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| {
                v.split(',')
                    .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
            });

        Self {
            total_size,
            supports_range_requests: accepts_bytes && total_size.is_some(),
            validator: validator(headers),
        }
    }

    /// Interpret a `206` answer to the one-byte probe `Range: bytes=0-0`.
    fn from_probe(headers: &HeaderMap) -> Self {
        let total_size = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_content_range(v)?.total);

        Self {
            total_size,
            supports_range_requests: total_size.is_some(),
            validator: validator(headers),
        }
    }
}

/// A parsed `Content-Range: bytes start-end/total` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContentRange {
    pub start: u64,
    pub end:   u64,
    /// `None` when the server answers with `*`
    pub total: Option<u64>,
}

pub(crate) fn parse_content_range(value: &str) -> Option<ContentRange> {
    let value = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = value.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    (start <= end).then_some(ContentRange { start, end, total })
}

fn validator(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ETAG)
        .or_else(|| headers.get(header::LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Fetches resource metadata from the server
pub struct MetadataResolver {
    client:       reqwest::Client,
    read_timeout: Duration,
}

impl MetadataResolver {
    pub const fn new(client: reqwest::Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
        }
    }

    /// Probe `url` with a HEAD request carrying the caller's headers.
    ///
    /// Servers that refuse HEAD are asked for the first byte instead. Nothing
    /// here is retried.
    pub async fn resolve(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<ResourceMetadata, TransportError> {
        let response = self
            .send(self.client.head(url).headers(headers.clone()))
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            debug!(url, status = status.as_u16(), "HEAD rejected, probing first byte");
            return self.resolve_with_range(url, headers).await;
        }

        ensure!(
            status.is_success(),
            StatusSnafu {
                status: status.as_u16(),
                url,
            }
        );

        let metadata = ResourceMetadata::from_headers(response.headers());
        debug!(
            url,
            size = ?metadata.total_size,
            ranges = metadata.supports_range_requests,
            "resolved resource metadata"
        );
        Ok(metadata)
    }

    async fn resolve_with_range(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<ResourceMetadata, TransportError> {
        let response = self
            .send(
                self.client
                    .get(url)
                    .headers(headers.clone())
                    .header(header::RANGE, "bytes=0-0"),
            )
            .await?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                status: status.as_u16(),
                url,
            }
        );

        // Dropping the response closes the connection without reading a full
        // body from servers that ignored the range.
        if status == StatusCode::PARTIAL_CONTENT {
            Ok(ResourceMetadata::from_probe(response.headers()))
        } else {
            Ok(ResourceMetadata {
                supports_range_requests: false,
                ..ResourceMetadata::from_headers(response.headers())
            })
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| {
                TimeoutSnafu {
                    elapsed: self.read_timeout,
                }
                .build()
            })?
            .context(RequestSnafu)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn headers(pairs: &[(header::HeaderName, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(name, value)| (name.clone(), HeaderValue::from_static(value)))
            .collect()
    }

    #[test]
    fn ranged_resource_with_etag() {
        let metadata = ResourceMetadata::from_headers(&headers(&[
            (header::CONTENT_LENGTH, "10485760"),
            (header::ACCEPT_RANGES, "bytes"),
            (header::ETAG, "\"5f1c-abc\""),
            (header::LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT"),
        ]));
        assert_eq!(metadata.total_size, Some(10_485_760));
        assert!(metadata.supports_range_requests);
        assert_eq!(metadata.validator.as_deref(), Some("\"5f1c-abc\""));
    }

    #[test]
    fn last_modified_is_the_fallback_validator() {
        let metadata = ResourceMetadata::from_headers(&headers(&[
            (header::CONTENT_LENGTH, "42"),
            (header::LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT"),
        ]));
        assert!(!metadata.supports_range_requests);
        assert_eq!(
            metadata.validator.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[test]
    fn explicit_none_or_missing_size_disables_ranges() {
        let rejected = ResourceMetadata::from_headers(&headers(&[
            (header::CONTENT_LENGTH, "42"),
            (header::ACCEPT_RANGES, "none"),
        ]));
        assert!(!rejected.supports_range_requests);

        let unsized_resource =
            ResourceMetadata::from_headers(&headers(&[(header::ACCEPT_RANGES, "bytes")]));
        assert_eq!(unsized_resource.total_size, None);
        assert!(!unsized_resource.supports_range_requests);
    }

    #[test]
    fn encoded_bodies_are_not_split() {
        let metadata = ResourceMetadata::from_headers(&headers(&[
            (header::CONTENT_LENGTH, "1000"),
            (header::ACCEPT_RANGES, "bytes"),
            (header::CONTENT_ENCODING, "gzip"),
        ]));
        assert_eq!(metadata.total_size, None);
        assert!(!metadata.supports_range_requests);
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(
            parse_content_range("bytes 0-0/10485760"),
            Some(ContentRange {
                start: 0,
                end:   0,
                total: Some(10_485_760),
            })
        );
        assert_eq!(
            parse_content_range("bytes 100-199/*").map(|r| (r.start, r.end, r.total)),
            Some((100, 199, None))
        );
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("bytes 9-1/10"), None);
    }

    #[test]
    fn probe_headers_reveal_total_size() {
        let metadata = ResourceMetadata::from_probe(&headers(&[(
            header::CONTENT_RANGE,
            "bytes 0-0/2048",
        )]));
        assert_eq!(metadata.total_size, Some(2048));
        assert!(metadata.supports_range_requests);
    }
}
