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

use std::{sync::Arc, time::Duration};

use backon::BackoffBuilder;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{
    StatusCode,
    header::{self, HeaderMap},
};
use snafu::{ResultExt, ensure};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    classify::classify,
    config::RetryConfig,
    error::{
        DownloadFailedReason, FileWriteSnafu, IncompleteBodySnafu, RangeNotHonoredSnafu,
        RequestSnafu, SegmentError, StatusSnafu, TimeoutSnafu, TransportError,
        UnexpectedLengthSnafu,
    },
    file_info::parse_content_range,
    segment::Segment,
    shared_file::SharedFile,
};

/// Snapshot published by a segment downloader to the orchestrator
#[derive(Debug, Clone)]
pub(crate) enum SegmentUpdate {
    Started(Segment),
    Progress(Segment),
    Retrying { segment: Segment, delay: Duration },
    Finished(Segment),
}

pub(crate) type UpdateSender = mpsc::UnboundedSender<SegmentUpdate>;

/// Fetches one byte range into the shared destination, retrying dropped and
/// stalled connections with exponential backoff.
pub(crate) struct SegmentDownloader {
    client:       reqwest::Client,
    url:          String,
    headers:      HeaderMap,
    /// Send `Range` headers; false when the server cannot serve ranges
    ranged:       bool,
    total_size:   Option<u64>,
    /// Strong validator sent as `If-Range`
    if_range:     Option<String>,
    file:         SharedFile,
    retry:        RetryConfig,
    read_timeout: Duration,
    buffer_size:  usize,
}

#[bon::bon]
impl SegmentDownloader {
    #[builder]
    pub(crate) fn new(
        client: reqwest::Client,
        url: String,
        headers: HeaderMap,
        ranged: bool,
        total_size: Option<u64>,
        validator: Option<String>,
        file: SharedFile,
        retry: RetryConfig,
        read_timeout: Duration,
        buffer_size: usize,
    ) -> Self {
        // Weak entity tags are not allowed in If-Range.
        let if_range = validator.filter(|v| !v.starts_with("W/"));
        Self {
            client,
            url,
            headers,
            ranged,
            total_size,
            if_range,
            file,
            retry,
            read_timeout,
            buffer_size,
        }
    }

    /// Drive `segment` to a terminal state.
    ///
    /// Waits for a concurrency permit first. Every snapshot of the segment is
    /// published on `updates`; the returned value equals the last one.
    pub async fn run(
        self: Arc<Self>,
        segment: Segment,
        permits: Arc<Semaphore>,
        cancel: CancellationToken,
        updates: UpdateSender,
    ) -> Segment {
        let _permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Self::cancelled(segment, &updates),
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Self::cancelled(segment, &updates),
            },
        };

        let index = segment.index;
        let mut segment = segment.started();
        let mut backoff = self.retry.backoff().build();

        loop {
            debug!(url = %self.url, segment = index, attempt = segment.attempt, "segment attempt started");
            let _ = updates.send(SegmentUpdate::Started(segment.clone()));

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(TransportError::Cancelled),
                result = self.fetch(&mut segment, &updates) => result,
            };

            let error = match result {
                Ok(()) => {
                    debug!(url = %self.url, segment = index, bytes = segment.bytes_written, "segment completed");
                    return Self::finish(segment.completed(), &updates);
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            let failure = SegmentError {
                index,
                reason: DownloadFailedReason::from_classification(kind),
                attempt: segment.attempt,
                message: error.to_string(),
            };

            if !kind.is_some_and(|kind| kind.is_retryable()) {
                debug!(url = %self.url, segment = index, reason = %failure.reason, error = %error, "segment failed");
                return Self::finish(segment.failed(failure), &updates);
            }

            let Some(delay) = backoff.next() else {
                warn!(
                    url = %self.url,
                    segment = index,
                    attempts = segment.attempt + 1,
                    error = %error,
                    "segment retries exhausted"
                );
                return Self::finish(segment.failed(failure), &updates);
            };

            warn!(
                url = %self.url,
                segment = index,
                attempt = segment.attempt,
                delay = ?delay,
                error = %error,
                "segment failed, retrying"
            );
            segment = segment.retrying(failure);
            let _ = updates.send(SegmentUpdate::Retrying {
                segment: segment.clone(),
                delay,
            });

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Self::cancelled(segment, &updates),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Single attempt: request the range and stream it into place.
    async fn fetch(
        &self,
        segment: &mut Segment,
        updates: &UpdateSender,
    ) -> Result<(), TransportError> {
        let range = if self.ranged {
            segment.range_header()
        } else {
            None
        };

        let mut request = self.client.get(&self.url).headers(self.headers.clone());
        if let Some(range) = &range {
            request = request.header(header::RANGE, range);
            if let Some(validator) = &self.if_range {
                request = request.header(header::IF_RANGE, validator);
            }
        }

        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| self.timed_out())?
            .context(RequestSnafu)?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                status: status.as_u16(),
                url:    &self.url,
            }
        );
        if let Some(range) = range {
            self.check_range(segment, status, response.headers(), range)?;
        }

        let expected = segment.expected_len();
        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::with_capacity(self.buffer_size);
        let mut offset = segment.start;
        let mut received: u64 = 0;

        while let Some(chunk) = tokio::time::timeout(self.read_timeout, stream.next())
            .await
            .map_err(|_| self.timed_out())?
        {
            let chunk = chunk.context(RequestSnafu)?;
            received += chunk.len() as u64;
            if let Some(expected) = expected {
                ensure!(
                    received <= expected,
                    UnexpectedLengthSnafu { expected, received }
                );
            }

            buffer.extend_from_slice(&chunk);
            if buffer.len() >= self.buffer_size {
                offset = self.flush(segment, &mut buffer, offset, updates).await?;
            }
        }
        self.flush(segment, &mut buffer, offset, updates).await?;

        if let Some(expected) = expected {
            ensure!(
                received == expected,
                IncompleteBodySnafu { expected, received }
            );
        }
        Ok(())
    }

    /// A ranged request must come back as exactly that range. A full `200`
    /// body is only acceptable when the segment spans the whole resource.
    fn check_range(
        &self,
        segment: &Segment,
        status: StatusCode,
        headers: &HeaderMap,
        requested: String,
    ) -> Result<(), TransportError> {
        let honored = if status == StatusCode::PARTIAL_CONTENT {
            headers
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .is_some_and(|r| r.start == segment.start && Some(r.end) == segment.end)
        } else {
            segment.start == 0 && segment.end.map(|end| end + 1) == self.total_size
        };

        ensure!(
            honored,
            RangeNotHonoredSnafu {
                requested,
                status: status.as_u16(),
            }
        );
        Ok(())
    }

    /// Write the buffered bytes at `offset` and publish the new progress.
    async fn flush(
        &self,
        segment: &mut Segment,
        buffer: &mut BytesMut,
        offset: u64,
        updates: &UpdateSender,
    ) -> Result<u64, TransportError> {
        if buffer.is_empty() {
            return Ok(offset);
        }

        let data = buffer.split().freeze();
        let len = data.len() as u64;
        self.file
            .write_all_at(data, offset)
            .await
            .context(FileWriteSnafu)?;

        *segment = segment.clone().advanced(len);
        let _ = updates.send(SegmentUpdate::Progress(segment.clone()));
        Ok(offset + len)
    }

    fn timed_out(&self) -> TransportError {
        TimeoutSnafu {
            elapsed: self.read_timeout,
        }
        .build()
    }

    fn cancelled(segment: Segment, updates: &UpdateSender) -> Segment {
        let failure = SegmentError {
            index:   segment.index,
            reason:  DownloadFailedReason::OperationCancelled,
            attempt: segment.attempt,
            message: TransportError::Cancelled.to_string(),
        };
        Self::finish(segment.failed(failure), updates)
    }

    fn finish(segment: Segment, updates: &UpdateSender) -> Segment {
        let _ = updates.send(SegmentUpdate::Finished(segment.clone()));
        segment
    }
}
