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

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum_macros::{Display, EnumString};

use crate::{file_info::ResourceMetadata, segment::Segment};

/// Network failure kinds the downloader distinguishes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum NetworkErrorKind {
    ConnectionReset,
    ConnectionTimeout,
    OperationCancelled,
    ProtocolError,
}

impl NetworkErrorKind {
    /// Only dropped and stalled connections are worth another attempt.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionReset | Self::ConnectionTimeout)
    }
}

/// Why a download ended in failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum DownloadFailedReason {
    DownloadAborted,
    DownloadValidationFailed,
    GeneralDownloadException,
    ConnectionReset,
    ConnectionTimeout,
    OperationCancelled,
    ProtocolError,
}

impl DownloadFailedReason {
    /// Map a classifier result onto the reason taxonomy; unclassified
    /// failures are general exceptions.
    pub const fn from_classification(kind: Option<NetworkErrorKind>) -> Self {
        match kind {
            Some(kind) => Self::from_network(kind),
            None => Self::GeneralDownloadException,
        }
    }

    const fn from_network(kind: NetworkErrorKind) -> Self {
        match kind {
            NetworkErrorKind::ConnectionReset => Self::ConnectionReset,
            NetworkErrorKind::ConnectionTimeout => Self::ConnectionTimeout,
            NetworkErrorKind::OperationCancelled => Self::OperationCancelled,
            NetworkErrorKind::ProtocolError => Self::ProtocolError,
        }
    }
}

impl From<NetworkErrorKind> for DownloadFailedReason {
    fn from(kind: NetworkErrorKind) -> Self { Self::from_network(kind) }
}

/// Failure of a single request or of writing its body.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("request failed: {source}"))]
    Request { source: reqwest::Error },

    #[snafu(display("HTTP error {status} for URL: {url}"))]
    Status { status: u16, url: String },

    #[snafu(display("no data received within {elapsed:?}"))]
    Timeout { elapsed: Duration },

    #[snafu(display("server did not honour range {requested} (status {status})"))]
    RangeNotHonored { requested: String, status: u16 },

    #[snafu(display("server sent {received} bytes for a {expected}-byte range"))]
    UnexpectedLength { expected: u64, received: u64 },

    #[snafu(display("connection closed after {received} of {expected} bytes"))]
    IncompleteBody { expected: u64, received: u64 },

    #[snafu(display("File write error: {source}"))]
    FileWrite { source: std::io::Error },

    #[snafu(display("operation cancelled"))]
    Cancelled,
}

/// Failure to set up a [`Downloader`](crate::Downloader).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BuildError {
    #[snafu(display("failed to build HTTP client: {source}"))]
    HttpClient { source: reqwest::Error },
}

/// Classified failure of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentError {
    pub index:   usize,
    pub reason:  DownloadFailedReason,
    /// Attempt number the failure happened on (0 is the first try).
    pub attempt: u32,
    pub message: String,
}

/// Context shared by every terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub url:            String,
    pub metadata:       Option<ResourceMetadata>,
    pub headers:        BTreeMap<String, String>,
    pub destination:    PathBuf,
    /// Retries consumed across all segments.
    pub retry_attempt:  u32,
    pub segments:       Vec<Segment>,
    /// Per-segment causes in the order they were observed.
    pub segment_errors: Vec<SegmentError>,
}

/// Terminal failure of a download task.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum DownloadError {
    #[snafu(display("The download failed! download of {} was aborted", report.url))]
    Aborted { report: Box<FailureReport> },

    #[snafu(display(
        "The download failed! {algorithm} mismatch for {}: expected {expected}, got {actual}",
        report.destination.display()
    ))]
    ValidationFailed {
        algorithm: String,
        expected:  String,
        actual:    String,
        report:    Box<FailureReport>,
    },

    #[snafu(display("The download failed! {kind}: {message}"))]
    Network {
        kind:    NetworkErrorKind,
        message: String,
        report:  Box<FailureReport>,
    },

    #[snafu(display("The download failed! {message}"))]
    General {
        message: String,
        report:  Box<FailureReport>,
    },

    #[snafu(display("The download failed! unsupported checksum algorithm '{algorithm}'"))]
    UnsupportedChecksum {
        algorithm: String,
        report:    Box<FailureReport>,
    },
}

impl DownloadError {
    pub const fn reason(&self) -> DownloadFailedReason {
        match self {
            Self::Aborted { .. } => DownloadFailedReason::DownloadAborted,
            Self::ValidationFailed { .. } => DownloadFailedReason::DownloadValidationFailed,
            Self::Network { kind, .. } => DownloadFailedReason::from_network(*kind),
            Self::General { .. } | Self::UnsupportedChecksum { .. } => {
                DownloadFailedReason::GeneralDownloadException
            }
        }
    }

    pub fn report(&self) -> &FailureReport {
        match self {
            Self::Aborted { report }
            | Self::ValidationFailed { report, .. }
            | Self::Network { report, .. }
            | Self::General { report, .. }
            | Self::UnsupportedChecksum { report, .. } => report,
        }
    }

    pub fn url(&self) -> &str { &self.report().url }

    pub fn retry_attempt(&self) -> u32 { self.report().retry_attempt }

    pub fn segments(&self) -> &[Segment] { &self.report().segments }

    pub fn segment_errors(&self) -> &[SegmentError] { &self.report().segment_errors }

    pub fn metadata(&self) -> Option<&ResourceMetadata> { self.report().metadata.as_ref() }

    pub fn headers(&self) -> &BTreeMap<String, String> { &self.report().headers }

    pub fn destination(&self) -> &std::path::Path { &self.report().destination }
}
