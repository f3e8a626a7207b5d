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

use bon::Builder;
use jiff::Span;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::sync::mpsc;

use crate::{checksum::Checksum, error::DownloadFailedReason, segment::Segment};

/// A request to download a file
#[derive(Debug, Clone, Builder)]
pub struct DownloadOptions {
    /// URL to download from
    #[builder(into)]
    pub url:         String,
    /// Path where the downloaded file should be saved
    #[builder(into)]
    pub destination: PathBuf,
    /// Sent verbatim on every request, the metadata probe included
    #[builder(default)]
    pub headers:     BTreeMap<String, String>,
    /// Expected digest; verified after every segment completed
    pub checksum:    Option<Checksum>,
}

/// Result of a successful download
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    /// Path where the file was saved
    pub path:          PathBuf,
    /// Size of the downloaded file in bytes
    pub size:          u64,
    /// Computed digest (lowercase hex) when a checksum was requested
    pub checksum:      Option<String>,
    pub segments:      Vec<Segment>,
    /// Retries consumed across all segments
    pub retry_attempt: u32,
    /// Total duration of the download operation
    pub duration:      Span,
}

/// Lifecycle of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    ResolvingMetadata,
    Segmenting,
    Downloading,
    Verifying,
    Completed,
    Failed,
    Aborted,
}

impl TaskState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Progress notifications emitted by a running task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    StateChanged {
        from: TaskState,
        to:   TaskState,
    },
    SegmentStarted {
        index:   usize,
        start:   u64,
        end:     Option<u64>,
        attempt: u32,
    },
    SegmentRetrying {
        index:   usize,
        attempt: u32,
        reason:  DownloadFailedReason,
        delay:   Duration,
    },
    SegmentCompleted {
        index: usize,
        bytes: u64,
    },
    SegmentFailed {
        index:  usize,
        reason: DownloadFailedReason,
    },
    /// Aggregate bytes written grew by `delta`
    Progress {
        delta:      u64,
        downloaded: u64,
        total:      Option<u64>,
    },
    Finished {
        state:  TaskState,
        reason: Option<DownloadFailedReason>,
    },
}

pub type DownloadEvents = mpsc::UnboundedReceiver<DownloadEvent>;
pub(crate) type EventSender = mpsc::UnboundedSender<DownloadEvent>;
