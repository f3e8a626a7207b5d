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

mod checksum;
mod classify;
mod config;
mod downloader;
mod error;
mod file_info;
mod parallel_manager;
mod segment;
mod segment_downloader;
mod shared_file;
mod task;
mod types;

pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumError, verify_file};
pub use classify::{classify, is_common_network_error};
pub use config::{DownloaderConfig, RetryConfig, SegmentingConfig};
pub use downloader::Downloader;
pub use error::{
    BuildError, DownloadError, DownloadFailedReason, FailureReport, NetworkErrorKind,
    SegmentError, TransportError,
};
pub use file_info::{MetadataResolver, ResourceMetadata};
pub use segment::{Segment, SegmentStatus, calculate_segment_boundaries, plan_segments};
pub use task::DownloadTask;
pub use types::{DownloadEvent, DownloadEvents, DownloadOptions, DownloadSummary, TaskState};
