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

use backon::ExponentialBuilder;
use bon::Builder;
use jiff::SignedDuration;
use rangefetch_base::readable_size::ReadableSize;
use smart_default::SmartDefault;

/// How a resource is split into segments
#[derive(Debug, Clone, SmartDefault)]
pub struct SegmentingConfig {
    /// Smallest segment worth its own connection (default: 1MB). Resources
    /// below twice this size are fetched in one piece.
    #[default(ReadableSize::mb(1))]
    pub min_segment_size: ReadableSize,
    /// Upper bound on the number of segments (default: 4)
    #[default = 4]
    pub max_segments:     usize,
}

impl SegmentingConfig {
    /// Number of segments for a ranged resource of the given size
    #[must_use]
    pub fn calculate_segments(&self, file_size: u64) -> usize {
        let min_segment = self.min_segment_size.as_bytes().max(1);
        let max_segments = self.max_segments.max(1);

        let count = file_size / min_segment;
        if count < 2 {
            1
        } else {
            usize::try_from(count).map_or(max_segments, |count| count.min(max_segments))
        }
    }
}

/// Backoff applied between attempts of one segment
#[derive(Debug, Clone, SmartDefault)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3)
    #[default = 3]
    pub max_retries: usize,
    #[default(SignedDuration::from_millis(500))]
    pub min_delay:   SignedDuration,
    #[default(SignedDuration::from_secs(8))]
    pub max_delay:   SignedDuration,
    /// Randomize delays so parallel segments do not retry in lockstep
    #[default = true]
    pub jitter:      bool,
}

impl RetryConfig {
    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.min_delay.unsigned_abs())
            .with_max_delay(self.max_delay.unsigned_abs());
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Configuration for the downloader
#[derive(Debug, Clone, SmartDefault, Builder)]
pub struct DownloaderConfig {
    #[default(SegmentingConfig::default())]
    #[builder(default)]
    pub segmenting: SegmentingConfig,

    /// Segments fetched at the same time (default: 4)
    #[default = 4]
    #[builder(default = 4)]
    pub max_concurrency: usize,

    #[default(RetryConfig::default())]
    #[builder(default)]
    pub retry: RetryConfig,

    /// Timeout for establishing a connection
    #[default(SignedDuration::from_secs(30))]
    #[builder(default = SignedDuration::from_secs(30))]
    pub connect_timeout: SignedDuration,

    /// Longest wait for a response head or for the next body chunk
    #[default(SignedDuration::from_secs(30))]
    #[builder(default = SignedDuration::from_secs(30))]
    pub read_timeout: SignedDuration,

    /// Abort the whole task once it runs this long
    pub task_timeout: Option<SignedDuration>,

    /// Bytes buffered per segment before a positional write (default: 512KB)
    #[default(ReadableSize::kb(512))]
    #[builder(default = ReadableSize::kb(512))]
    pub buffer_size: ReadableSize,

    /// Custom User-Agent header
    pub user_agent: Option<String>,
}

impl DownloaderConfig {
    pub(crate) fn read_timeout(&self) -> Duration { self.read_timeout.unsigned_abs() }

    pub(crate) fn connect_timeout(&self) -> Duration { self.connect_timeout.unsigned_abs() }

    pub(crate) fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout.map(SignedDuration::unsigned_abs)
    }

    pub(crate) fn buffer_size(&self) -> usize { self.buffer_size.as_usize().max(1) }

    pub(crate) fn max_concurrency(&self) -> usize { self.max_concurrency.max(1) }
}
