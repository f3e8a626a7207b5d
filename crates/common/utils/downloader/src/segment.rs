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

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{config::SegmentingConfig, error::SegmentError, file_info::ResourceMetadata};

/// Lifecycle of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    /// Waiting for a concurrency permit
    Pending,
    /// A request for the range is in flight, or a retry is backing off
    InFlight,
    Completed,
    Failed,
}

/// A contiguous byte range of the resource, fetched by one downloader.
///
/// Records are updated by replacement: each transition consumes the old value
/// and returns the new one, so a published snapshot never changes underneath
/// its reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index:         usize,
    /// First byte (inclusive)
    pub start:         u64,
    /// Last byte (inclusive); `None` for the open-ended segment of a resource
    /// whose size is unknown
    pub end:           Option<u64>,
    pub bytes_written: u64,
    /// Retry counter, starts at 0
    pub attempt:       u32,
    pub status:        SegmentStatus,
    pub last_error:    Option<SegmentError>,
}

impl Segment {
    pub const fn new(index: usize, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            start,
            end,
            bytes_written: 0,
            attempt: 0,
            status: SegmentStatus::Pending,
            last_error: None,
        }
    }

    /// Number of bytes the range covers, if bounded.
    pub const fn expected_len(&self) -> Option<u64> {
        match self.end {
            Some(end) => Some(end - self.start + 1),
            None => None,
        }
    }

    /// `Range` header value for this segment, if bounded.
    pub fn range_header(&self) -> Option<String> {
        self.end.map(|end| format!("bytes={}-{end}", self.start))
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            SegmentStatus::Completed | SegmentStatus::Failed
        )
    }

    #[must_use]
    pub fn started(self) -> Self {
        Self {
            status: SegmentStatus::InFlight,
            ..self
        }
    }

    #[must_use]
    pub fn advanced(self, written: u64) -> Self {
        Self {
            bytes_written: self.bytes_written + written,
            ..self
        }
    }

    /// Prepare for the next attempt; the range is fetched again from its first
    /// byte, so previously written bytes no longer count.
    #[must_use]
    pub fn retrying(self, error: SegmentError) -> Self {
        Self {
            attempt: self.attempt + 1,
            bytes_written: 0,
            status: SegmentStatus::InFlight,
            last_error: Some(error),
            ..self
        }
    }

    #[must_use]
    pub fn completed(self) -> Self {
        Self {
            status: SegmentStatus::Completed,
            ..self
        }
    }

    #[must_use]
    pub fn failed(self, error: SegmentError) -> Self {
        Self {
            status: SegmentStatus::Failed,
            last_error: Some(error),
            ..self
        }
    }
}

/// Split `[0, file_size)` into `num_segments` near-equal inclusive ranges.
///
/// The remainder is spread one byte at a time over the leading segments, so
/// lengths differ by at most one.
pub fn calculate_segment_boundaries(file_size: u64, num_segments: usize) -> Vec<(u64, u64)> {
    if num_segments == 0 || file_size == 0 {
        return Vec::new();
    }

    let count = (num_segments as u64).min(file_size);
    let base = file_size / count;
    let remainder = file_size % count;

    let mut boundaries = Vec::with_capacity(num_segments);
    let mut start = 0;
    for i in 0..count {
        let len = base + u64::from(i < remainder);
        boundaries.push((start, start + len - 1));
        start += len;
    }
    boundaries
}

/// Lay out the segments for a resource.
///
/// Ranged resources of known size are split according to `config`; anything
/// else becomes one segment covering the whole body. Empty resources have no
/// segments.
pub fn plan_segments(metadata: &ResourceMetadata, config: &SegmentingConfig) -> Vec<Segment> {
    match metadata.total_size {
        None => vec![Segment::new(0, 0, None)],
        Some(0) => Vec::new(),
        Some(size) => {
            let count = if metadata.supports_range_requests {
                config.calculate_segments(size)
            } else {
                1
            };
            calculate_segment_boundaries(size, count)
                .into_iter()
                .enumerate()
                .map(|(index, (start, end))| Segment::new(index, start, Some(end)))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rangefetch_base::readable_size::ReadableSize;

    use super::*;
    use crate::error::DownloadFailedReason;

    fn ranged(size: u64) -> ResourceMetadata {
        ResourceMetadata {
            total_size:              Some(size),
            supports_range_requests: true,
            validator:               None,
        }
    }

    #[test]
    fn test_calculate_segment_boundaries() {
        let boundaries = calculate_segment_boundaries(1000, 4);
        assert_eq!(boundaries, vec![(0, 249), (250, 499), (500, 749), (750, 999)]);
    }

    #[test]
    fn remainder_goes_to_leading_segments() {
        let boundaries = calculate_segment_boundaries(10, 4);
        assert_eq!(boundaries, vec![(0, 2), (3, 5), (6, 7), (8, 9)]);
    }

    #[test]
    fn never_more_segments_than_bytes() {
        assert_eq!(calculate_segment_boundaries(3, 8), vec![(0, 0), (1, 1), (2, 2)]);
        assert!(calculate_segment_boundaries(0, 4).is_empty());
    }

    #[test]
    fn ten_mebibytes_with_four_way_concurrency() {
        let config = SegmentingConfig {
            min_segment_size: ReadableSize::mb(1),
            max_segments:     4,
        };
        let segments = plan_segments(&ranged(10_485_760), &config);
        assert_eq!(segments.len(), 4);
        assert!(segments.iter().all(|s| s.expected_len() == Some(2_621_440)));
        assert_eq!(segments[3].end, Some(10_485_759));
    }

    #[test]
    fn without_ranges_one_segment_covers_everything() {
        let metadata = ResourceMetadata {
            supports_range_requests: false,
            ..ranged(50 * 1024 * 1024)
        };
        let segments = plan_segments(&metadata, &SegmentingConfig::default());
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].range_header().as_deref(), Some("bytes=0-52428799"));
    }

    #[test]
    fn unknown_size_is_open_ended() {
        let metadata = ResourceMetadata {
            total_size:              None,
            supports_range_requests: false,
            validator:               None,
        };
        let segments = plan_segments(&metadata, &SegmentingConfig::default());
        assert_eq!(segments, vec![Segment::new(0, 0, None)]);
        assert_eq!(segments[0].range_header(), None);
        assert_eq!(segments[0].expected_len(), None);
    }

    #[test]
    fn empty_resource_has_no_segments() {
        assert!(plan_segments(&ranged(0), &SegmentingConfig::default()).is_empty());
    }

    #[test]
    fn retry_resets_progress_and_bumps_attempt() {
        let error = SegmentError {
            index:   2,
            reason:  DownloadFailedReason::ConnectionReset,
            attempt: 0,
            message: "reset by peer".to_string(),
        };
        let segment = Segment::new(2, 100, Some(199)).started().advanced(60);
        assert_eq!(segment.bytes_written, 60);

        let retried = segment.retrying(error.clone());
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.bytes_written, 0);
        assert_eq!(retried.status, SegmentStatus::InFlight);
        assert_eq!(retried.last_error, Some(error));
        assert!(!retried.is_terminal());
        assert!(retried.advanced(100).completed().is_terminal());
    }

    proptest! {
        #[test]
        fn segments_partition_the_resource(size in 1u64..=64 * 1024 * 1024, max in 1usize..=16) {
            let config = SegmentingConfig {
                min_segment_size: ReadableSize::kb(64),
                max_segments:     max,
            };
            let segments = plan_segments(&ranged(size), &config);

            prop_assert!(!segments.is_empty());
            prop_assert!(segments.len() <= max);
            prop_assert_eq!(segments[0].start, 0);
            prop_assert_eq!(segments.last().and_then(|s| s.end), Some(size - 1));

            let total: u64 = segments.iter().filter_map(Segment::expected_len).sum();
            prop_assert_eq!(total, size);

            for pair in segments.windows(2) {
                prop_assert_eq!(pair[0].end.map(|end| end + 1), Some(pair[1].start));
            }
            for (index, segment) in segments.iter().enumerate() {
                prop_assert_eq!(segment.index, index);
                prop_assert_eq!(segment.status, SegmentStatus::Pending);
            }
        }
    }
}
