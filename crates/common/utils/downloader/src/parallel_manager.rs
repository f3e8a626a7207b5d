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

use std::sync::Arc;

use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{
    error::{DownloadFailedReason, SegmentError},
    segment::{Segment, SegmentStatus},
    segment_downloader::{SegmentDownloader, SegmentUpdate},
    types::{DownloadEvent, EventSender},
};

/// What the Downloading phase leaves behind
#[derive(Debug)]
pub(crate) struct SegmentsOutcome {
    /// Final snapshot of every segment, in index order
    pub segments:      Vec<Segment>,
    /// Failures other than cancellation, in the order they were observed
    pub errors:        Vec<SegmentError>,
    /// The failure that stopped the download, if any
    pub first_failure: Option<SegmentError>,
}

/// Runs every segment on its own tokio task, at most `max_concurrency` at a
/// time, and folds their snapshots into one table.
pub(crate) struct ParallelDownloadManager {
    downloader:      Arc<SegmentDownloader>,
    max_concurrency: usize,
    total_size:      Option<u64>,
    events:          EventSender,
}

impl ParallelDownloadManager {
    pub const fn new(
        downloader: Arc<SegmentDownloader>,
        max_concurrency: usize,
        total_size: Option<u64>,
        events: EventSender,
    ) -> Self {
        Self {
            downloader,
            max_concurrency,
            total_size,
            events,
        }
    }

    /// Download all segments.
    ///
    /// The first non-cancellation failure cancels the remaining segments
    /// through a child of `cancel`; cancelling `cancel` itself stops them all.
    pub async fn download_all(
        &self,
        segments: Vec<Segment>,
        cancel: &CancellationToken,
    ) -> SegmentsOutcome {
        let segments_token = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut workers = JoinSet::new();
        for segment in segments.iter().cloned() {
            let downloader = Arc::clone(&self.downloader);
            let permits = Arc::clone(&permits);
            let token = segments_token.clone();
            let tx = tx.clone();
            workers.spawn(async move { downloader.run(segment, permits, token, tx).await });
        }
        drop(tx);

        let mut table = SegmentTable::new(segments, self.total_size, &self.events);
        let mut errors = Vec::new();
        let mut first_failure: Option<SegmentError> = None;

        while let Some(update) = rx.recv().await {
            let Some(failure) = table.apply(update) else {
                continue;
            };
            if first_failure.is_none() {
                warn!(
                    segment = failure.index,
                    reason = %failure.reason,
                    "segment failed, cancelling the remaining segments"
                );
                segments_token.cancel();
                first_failure = Some(failure.clone());
            }
            errors.push(failure);
        }

        while let Some(joined) = workers.join_next().await {
            let Err(join_error) = joined else { continue };
            // A worker that died never published its final snapshot.
            let Some(orphan) = table.first_unfinished() else {
                continue;
            };
            error!(segment = orphan.index, error = %join_error, "segment task did not finish");

            let failure = SegmentError {
                index:   orphan.index,
                reason:  DownloadFailedReason::GeneralDownloadException,
                attempt: orphan.attempt,
                message: format!("segment task did not finish: {join_error}"),
            };
            table.replace(orphan.failed(failure.clone()));
            if first_failure.is_none() {
                segments_token.cancel();
                first_failure = Some(failure.clone());
            }
            errors.push(failure);
        }

        SegmentsOutcome {
            segments: table.into_segments(),
            errors,
            first_failure,
        }
    }
}

/// Latest snapshot of each segment plus the aggregate progress derived from
/// them.
struct SegmentTable<'a> {
    segments: Vec<Segment>,
    total:    Option<u64>,
    reported: u64,
    events:   &'a EventSender,
}

impl<'a> SegmentTable<'a> {
    const fn new(segments: Vec<Segment>, total: Option<u64>, events: &'a EventSender) -> Self {
        Self {
            segments,
            total,
            reported: 0,
            events,
        }
    }

    /// Record a snapshot. Returns the segment's error when it just failed for
    /// a reason other than cancellation.
    fn apply(&mut self, update: SegmentUpdate) -> Option<SegmentError> {
        match update {
            SegmentUpdate::Started(segment) => {
                self.emit(DownloadEvent::SegmentStarted {
                    index:   segment.index,
                    start:   segment.start,
                    end:     segment.end,
                    attempt: segment.attempt,
                });
                self.replace(segment);
                None
            }
            SegmentUpdate::Progress(segment) => {
                self.replace(segment);
                None
            }
            SegmentUpdate::Retrying { segment, delay } => {
                if let Some(error) = &segment.last_error {
                    self.emit(DownloadEvent::SegmentRetrying {
                        index: segment.index,
                        attempt: segment.attempt,
                        reason: error.reason,
                        delay,
                    });
                }
                self.replace(segment);
                None
            }
            SegmentUpdate::Finished(segment) => {
                let failure = match segment.status {
                    SegmentStatus::Completed => {
                        self.emit(DownloadEvent::SegmentCompleted {
                            index: segment.index,
                            bytes: segment.bytes_written,
                        });
                        None
                    }
                    SegmentStatus::Failed => {
                        let reason = segment
                            .last_error
                            .as_ref()
                            .map_or(DownloadFailedReason::GeneralDownloadException, |e| {
                                e.reason
                            });
                        self.emit(DownloadEvent::SegmentFailed {
                            index: segment.index,
                            reason,
                        });
                        segment
                            .last_error
                            .clone()
                            .filter(|e| e.reason != DownloadFailedReason::OperationCancelled)
                    }
                    SegmentStatus::Pending | SegmentStatus::InFlight => None,
                };
                self.replace(segment);
                failure
            }
        }
    }

    fn replace(&mut self, segment: Segment) {
        if let Some(slot) = self.segments.get_mut(segment.index) {
            *slot = segment;
        }
        self.report_progress();
    }

    fn report_progress(&mut self) {
        let downloaded: u64 = self.segments.iter().map(|s| s.bytes_written).sum();
        if downloaded > self.reported {
            self.emit(DownloadEvent::Progress {
                delta: downloaded - self.reported,
                downloaded,
                total: self.total,
            });
        }
        // A retry restarts its range, so the aggregate may go backwards.
        self.reported = downloaded;
    }

    fn first_unfinished(&self) -> Option<Segment> {
        self.segments.iter().find(|s| !s.is_terminal()).cloned()
    }

    fn into_segments(self) -> Vec<Segment> { self.segments }

    fn emit(&self, event: DownloadEvent) { let _ = self.events.send(event); }
}
