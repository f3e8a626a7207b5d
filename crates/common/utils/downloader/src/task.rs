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

//! The download task state machine.
//!
//! A task walks `Pending -> ResolvingMetadata -> Segmenting -> Downloading ->
//! Verifying` and ends in exactly one of `Completed`, `Failed` or `Aborted`.
//! Once terminal, neither the state nor the outcome changes again.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use jiff::Timestamp;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    checksum::{ChecksumAlgorithm, ChecksumError, verify_file},
    classify::classify,
    config::DownloaderConfig,
    error::{
        DownloadError, DownloadFailedReason, FailureReport, NetworkErrorKind, SegmentError,
        TransportError,
    },
    file_info::{MetadataResolver, ResourceMetadata},
    parallel_manager::ParallelDownloadManager,
    segment::{Segment, plan_segments},
    segment_downloader::SegmentDownloader,
    shared_file::{SharedFile, remove_partial},
    types::{DownloadEvent, DownloadOptions, DownloadSummary, EventSender, TaskState},
};

type TaskOutcome = Result<DownloadSummary, DownloadError>;

/// Handle to one download.
///
/// Cloning the handle is cheap; every clone controls the same task.
#[derive(Clone)]
pub struct DownloadTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    options: DownloadOptions,
    config:  Arc<DownloaderConfig>,
    client:  reqwest::Client,
    cancel:  CancellationToken,
    started: AtomicBool,
    state:   watch::Sender<TaskState>,
    outcome: watch::Sender<Option<TaskOutcome>>,
    /// Dropped once the task is terminal, which ends the event stream
    events:  Mutex<Option<EventSender>>,
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.inner.options.url)
            .field("destination", &self.inner.options.destination)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DownloadTask {
    pub(crate) fn new(
        options: DownloadOptions,
        config: Arc<DownloaderConfig>,
        client: reqwest::Client,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                options,
                config,
                client,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                state: watch::Sender::new(TaskState::Pending),
                outcome: watch::Sender::new(None),
                events: Mutex::new(Some(events)),
            }),
        }
    }

    pub fn url(&self) -> &str { &self.inner.options.url }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState { *self.inner.state.borrow() }

    /// Watch state transitions as they happen
    pub fn subscribe_state(&self) -> watch::Receiver<TaskState> { self.inner.state.subscribe() }

    /// Begin the download in the background. Calling it again, or after
    /// [`abort`](Self::abort), does nothing.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!(url = %self.inner.options.url, "task already started");
            return;
        }
        tokio::spawn(run_task(Arc::clone(&self.inner)));
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> Result<DownloadSummary, DownloadError> {
        let mut outcome = self.inner.outcome.subscribe();
        loop {
            if let Some(outcome) = outcome.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            if outcome.changed().await.is_err() {
                break;
            }
        }
        Err(DownloadError::General {
            message: "download task dropped before completion".to_string(),
            report:  self.inner.bare_report(),
        })
    }

    pub async fn start_and_wait(&self) -> Result<DownloadSummary, DownloadError> {
        self.start();
        self.wait().await
    }

    /// Cancel the task. A task that never started ends `Aborted` right away;
    /// a running one stops its in-flight requests and ends `Aborted` once they
    /// have unwound. Aborting a terminal task does nothing.
    pub fn abort(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            self.inner.cancel.cancel();
        } else {
            self.inner.finish(Err(DownloadError::Aborted {
                report: self.inner.bare_report(),
            }));
        }
    }
}

async fn run_task(inner: Arc<TaskInner>) {
    let run = TaskRun::new(&inner).execute();

    let outcome = match inner.config.task_timeout() {
        None => run.await,
        Some(limit) => {
            tokio::pin!(run);
            tokio::select! {
                outcome = &mut run => outcome,
                () = tokio::time::sleep(limit) => {
                    warn!(url = %inner.options.url, limit = ?limit, "task timeout elapsed, aborting");
                    inner.cancel.cancel();
                    run.await
                }
            }
        }
    };

    inner.finish(outcome);
}

impl TaskInner {
    fn transition(&self, to: TaskState) {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == to {
                return false;
            }
            from = Some(*state);
            *state = to;
            true
        });

        if let Some(from) = from {
            debug!(url = %self.options.url, %from, %to, "task state changed");
            self.emit(DownloadEvent::StateChanged { from, to });
        }
    }

    /// Settle the task. Only the first outcome counts.
    fn finish(&self, outcome: TaskOutcome) {
        if self.outcome.borrow().is_some() {
            return;
        }

        let (state, reason) = match &outcome {
            Ok(summary) => {
                info!(
                    url = %self.options.url,
                    path = %summary.path.display(),
                    size = summary.size,
                    segments = summary.segments.len(),
                    retries = summary.retry_attempt,
                    duration = %summary.duration,
                    "download completed"
                );
                (TaskState::Completed, None)
            }
            Err(err) => {
                if matches!(err, DownloadError::Aborted { .. }) {
                    warn!(url = %self.options.url, retries = err.retry_attempt(), "download aborted");
                    (TaskState::Aborted, Some(err.reason()))
                } else {
                    error!(
                        url = %self.options.url,
                        reason = %err.reason(),
                        retries = err.retry_attempt(),
                        error = %err,
                        "download failed"
                    );
                    (TaskState::Failed, Some(err.reason()))
                }
            }
        };

        self.transition(state);
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        self.emit(DownloadEvent::Finished { state, reason });
        self.events_slot().take();
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(events) = self.events_slot().as_ref() {
            let _ = events.send(event);
        }
    }

    fn event_sender(&self) -> EventSender {
        self.events_slot()
            .clone()
            .unwrap_or_else(|| mpsc::unbounded_channel().0)
    }

    fn events_slot(&self) -> std::sync::MutexGuard<'_, Option<EventSender>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bare_report(&self) -> Box<FailureReport> {
        Box::new(FailureReport {
            url:            self.options.url.clone(),
            metadata:       None,
            headers:        self.options.headers.clone(),
            destination:    self.options.destination.clone(),
            retry_attempt:  0,
            segments:       Vec::new(),
            segment_errors: Vec::new(),
        })
    }
}

/// Mutable context of one run, folded into the failure report.
struct TaskRun<'a> {
    task:                &'a TaskInner,
    started_at:          Timestamp,
    metadata:            Option<ResourceMetadata>,
    segments:            Vec<Segment>,
    segment_errors:      Vec<SegmentError>,
    created_destination: bool,
}

impl<'a> TaskRun<'a> {
    fn new(task: &'a TaskInner) -> Self {
        Self {
            task,
            started_at: Timestamp::now(),
            metadata: None,
            segments: Vec::new(),
            segment_errors: Vec::new(),
            created_destination: false,
        }
    }

    async fn execute(mut self) -> TaskOutcome {
        let outcome = self.run().await;

        if outcome.is_err() && self.created_destination {
            let destination = &self.task.options.destination;
            match remove_partial(destination).await {
                Ok(()) => debug!(path = %destination.display(), "removed partial download"),
                Err(e) => warn!(
                    path = %destination.display(),
                    error = %e,
                    "failed to remove partial download"
                ),
            }
        }
        outcome
    }

    async fn run(&mut self) -> TaskOutcome {
        let task = self.task;
        let options = &task.options;
        info!(url = %options.url, destination = %options.destination.display(), "download task started");

        // Inputs are checked before any traffic.
        let headers = header_map(&options.headers).map_err(|message| self.general(message))?;
        if let Err(e) = reqwest::Url::parse(&options.url) {
            return Err(self.general(format!("invalid URL '{}': {e}", options.url)));
        }
        let algorithm = options
            .checksum
            .as_ref()
            .map(|checksum| ChecksumAlgorithm::from_name(&checksum.algorithm))
            .transpose()
            .map_err(|e| self.checksum_failure(e))?;

        task.transition(TaskState::ResolvingMetadata);
        let resolver = MetadataResolver::new(task.client.clone(), task.config.read_timeout());
        let resolved = tokio::select! {
            biased;
            () = task.cancel.cancelled() => return Err(self.aborted()),
            result = resolver.resolve(&options.url, &headers) => result,
        };
        let metadata = resolved.map_err(|e| self.transport_failure(&e))?;
        self.metadata = Some(metadata.clone());

        task.transition(TaskState::Segmenting);
        self.segments = plan_segments(&metadata, &task.config.segmenting);
        let file = SharedFile::create(&options.destination, metadata.total_size)
            .await
            .map_err(|e| {
                self.general(format!(
                    "failed to prepare {}: {e}",
                    options.destination.display()
                ))
            })?;
        self.created_destination = true;
        debug!(
            url = %options.url,
            size = ?metadata.total_size,
            segments = self.segments.len(),
            "segments planned"
        );
        if task.cancel.is_cancelled() {
            return Err(self.aborted());
        }

        task.transition(TaskState::Downloading);
        let downloader = SegmentDownloader::builder()
            .client(task.client.clone())
            .url(options.url.clone())
            .headers(headers)
            .ranged(metadata.supports_range_requests)
            .maybe_total_size(metadata.total_size)
            .maybe_validator(metadata.validator.clone())
            .file(file.clone())
            .retry(task.config.retry.clone())
            .read_timeout(task.config.read_timeout())
            .buffer_size(task.config.buffer_size())
            .build();
        let manager = ParallelDownloadManager::new(
            Arc::new(downloader),
            task.config.max_concurrency(),
            metadata.total_size,
            task.event_sender(),
        );
        let outcome = manager
            .download_all(std::mem::take(&mut self.segments), &task.cancel)
            .await;
        self.segments = outcome.segments;
        self.segment_errors = outcome.errors;

        if task.cancel.is_cancelled() {
            return Err(self.aborted());
        }
        if let Some(failure) = outcome.first_failure {
            return Err(self.segment_failure(failure));
        }
        file.sync_all().await.map_err(|e| {
            self.general(format!(
                "failed to flush {}: {e}",
                options.destination.display()
            ))
        })?;
        drop(file);

        task.transition(TaskState::Verifying);
        let checksum = match (&options.checksum, algorithm) {
            (Some(checksum), Some(algorithm)) => {
                let actual = verify_file(
                    &options.destination,
                    checksum,
                    task.config.buffer_size(),
                    task.cancel.clone(),
                )
                .await
                .map_err(|e| self.checksum_failure(e))?;
                debug!(url = %options.url, %algorithm, "checksum verified");
                Some(actual)
            }
            _ => None,
        };

        // An abort that raced the flush still wins while the task is not terminal.
        if task.cancel.is_cancelled() {
            return Err(self.aborted());
        }

        Ok(DownloadSummary {
            path: options.destination.clone(),
            size: self.segments.iter().map(|s| s.bytes_written).sum(),
            checksum,
            segments: self.segments.clone(),
            retry_attempt: self.retry_attempt(),
            duration: self
                .started_at
                .until(Timestamp::now())
                .unwrap_or_default(),
        })
    }

    fn retry_attempt(&self) -> u32 { self.segments.iter().map(|s| s.attempt).sum() }

    fn report(&self) -> Box<FailureReport> {
        let options = &self.task.options;
        Box::new(FailureReport {
            url:            options.url.clone(),
            metadata:       self.metadata.clone(),
            headers:        options.headers.clone(),
            destination:    options.destination.clone(),
            retry_attempt:  self.retry_attempt(),
            segments:       self.segments.clone(),
            segment_errors: self.segment_errors.clone(),
        })
    }

    /// Abort report. Segments that had not settled end `Failed` with
    /// `OperationCancelled`; they stay out of `segment_errors`.
    fn aborted(&self) -> DownloadError {
        let mut report = self.report();
        report.segments = report
            .segments
            .into_iter()
            .map(|segment| {
                if segment.is_terminal() {
                    return segment;
                }
                let cancelled = SegmentError {
                    index:   segment.index,
                    reason:  DownloadFailedReason::OperationCancelled,
                    attempt: segment.attempt,
                    message: TransportError::Cancelled.to_string(),
                };
                segment.failed(cancelled)
            })
            .collect();
        DownloadError::Aborted { report }
    }

    fn general(&self, message: String) -> DownloadError {
        DownloadError::General {
            message,
            report: self.report(),
        }
    }

    fn transport_failure(&self, err: &TransportError) -> DownloadError {
        match classify(err) {
            Some(kind) => DownloadError::Network {
                kind,
                message: err.to_string(),
                report: self.report(),
            },
            None => self.general(err.to_string()),
        }
    }

    fn segment_failure(&self, failure: SegmentError) -> DownloadError {
        let kind = match failure.reason {
            DownloadFailedReason::ConnectionReset => Some(NetworkErrorKind::ConnectionReset),
            DownloadFailedReason::ConnectionTimeout => Some(NetworkErrorKind::ConnectionTimeout),
            DownloadFailedReason::ProtocolError => Some(NetworkErrorKind::ProtocolError),
            _ => None,
        };
        let message = format!("segment {} failed: {}", failure.index, failure.message);
        match kind {
            Some(kind) => DownloadError::Network {
                kind,
                message,
                report: self.report(),
            },
            None => self.general(message),
        }
    }

    fn checksum_failure(&self, err: ChecksumError) -> DownloadError {
        match err {
            ChecksumError::UnsupportedAlgorithm { algorithm } => {
                DownloadError::UnsupportedChecksum {
                    algorithm,
                    report: self.report(),
                }
            }
            ChecksumError::Mismatch {
                algorithm,
                expected,
                actual,
            } => DownloadError::ValidationFailed {
                algorithm: algorithm.to_string(),
                expected,
                actual,
                report: self.report(),
            },
            ChecksumError::Cancelled => self.aborted(),
            other @ (ChecksumError::Read { .. } | ChecksumError::HashTask { .. }) => {
                self.general(other.to_string())
            }
        }
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name '{name}': {e}"))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| format!("invalid value for header '{name}': {e}"))?;
            Ok((header_name, header_value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentStatus;

    #[test]
    fn headers_are_validated() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer token".to_string());
        let map = header_map(&headers).unwrap();
        assert_eq!(map.get("authorization").unwrap(), "Bearer token");

        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&headers).unwrap_err().contains("bad header"));
    }

    #[tokio::test]
    async fn abort_before_start_is_immediate_and_final() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let task = DownloadTask::new(
            DownloadOptions::builder()
                .url("http://127.0.0.1:9/never")
                .destination("/nonexistent/never.bin")
                .build(),
            Arc::new(DownloaderConfig::default()),
            reqwest::Client::new(),
            events_tx,
        );

        task.abort();
        assert_eq!(task.state(), TaskState::Aborted);

        // Neither a second abort nor a late start changes anything.
        task.abort();
        task.start();
        let err = task.wait().await.unwrap_err();
        assert_eq!(err.reason(), DownloadFailedReason::DownloadAborted);
        assert!(err.segments().is_empty());
        assert_eq!(task.state(), TaskState::Aborted);

        assert_eq!(
            events.recv().await,
            Some(DownloadEvent::StateChanged {
                from: TaskState::Pending,
                to:   TaskState::Aborted,
            })
        );
        assert_eq!(
            events.recv().await,
            Some(DownloadEvent::Finished {
                state:  TaskState::Aborted,
                reason: Some(DownloadFailedReason::DownloadAborted),
            })
        );
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn abort_report_settles_unfinished_segments() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let task = DownloadTask::new(
            DownloadOptions::builder()
                .url("http://127.0.0.1:9/file")
                .destination("/nonexistent/file.bin")
                .build(),
            Arc::new(DownloaderConfig::default()),
            reqwest::Client::new(),
            events_tx,
        );

        let mut run = TaskRun::new(&task.inner);
        run.segments = vec![
            Segment::new(0, 0, Some(99)).started().advanced(100).completed(),
            Segment::new(1, 100, Some(199)).started().advanced(40),
            Segment::new(2, 200, Some(299)),
        ];

        let err = run.aborted();
        assert_eq!(err.reason(), DownloadFailedReason::DownloadAborted);
        assert!(err.segment_errors().is_empty());

        let segments = err.segments();
        assert_eq!(segments[0].status, SegmentStatus::Completed);
        assert!(segments[0].last_error.is_none());
        for segment in &segments[1..] {
            assert_eq!(segment.status, SegmentStatus::Failed);
            assert_eq!(
                segment.last_error.as_ref().map(|e| e.reason),
                Some(DownloadFailedReason::OperationCancelled)
            );
        }
        assert_eq!(segments[1].bytes_written, 40);
    }
}
