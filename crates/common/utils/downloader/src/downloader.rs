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

use snafu::ResultExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    config::DownloaderConfig,
    error::{BuildError, DownloadError, HttpClientSnafu},
    task::DownloadTask,
    types::{DownloadEvents, DownloadOptions, DownloadSummary},
};

/// Segmented HTTP downloader
///
/// Components:
/// - `MetadataResolver`: probes size, range support and validator
/// - `ParallelDownloadManager`: runs the segments under a concurrency limit
/// - `SegmentDownloader`: fetches one range with retry and backoff
/// - `verify_file`: checks the finished file against the expected digest
///
/// One downloader can run any number of tasks; they share its HTTP client
/// and configuration.
#[derive(Debug, Clone)]
pub struct Downloader {
    config: Arc<DownloaderConfig>,
    client: reqwest::Client,
}

impl Downloader {
    /// Create a new downloader with the given configuration
    pub fn new(config: DownloaderConfig) -> Result<Self, BuildError> {
        let client = Self::build_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    /// Use a caller-built client. Its own timeouts apply in addition to the
    /// configured ones.
    pub fn with_client(config: DownloaderConfig, client: reqwest::Client) -> Self {
        debug!(
            max_concurrency = config.max_concurrency,
            max_segments = config.segmenting.max_segments,
            min_segment_size = %config.segmenting.min_segment_size,
            buffer_size = %config.buffer_size,
            "downloader created"
        );
        Self {
            config: Arc::new(config),
            client,
        }
    }

    pub fn config(&self) -> &DownloaderConfig { &self.config }

    /// Create a task in the `Pending` state together with its event stream.
    ///
    /// Nothing happens until [`DownloadTask::start`] is called.
    pub fn create_task(&self, options: DownloadOptions) -> (DownloadTask, DownloadEvents) {
        debug!(url = %options.url, destination = %options.destination.display(), "download task created");
        let (tx, rx) = mpsc::unbounded_channel();
        let task = DownloadTask::new(options, Arc::clone(&self.config), self.client.clone(), tx);
        (task, rx)
    }

    /// Download a file, ignoring progress events
    pub async fn download(
        &self,
        options: DownloadOptions,
    ) -> Result<DownloadSummary, DownloadError> {
        let (task, _events) = self.create_task(options);
        task.start_and_wait().await
    }

    /// No overall request timeout: bodies may legitimately take longer than
    /// any fixed limit, so stalls are caught per read instead.
    fn build_client(config: &DownloaderConfig) -> Result<reqwest::Client, BuildError> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout());
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        builder.build().context(HttpClientSnafu)
    }
}
