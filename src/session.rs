// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use reqwest::Url;
use std::{num::NonZeroUsize, sync::Arc};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::fetch::{ChunkResult, FetchError, FetchTask, RetryPolicy, fetch};
use crate::partition::partition;
use crate::probe::{Probe, ProbeError, probe};
use crate::sink::{Destination, OrderedSink, SinkError};

pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("Range {index} failed: {source}")]
    Fetch {
        index: usize,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("Resource is {expected} bytes but {written} were written")]
    Short { expected: u64, written: u64 },
    #[error("Transfer cancelled")]
    Cancelled,
    #[error("Fetch worker failed: {0}")]
    Worker(#[from] JoinError),
}

/// A failed session, with whatever made it to the destination before it
/// stopped. That output is left in place.
#[derive(Error, Debug)]
#[error("{source} ({written} bytes written)")]
pub struct SessionError {
    pub written: u64,
    #[source]
    pub source: TransferError,
}

#[derive(Clone, Copy, Debug)]
pub struct TransferConfig {
    pub concurrency: NonZeroUsize,
    pub retry: RetryPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Probing,
    Partitioning,
    Fetching,
    Draining,
    Done,
    Failed,
}

/// One download of one resource.
pub struct Session {
    client: reqwest::Client,
    url: Url,
    config: TransferConfig,
    cancel: CancellationToken,
    state: SessionState,
    probe: Option<Probe>,
}

impl Session {
    pub fn new(client: reqwest::Client, url: Url, config: TransferConfig) -> Self {
        Self {
            client,
            url,
            config,
            cancel: CancellationToken::new(),
            state: SessionState::Init,
            probe: None,
        }
    }

    /// Stop the transfer when `cancel` fires (e.g. on ctrl-c).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn probe(&self) -> Option<Probe> {
        self.probe
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn fail<D: Destination>(
        &mut self,
        sink: &OrderedSink<D>,
        source: TransferError,
    ) -> Result<u64, SessionError> {
        self.transition(SessionState::Failed);
        Err(SessionError {
            written: sink.written().await,
            source,
        })
    }

    /// Fetch the resource into `sink`, returning the number of bytes written.
    pub async fn run<D: Destination + 'static>(
        &mut self,
        sink: Arc<OrderedSink<D>>,
    ) -> Result<u64, SessionError> {
        self.transition(SessionState::Probing);
        let probed = match probe(&self.client, &self.url).await {
            Ok(probed) => probed,
            Err(err) if err.is_fatal() => return self.fail(&*sink, err.into()).await,
            Err(err) => {
                tracing::warn!("{err}; falling back to a single stream");
                Probe {
                    length: None,
                    range_supported: false,
                }
            }
        };
        self.probe = Some(probed);
        if let Some(length) = probed.length {
            sink.set_progress_length(length);
        }

        self.transition(SessionState::Partitioning);
        let plan = partition(probed.length, probed.range_supported, self.config.concurrency);
        if plan.is_fallback() {
            tracing::info!("Server does not support ranged requests, using a single stream");
        } else {
            tracing::debug!(
                positioned = sink.is_positioned(),
                "Fetching {} ranges",
                plan.ranges().len()
            );
        }

        self.transition(SessionState::Fetching);
        let whole = plan.ranges().len() == 1;
        let cancel = self.cancel.child_token();
        let mut workers = JoinSet::new();
        for (index, &range) in plan.ranges().iter().enumerate() {
            let client = self.client.clone();
            let url = self.url.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            let retry = self.config.retry;
            workers.spawn(async move {
                let task = FetchTask::new(index, range, whole);
                fetch(&client, &url, task, &sink, retry, &cancel).await
            });
        }

        // A failing range only stops new requests. An interrupt from the
        // caller also drops the reads in flight.
        let interrupt = self.cancel.clone();
        let mut interrupted = false;
        let mut first_error = None;
        let mut cancelled = false;
        loop {
            let joined = tokio::select! {
                joined = workers.join_next() => joined,
                _ = interrupt.cancelled(), if !interrupted => {
                    tracing::debug!("Interrupted, aborting {} workers", workers.len());
                    workers.abort_all();
                    interrupted = true;
                    cancelled = true;
                    continue;
                }
            };
            let Some(joined) = joined else {
                break;
            };
            let error = match joined {
                Ok(ChunkResult::Completed {
                    index,
                    delivered,
                    reached,
                }) => {
                    tracing::debug!(index, delivered, reached, "Range {index} done");
                    continue;
                }
                Ok(ChunkResult::Cancelled {
                    index,
                    delivered,
                    reached,
                }) => {
                    tracing::debug!(index, delivered, reached, "Range {index} stopped");
                    cancelled = true;
                    continue;
                }
                Ok(ChunkResult::Failed {
                    index,
                    delivered,
                    reached,
                    error,
                }) => {
                    tracing::error!(index, delivered, reached, "Range {index} failed: {error}");
                    match error {
                        FetchError::Sink(err) => {
                            // The output is unusable; nothing in flight can help.
                            workers.abort_all();
                            TransferError::Sink(err)
                        }
                        source => TransferError::Fetch { index, source },
                    }
                }
                Err(err) if err.is_cancelled() => {
                    cancelled = true;
                    continue;
                }
                Err(err) => TransferError::Worker(err),
            };
            cancel.cancel();
            first_error.get_or_insert(error);
        }

        self.transition(SessionState::Draining);
        let finished = sink.finish().await;

        if let Some(error) = first_error {
            return self.fail(&*sink, error).await;
        }
        if cancelled {
            return self.fail(&*sink, TransferError::Cancelled).await;
        }
        let checked = finished
            .map_err(TransferError::from)
            .and_then(|written| check_length(probed.length, written));
        let written = match checked {
            Ok(written) => written,
            Err(err) => return self.fail(&*sink, err).await,
        };

        self.transition(SessionState::Done);
        tracing::info!("Wrote {written} bytes from {}", self.url);
        Ok(written)
    }
}

/// A known length must match what reached the destination.
fn check_length(expected: Option<u64>, written: u64) -> Result<u64, TransferError> {
    match expected {
        Some(expected) if written != expected => Err(TransferError::Short { expected, written }),
        _ => Ok(written),
    }
}
