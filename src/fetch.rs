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

use futures::StreamExt as _;
use reqwest::{StatusCode, Url, header};
use std::{error::Error as _, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::partition::ByteRange;
use crate::probe::{is_unauthorized, parse_content_range};
use crate::sink::{Destination, OrderedSink, SinkError};

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Access denied: {status_code}")]
    Unauthorized { status_code: StatusCode },
    #[error("Client error {status_code}: not retrying")]
    Client { status_code: StatusCode },
    #[error("Server rejected range {range} as not satisfiable")]
    RangeNotSatisfiable { range: ByteRange },
    #[error("Unexpected status {status_code}")]
    UnexpectedStatus { status_code: StatusCode },
    #[error("Malformed response: {reason}")]
    Malformed { reason: String },
    #[error("HTTP error {status_code}: failed after {retries} retries")]
    Http {
        status_code: StatusCode,
        retries: usize,
    },
    #[error("Network error {error}: failed after {retries} retries")]
    Network { error: String, retries: usize },
    #[error("Body ended at offset {reached} before {expected}: failed after {retries} retries")]
    Truncated {
        expected: u64,
        reached: u64,
        retries: usize,
    },
    #[error("Server ignored the range request when resuming at offset {offset}")]
    ResumeUnsupported { offset: u64 },
    #[error("Output error: {0}")]
    Sink(#[from] SinkError),
}

impl FetchError {
    fn with_retries(mut self, count: usize) -> Self {
        match &mut self {
            FetchError::Http { retries, .. }
            | FetchError::Network { retries, .. }
            | FetchError::Truncated { retries, .. } => *retries = count,
            _ => {}
        }
        self
    }
}

/// Internal error classification for retry logic
#[derive(Debug)]
enum AttemptError {
    /// Fatal error that should not be retried
    Fatal(FetchError),
    /// Retriable error that may succeed on retry
    Retriable(FetchError),
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `retry` (1-based).
    fn delay(&self, retry: usize) -> Duration {
        self.base_delay * 2u32.pow(retry.saturating_sub(1).min(10) as u32)
    }
}

/// One span of the resource, owned by one worker.
#[derive(Debug)]
pub struct FetchTask {
    pub index: usize,
    pub range: ByteRange,
    /// Next offset to deliver. Never moves backwards.
    pub cursor: u64,
    pub retries: usize,
    /// The span is the entire resource, so a plain `200` is acceptable.
    whole: bool,
}

impl FetchTask {
    pub fn new(index: usize, range: ByteRange, whole: bool) -> Self {
        Self {
            index,
            range,
            cursor: range.start,
            retries: 0,
            whole,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.cursor - self.range.start
    }

    fn is_done(&self) -> bool {
        self.range.end == Some(self.cursor)
    }
}

/// Outcome of one task.
#[derive(Debug)]
pub enum ChunkResult {
    Completed {
        index: usize,
        delivered: u64,
        reached: u64,
    },
    Failed {
        index: usize,
        delivered: u64,
        reached: u64,
        error: FetchError,
    },
    /// Stopped because another task failed.
    Cancelled {
        index: usize,
        delivered: u64,
        reached: u64,
    },
}

enum TaskState {
    Attempting,
    Retrying(FetchError),
    Succeeded,
    Failed(FetchError),
    Cancelled,
}

fn network_error(err: reqwest::Error) -> FetchError {
    FetchError::Network {
        error: err
            .source()
            .map(|e| e.to_string())
            .unwrap_or_else(|| err.to_string()),
        retries: 0,
    }
}

async fn fetch_once<D: Destination>(
    client: &reqwest::Client,
    url: &Url,
    task: &mut FetchTask,
    sink: &OrderedSink<D>,
) -> Result<(), AttemptError> {
    let resuming = task.cursor > task.range.start;
    let mut request = client.get(url.clone());
    // A fresh fetch of the whole resource is a plain GET.
    if !task.whole || resuming {
        request = request.header(header::RANGE, task.range.header_from(task.cursor));
    }

    let response = request
        .send()
        .await
        .map_err(|err| AttemptError::Retriable(network_error(err)))?;

    let status_code = response.status();
    match status_code {
        StatusCode::PARTIAL_CONTENT => {
            let content_range = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .ok_or_else(|| {
                    AttemptError::Fatal(FetchError::Malformed {
                        reason: "missing or invalid Content-Range".to_string(),
                    })
                })?;
            if let Some(end) = task.range.end
                && content_range.end >= end
            {
                return Err(AttemptError::Fatal(FetchError::Malformed {
                    reason: format!(
                        "Content-Range ends at {} past range {}",
                        content_range.end, task.range
                    ),
                }));
            }
            if content_range.start != task.cursor {
                return Err(AttemptError::Fatal(FetchError::Malformed {
                    reason: format!(
                        "Content-Range starts at {} instead of {}",
                        content_range.start, task.cursor
                    ),
                }));
            }
        }
        StatusCode::OK if task.whole && task.cursor == 0 => {}
        StatusCode::OK if resuming => {
            return Err(AttemptError::Fatal(FetchError::ResumeUnsupported {
                offset: task.cursor,
            }));
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            return Err(AttemptError::Fatal(FetchError::RangeNotSatisfiable {
                range: task.range,
            }));
        }
        status_code if is_unauthorized(status_code) => {
            return Err(AttemptError::Fatal(FetchError::Unauthorized { status_code }));
        }
        status_code if status_code.is_client_error() => {
            return Err(AttemptError::Fatal(FetchError::Client { status_code }));
        }
        status_code if status_code.is_server_error() => {
            return Err(AttemptError::Retriable(FetchError::Http {
                status_code,
                retries: 0,
            }));
        }
        status_code => {
            return Err(AttemptError::Fatal(FetchError::UnexpectedStatus { status_code }));
        }
    }

    // Once the headers are in, the body is read to the end even if the
    // session is cancelled meanwhile.
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| AttemptError::Retriable(network_error(err)))?;

        if let Some(end) = task.range.end
            && task.cursor + chunk.len() as u64 > end
        {
            return Err(AttemptError::Fatal(FetchError::Malformed {
                reason: format!("body runs past the end of range {}", task.range),
            }));
        }

        let len = chunk.len() as u64;
        sink.accept(task.cursor, chunk)
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;
        task.cursor += len;

        if task.is_done() {
            return Ok(());
        }
    }

    match task.range.end {
        Some(end) if task.cursor < end => Err(AttemptError::Retriable(FetchError::Truncated {
            expected: end,
            reached: task.cursor,
            retries: 0,
        })),
        _ => Ok(()),
    }
}

/// Fetch one span into `sink`, retrying the undelivered remainder on
/// transient failures.
pub async fn fetch<D: Destination>(
    client: &reqwest::Client,
    url: &Url,
    mut task: FetchTask,
    sink: &OrderedSink<D>,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> ChunkResult {
    tracing::debug!(index = task.index, len = ?task.range.len(), "Fetching {}", task.range);

    let mut state = TaskState::Attempting;
    loop {
        state = match state {
            TaskState::Attempting if cancel.is_cancelled() => TaskState::Cancelled,
            TaskState::Attempting => {
                match fetch_once(client, url, &mut task, sink).await {
                    Ok(()) => TaskState::Succeeded,
                    Err(AttemptError::Fatal(err)) => TaskState::Failed(err),
                    Err(AttemptError::Retriable(err)) if task.retries < policy.max_retries => {
                        TaskState::Retrying(err)
                    }
                    Err(AttemptError::Retriable(err)) => {
                        TaskState::Failed(err.with_retries(task.retries))
                    }
                }
            }
            TaskState::Retrying(err) => {
                task.retries += 1;
                let delay = policy.delay(task.retries);
                tracing::warn!(
                    index = task.index,
                    offset = task.cursor,
                    "{err}; retry {}/{} in {delay:?}",
                    task.retries,
                    policy.max_retries
                );
                tokio::select! {
                    _ = cancel.cancelled() => TaskState::Cancelled,
                    _ = sleep(delay) => TaskState::Attempting,
                }
            }
            TaskState::Succeeded => {
                tracing::debug!(index = task.index, delivered = task.delivered(), "Fetched {}", task.range);
                return ChunkResult::Completed {
                    index: task.index,
                    delivered: task.delivered(),
                    reached: task.cursor,
                };
            }
            TaskState::Failed(error) => {
                return ChunkResult::Failed {
                    index: task.index,
                    delivered: task.delivered(),
                    reached: task.cursor,
                    error,
                };
            }
            TaskState::Cancelled => {
                tracing::debug!(index = task.index, offset = task.cursor, "Fetch cancelled");
                return ChunkResult::Cancelled {
                    index: task.index,
                    delivered: task.delivered(),
                    reached: task.cursor,
                };
            }
        };
    }
}
