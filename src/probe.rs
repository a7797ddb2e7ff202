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

use reqwest::{StatusCode, Url, header};
use std::error::Error as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Access denied probing {url}: {status_code}")]
    Unauthorized { url: String, status_code: StatusCode },
    #[error("Unexpected status {status_code} probing {url}")]
    Status { url: String, status_code: StatusCode },
    #[error("Network error {error} probing {url}")]
    Network { url: String, error: String },
}

impl ProbeError {
    /// Only access failures stop the session; anything else falls back to a
    /// single unranged fetch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::Unauthorized { .. })
    }
}

/// What the server told us about the resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    pub length: Option<u64>,
    pub range_supported: bool,
}

/// A satisfied `Content-Range` value, `bytes <start>-<end>/<complete>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    /// `None` when the server sent `*`.
    pub complete: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (span, complete) = spec.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let complete = match complete.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    Some(ContentRange {
        start,
        end,
        complete,
    })
}

/// Complete length from an unsatisfied `Content-Range`, `bytes */<complete>`.
fn parse_unsatisfied_length(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes */")
        .and_then(|n| n.trim().parse().ok())
}

pub fn is_unauthorized(status_code: StatusCode) -> bool {
    matches!(
        status_code,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::PROXY_AUTHENTICATION_REQUIRED
    )
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Ask for the first byte only. The body is never read past the headers.
pub async fn probe(client: &reqwest::Client, url: &Url) -> Result<Probe, ProbeError> {
    let response = client
        .get(url.clone())
        .header(header::RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|err| ProbeError::Network {
            url: url.to_string(),
            error: err
                .source()
                .map(|e| e.to_string())
                .unwrap_or_else(|| err.to_string()),
        })?;

    let headers = response.headers();
    let status_code = response.status();

    let probe = match status_code {
        StatusCode::PARTIAL_CONTENT => {
            let length = header_str(headers, header::CONTENT_RANGE)
                .and_then(parse_content_range)
                .and_then(|range| range.complete);
            Probe {
                length,
                range_supported: length.is_some(),
            }
        }
        StatusCode::OK => {
            let length = header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.parse().ok());
            let accepts_bytes = header_str(headers, header::ACCEPT_RANGES)
                .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));
            Probe {
                length,
                range_supported: length.is_some() && accepts_bytes,
            }
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            // The only way `bytes=0-0` is unsatisfiable is an empty resource.
            match header_str(headers, header::CONTENT_RANGE).and_then(parse_unsatisfied_length) {
                Some(0) => Probe {
                    length: Some(0),
                    range_supported: true,
                },
                _ => {
                    return Err(ProbeError::Status {
                        url: url.to_string(),
                        status_code,
                    });
                }
            }
        }
        status_code if is_unauthorized(status_code) => {
            return Err(ProbeError::Unauthorized {
                url: url.to_string(),
                status_code,
            });
        }
        status_code => {
            return Err(ProbeError::Status {
                url: url.to_string(),
                status_code,
            });
        }
    };

    tracing::debug!(
        length = ?probe.length,
        range_supported = probe.range_supported,
        "Probed {url}: {status_code}"
    );

    Ok(probe)
}
