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

use async_trait::async_trait;
use std::{collections::BTreeMap, io::SeekFrom, time::Instant};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncSeekExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::Mutex,
};
use tokio_util::bytes::Bytes;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt as _;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("write of {len} bytes at offset {offset} failed: {source}")]
    Write {
        offset: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("segment at offset {offset} ({len} bytes) overlaps data already accepted")]
    Overlap { offset: u64, len: usize },
    #[error("output has a gap: expected offset {frontier}, next buffered segment starts at {next}")]
    Gap { frontier: u64, next: u64 },
    #[error("flush failed: {0}")]
    Flush(#[source] std::io::Error),
}

/// Where reassembled bytes end up.
#[async_trait]
pub trait Destination: Send {
    /// Whether segments can be placed at their absolute offset in any order.
    fn is_positioned(&self) -> bool;

    /// Write `data` at `offset`. Sequential destinations ignore the offset;
    /// the sink only calls them with the frontier.
    async fn write_segment(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;

    async fn flush(&mut self) -> std::io::Result<()>;
}

/// A regular file written with seek + write.
#[derive(Debug)]
pub struct PositionedFile {
    file: fs::File,
}

impl PositionedFile {
    pub fn new(file: fs::File) -> Self {
        Self { file }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> fs::File {
        self.file
    }
}

#[async_trait]
impl Destination for PositionedFile {
    fn is_positioned(&self) -> bool {
        true
    }

    async fn write_segment(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }
}

/// Any byte stream that can only be appended to (stdout, pipes, buffers).
#[derive(Debug)]
pub struct SequentialWriter<W> {
    inner: W,
}

impl<W> SequentialWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Destination for SequentialWriter<W> {
    fn is_positioned(&self) -> bool {
        false
    }

    async fn write_segment(&mut self, _offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(data).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

/// An out-of-order segment waiting for the frontier to reach it.
#[derive(Debug)]
struct PendingWrite {
    data: Bytes,
    arrived: Instant,
}

struct SinkState<D> {
    destination: D,
    /// Next offset a sequential destination expects.
    frontier: u64,
    pending: BTreeMap<u64, PendingWrite>,
    pending_bytes: usize,
    peak_pending_bytes: usize,
    /// Accepted spans in positioned mode, `start -> end`, adjacent spans merged.
    spans: BTreeMap<u64, u64>,
    written: u64,
}

impl<D: Destination> SinkState<D> {
    async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError> {
        self.destination
            .write_segment(offset, data)
            .await
            .map_err(|source| SinkError::Write {
                offset,
                len: data.len(),
                source,
            })?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn claim_span(&mut self, offset: u64, len: usize) -> Result<(), SinkError> {
        let end = offset + len as u64;
        let before = self.spans.range(..=offset).next_back().map(|(&s, &e)| (s, e));
        let after = self.spans.range(offset..).next().map(|(&s, &e)| (s, e));

        if before.is_some_and(|(_, e)| e > offset) || after.is_some_and(|(s, _)| s < end) {
            return Err(SinkError::Overlap { offset, len });
        }

        let mut start = offset;
        let mut end = end;
        if let Some((s, e)) = before
            && e == offset
        {
            self.spans.remove(&s);
            start = s;
        }
        if let Some((s, e)) = after
            && s == end
        {
            self.spans.remove(&s);
            end = e;
        }
        self.spans.insert(start, end);
        Ok(())
    }

    /// Write through every buffered segment that now starts at the frontier.
    async fn release_pending(&mut self) -> Result<u64, SinkError> {
        let mut released = 0;
        while let Some(entry) = self.pending.first_entry() {
            let offset = *entry.key();
            if offset > self.frontier {
                break;
            }
            let segment = entry.remove();
            self.pending_bytes -= segment.data.len();
            if offset < self.frontier {
                return Err(SinkError::Overlap {
                    offset,
                    len: segment.data.len(),
                });
            }

            tracing::trace!(
                offset,
                len = segment.data.len(),
                waited_ms = segment.arrived.elapsed().as_millis() as u64,
                "Releasing buffered segment"
            );
            self.write(offset, &segment.data).await?;
            self.frontier += segment.data.len() as u64;
            released += segment.data.len() as u64;
        }
        Ok(released)
    }
}

/// Accepts `(offset, bytes)` from any number of workers and hands them to the
/// destination in an order it can accept.
///
/// Positioned destinations get every segment immediately at its offset.
/// Sequential destinations get bytes strictly in offset order: segments ahead
/// of the frontier are buffered until everything before them has been
/// written.
pub struct OrderedSink<D> {
    state: Mutex<SinkState<D>>,
    positioned: bool,
    progress: Span,
}

impl<D: Destination> OrderedSink<D> {
    pub fn new(destination: D) -> Self {
        Self::with_progress(destination, Span::none())
    }

    /// Report written bytes to the progress bar attached to `progress`.
    pub fn with_progress(destination: D, progress: Span) -> Self {
        let positioned = destination.is_positioned();
        Self {
            state: Mutex::new(SinkState {
                destination,
                frontier: 0,
                pending: BTreeMap::new(),
                pending_bytes: 0,
                peak_pending_bytes: 0,
                spans: BTreeMap::new(),
                written: 0,
            }),
            positioned,
            progress,
        }
    }

    pub fn is_positioned(&self) -> bool {
        self.positioned
    }

    pub fn set_progress_length(&self, length: u64) {
        self.progress.pb_set_length(length);
    }

    pub async fn accept(&self, offset: u64, data: Bytes) -> Result<(), SinkError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;

        if self.positioned {
            state.claim_span(offset, data.len())?;
            state.write(offset, &data).await?;
            drop(state);
            self.progress.pb_inc(data.len() as u64);
            return Ok(());
        }

        if offset < state.frontier {
            return Err(SinkError::Overlap {
                offset,
                len: data.len(),
            });
        }

        if offset > state.frontier {
            if state.pending.contains_key(&offset) {
                return Err(SinkError::Overlap {
                    offset,
                    len: data.len(),
                });
            }
            state.pending_bytes += data.len();
            state.peak_pending_bytes = state.peak_pending_bytes.max(state.pending_bytes);
            state.pending.insert(
                offset,
                PendingWrite {
                    data,
                    arrived: Instant::now(),
                },
            );
            return Ok(());
        }

        state.write(offset, &data).await?;
        state.frontier += data.len() as u64;
        let released = state.release_pending().await?;
        drop(state);

        self.progress.pb_inc(data.len() as u64 + released);
        Ok(())
    }

    /// Bytes that have reached the destination so far.
    pub async fn written(&self) -> u64 {
        self.state.lock().await.written
    }

    /// Flush the destination. Fails if buffered segments could never be
    /// written because something before them is missing.
    pub async fn finish(&self) -> Result<u64, SinkError> {
        let mut state = self.state.lock().await;

        let flushed = state.destination.flush().await.map_err(SinkError::Flush);

        if let Some(&next) = state.pending.keys().next() {
            return Err(SinkError::Gap {
                frontier: state.frontier,
                next,
            });
        }
        flushed?;

        tracing::debug!(
            written = state.written,
            peak_buffered = state.peak_pending_bytes,
            "Output flushed"
        );
        Ok(state.written)
    }

    #[cfg(test)]
    pub fn into_destination(self) -> D {
        self.state.into_inner().destination
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn resource(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Split `data` at the given cut points into `(offset, bytes)` segments.
    fn segments(data: &[u8], cuts: &[usize]) -> Vec<(u64, Bytes)> {
        let mut bounds: Vec<usize> = cuts.iter().map(|&c| c % (data.len() + 1)).collect();
        bounds.push(0);
        bounds.push(data.len());
        bounds.sort_unstable();
        bounds.dedup();
        bounds
            .windows(2)
            .map(|w| (w[0] as u64, Bytes::copy_from_slice(&data[w[0]..w[1]])))
            .collect()
    }

    #[tokio::test]
    async fn sequential_in_order() {
        let sink = OrderedSink::new(SequentialWriter::new(Vec::new()));
        sink.accept(0, Bytes::from_static(b"hello ")).await.unwrap();
        sink.accept(6, Bytes::from_static(b"world")).await.unwrap();

        assert_eq!(sink.finish().await.unwrap(), 11);
        assert_eq!(sink.into_destination().into_inner(), b"hello world");
    }

    #[tokio::test]
    async fn sequential_buffers_until_frontier_arrives() {
        let sink = OrderedSink::new(SequentialWriter::new(Vec::new()));
        sink.accept(8, Bytes::from_static(b"89")).await.unwrap();
        sink.accept(4, Bytes::from_static(b"4567")).await.unwrap();
        assert_eq!(sink.written().await, 0);

        sink.accept(0, Bytes::from_static(b"0123")).await.unwrap();
        assert_eq!(sink.written().await, 10);

        assert_eq!(sink.finish().await.unwrap(), 10);
        assert_eq!(sink.into_destination().into_inner(), b"0123456789");
    }

    #[tokio::test]
    async fn sequential_rejects_rewrites() {
        let sink = OrderedSink::new(SequentialWriter::new(Vec::new()));
        sink.accept(0, Bytes::from_static(b"0123")).await.unwrap();

        let err = sink.accept(2, Bytes::from_static(b"23")).await.unwrap_err();
        assert!(matches!(err, SinkError::Overlap { offset: 2, len: 2 }));

        sink.accept(6, Bytes::from_static(b"67")).await.unwrap();
        let err = sink.accept(6, Bytes::from_static(b"67")).await.unwrap_err();
        assert!(matches!(err, SinkError::Overlap { offset: 6, .. }));
    }

    #[tokio::test]
    async fn sequential_detects_buffered_segment_straddling_frontier() {
        let sink = OrderedSink::new(SequentialWriter::new(Vec::new()));
        sink.accept(2, Bytes::from_static(b"23")).await.unwrap();

        let err = sink.accept(0, Bytes::from_static(b"012")).await.unwrap_err();
        assert!(matches!(err, SinkError::Overlap { offset: 2, .. }));
    }

    #[tokio::test]
    async fn finish_reports_gaps() {
        let sink = OrderedSink::new(SequentialWriter::new(Vec::new()));
        sink.accept(0, Bytes::from_static(b"01")).await.unwrap();
        sink.accept(5, Bytes::from_static(b"56")).await.unwrap();

        let err = sink.finish().await.unwrap_err();
        assert!(matches!(err, SinkError::Gap { frontier: 2, next: 5 }));
        assert_eq!(sink.written().await, 2);
    }

    #[tokio::test]
    async fn empty_segments_are_ignored() {
        let sink = OrderedSink::new(SequentialWriter::new(Vec::new()));
        sink.accept(7, Bytes::new()).await.unwrap();
        assert_eq!(sink.finish().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn positioned_writes_out_of_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.bin");
        let file = fs::File::create(&path).await.unwrap();

        let sink = OrderedSink::new(PositionedFile::new(file));
        assert!(sink.is_positioned());

        sink.accept(6, Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(sink.written().await, 5);
        sink.accept(0, Bytes::from_static(b"hello ")).await.unwrap();
        assert_eq!(sink.finish().await.unwrap(), 11);
        drop(sink.into_destination().into_inner());

        assert_eq!(fs::read(&path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn positioned_rejects_overlap() {
        let temp_dir = TempDir::new().unwrap();
        let file = fs::File::create(temp_dir.path().join("out.bin"))
            .await
            .unwrap();

        let sink = OrderedSink::new(PositionedFile::new(file));
        sink.accept(0, Bytes::from_static(b"0123")).await.unwrap();
        sink.accept(8, Bytes::from_static(b"89")).await.unwrap();
        sink.accept(4, Bytes::from_static(b"4567")).await.unwrap();

        let err = sink.accept(3, Bytes::from_static(b"3")).await.unwrap_err();
        assert!(matches!(err, SinkError::Overlap { offset: 3, len: 1 }));
        let err = sink.accept(9, Bytes::from_static(b"9A")).await.unwrap_err();
        assert!(matches!(err, SinkError::Overlap { offset: 9, .. }));

        sink.accept(10, Bytes::from_static(b"AB")).await.unwrap();
        assert_eq!(sink.finish().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn concurrent_workers_reassemble_in_order() {
        let data = resource(64 * 1024);
        let sink = Arc::new(OrderedSink::new(SequentialWriter::new(Vec::new())));

        let mut handles = Vec::new();
        for worker in 0..8usize {
            let sink = sink.clone();
            let span = data[worker * 8192..(worker + 1) * 8192].to_vec();
            handles.push(tokio::spawn(async move {
                // Later workers deliver first to exercise buffering.
                tokio::task::yield_now().await;
                for (i, piece) in span.chunks(1000).enumerate() {
                    let offset = (worker * 8192 + i * 1000) as u64;
                    sink.accept(offset, Bytes::copy_from_slice(piece)).await.unwrap();
                }
            }));
        }
        for handle in handles.into_iter().rev() {
            handle.await.unwrap();
        }

        let sink = Arc::into_inner(sink).unwrap();
        assert_eq!(sink.finish().await.unwrap(), data.len() as u64);
        assert_eq!(sink.into_destination().into_inner(), data);
    }

    /// A resource cut into segments, delivered in a random order.
    fn shuffled_segments() -> impl Strategy<Value = (Vec<u8>, Vec<(u64, Bytes)>)> {
        (1usize..4096, proptest::collection::vec(any::<usize>(), 0..16)).prop_flat_map(
            |(len, cuts)| {
                let data = resource(len);
                let segs = segments(&data, &cuts);
                (Just(data), Just(segs).prop_shuffle())
            },
        )
    }

    proptest! {
        #[test]
        fn any_delivery_order_reproduces_resource((data, segs) in shuffled_segments()) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let out = runtime.block_on(async {
                let sink = OrderedSink::new(SequentialWriter::new(Vec::new()));
                for (offset, bytes) in segs {
                    sink.accept(offset, bytes).await.unwrap();
                }
                assert_eq!(sink.finish().await.unwrap(), data.len() as u64);
                sink.into_destination().into_inner()
            });
            prop_assert_eq!(out, data);
        }
    }
}
