use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use anyhow::Result;
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use futures::stream::BoxStream;

use super::record::LogRecord;

/// Head of one source inside the merge heap, ordered by `(time, source)`
struct HeapEntry {
    time: DateTime<Utc>,
    source: usize,
    record: LogRecord,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then(self.source.cmp(&other.source))
    }
}

/// K-way merge of individually time-ordered record streams
///
/// Equal timestamps are emitted in source order, so the position of a stream in
/// `sources` is its precedence. Only one record per source is buffered.
pub fn merge_sorted(
    sources: Vec<BoxStream<'static, Result<LogRecord>>>,
) -> BoxStream<'static, Result<LogRecord>> {
    Box::pin(try_stream! {
        let mut sources = sources;
        let mut heap = BinaryHeap::with_capacity(sources.len());

        for (source, stream) in sources.iter_mut().enumerate() {
            if let Some(record) = stream.try_next().await? {
                heap.push(Reverse(HeapEntry { time: record.time, source, record }));
            }
        }

        while let Some(Reverse(entry)) = heap.pop() {
            let source = entry.source;
            yield entry.record;

            if let Some(record) = sources[source].try_next().await? {
                heap.push(Reverse(HeapEntry { time: record.time, source, record }));
            }
        }
    })
}
