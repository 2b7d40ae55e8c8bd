use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use chrono::TimeDelta;
use parking_lot::RwLock;
use crate::drivers::decimate::decimate_min_max;
use crate::drivers::error::QueryError;
use crate::types::{ChannelId, SampleBatch, Timestamp, MAX_CHANNELS};
use crate::window::TimeWindow;
/// Points per sealed segment. Sealed segments are immutable and shared with readers.
const SEGMENT_LEN: usize = 4096;
/// How far back the store keeps samples, measured from the newest one.
pub fn default_retention() -> TimeDelta {
    TimeDelta::hours(24)
}
/// One stored raw observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: f64,
}
/// Upper bound on points returned per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointLimit {
    Max(usize),
    /// Full resolution, used by export.
    Unbounded,
}
/// Raw points for one channel within a queried window.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSeries {
    pub channel: ChannelId,
    pub points: Vec<Point>,
    /// Raw samples inside the window before decimation.
    pub raw_count: usize,
}
impl ChannelSeries {
    pub fn is_decimated(&self) -> bool {
        self.points.len() < self.raw_count
    }
}
/// Result of one query. Owned, so later insertions never change it.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreSnapshot {
    pub window: TimeWindow,
    /// Newest sample in the store when the snapshot was taken.
    pub as_of: Option<Timestamp>,
    /// Insertion counter at snapshot time; equal generations mean equal data.
    pub generation: u64,
    pub series: Vec<ChannelSeries>,
}
impl StoreSnapshot {
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelSeries> {
        self.series.iter().find(|s| s.channel == id)
    }
    pub fn total_points(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }
}
/// Append-only history of one channel with a movable retention cursor.
#[derive(Default)]
struct ChannelHistory {
    sealed: VecDeque<Arc<[Point]>>,
    /// First live index inside `sealed.front()`.
    head: usize,
    tail: Vec<Point>,
    len: usize,
}
impl ChannelHistory {
    fn push(&mut self, mut point: Point) {
        if let Some(last) = self.last() {
            if point.timestamp < last.timestamp {
                point.timestamp = last.timestamp;
            }
        }
        self.tail.push(point);
        self.len += 1;
        if self.tail.len() == SEGMENT_LEN {
            let full = std::mem::replace(&mut self.tail, Vec::with_capacity(SEGMENT_LEN));
            self.sealed.push_back(Arc::from(full));
        }
    }
    fn last(&self) -> Option<&Point> {
        self.tail
            .last()
            .or_else(|| self.sealed.back().and_then(|s| s.last()))
    }
    /// Drops every point older than `cutoff`. Touches only the segments that go.
    fn evict_before(&mut self, cutoff: Timestamp) {
        while let Some(front) = self.sealed.front() {
            let newest = front[front.len() - 1].timestamp;
            if newest < cutoff {
                self.len -= front.len() - self.head;
                self.sealed.pop_front();
                self.head = 0;
                continue;
            }
            let keep_from = front.partition_point(|p| p.timestamp < cutoff).max(self.head);
            self.len -= keep_from - self.head;
            self.head = keep_from;
            return;
        }
        let drop = self.tail.partition_point(|p| p.timestamp < cutoff);
        if drop > 0 {
            self.tail.drain(..drop);
            self.len -= drop;
        }
    }
    /// Segment handles and ranges overlapping `start..=end`. Cheap: clones Arcs only.
    fn collect(&self, start: Timestamp, end: Timestamp) -> Vec<(Arc<[Point]>, Range<usize>)> {
        let mut parts = Vec::new();
        for (i, segment) in self.sealed.iter().enumerate() {
            let live = if i == 0 { self.head } else { 0 };
            let slice = &segment[live..];
            if slice.last().map_or(true, |p| p.timestamp < start) {
                continue;
            }
            if slice[0].timestamp > end {
                return parts;
            }
            let from = live + slice.partition_point(|p| p.timestamp < start);
            let to = live + slice.partition_point(|p| p.timestamp <= end);
            parts.push((Arc::clone(segment), from..to));
        }
        let from = self.tail.partition_point(|p| p.timestamp < start);
        let to = self.tail.partition_point(|p| p.timestamp <= end);
        if from < to {
            parts.push((Arc::from(&self.tail[from..to]), 0..to - from));
        }
        parts
    }
}
struct StoreInner {
    channels: [ChannelHistory; MAX_CHANNELS],
    newest: Option<Timestamp>,
    generation: u64,
}
/// Rolling in-memory history for all channels, shared between the
/// ingestion thread and any number of readers.
///
/// Writers hold the lock for one batch; readers hold it only long enough to
/// clone segment handles, so filtering and decimation run unlocked.
pub struct TimeseriesStore {
    inner: RwLock<StoreInner>,
    retention: TimeDelta,
}
impl Default for TimeseriesStore {
    fn default() -> Self {
        Self::new()
    }
}
impl TimeseriesStore {
    pub fn new() -> Self {
        Self::with_retention(default_retention())
    }
    pub fn with_retention(retention: TimeDelta) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                channels: std::array::from_fn(|_| ChannelHistory::default()),
                newest: None,
                generation: 0,
            }),
            retention,
        }
    }
    pub fn retention(&self) -> TimeDelta {
        self.retention
    }
    /// Appends a batch in order, then evicts everything older than the horizon.
    pub fn insert_batch(&self, batch: &SampleBatch) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for sample in batch {
            inner.channels[sample.channel.index()].push(Point {
                timestamp: sample.timestamp,
                value: sample.raw_value,
            });
            if inner.newest.map_or(true, |n| sample.timestamp > n) {
                inner.newest = Some(sample.timestamp);
            }
        }
        if let Some(newest) = inner.newest {
            let cutoff = newest - self.retention;
            for channel in inner.channels.iter_mut() {
                channel.evict_before(cutoff);
            }
        }
        inner.generation += 1;
    }
    pub fn query(&self, window: &TimeWindow, limit: PointLimit) -> Result<StoreSnapshot, QueryError> {
        let (start, end) = (window.start(), window.end());
        if start > end {
            return Err(QueryError::InvalidWindow { start, end });
        }
        if limit == PointLimit::Max(0) {
            return Err(QueryError::ZeroPointBudget);
        }
        let (parts, as_of, generation) = {
            let inner = self.inner.read();
            let parts: Vec<_> = ChannelId::all()
                .map(|id| (id, inner.channels[id.index()].collect(start, end)))
                .collect();
            (parts, inner.newest, inner.generation)
        };
        let series = parts
            .into_iter()
            .map(|(channel, segments)| {
                let raw_count = segments.iter().map(|(_, r)| r.len()).sum();
                let mut points = Vec::with_capacity(raw_count);
                for (segment, range) in &segments {
                    points.extend_from_slice(&segment[range.clone()]);
                }
                if let PointLimit::Max(max) = limit {
                    if points.len() > max {
                        points = decimate_min_max(&points, max);
                    }
                }
                ChannelSeries {
                    channel,
                    points,
                    raw_count,
                }
            })
            .collect();
        Ok(StoreSnapshot {
            window: *window,
            as_of,
            generation,
            series,
        })
    }
    /// Newest raw point per channel slot.
    pub fn latest(&self) -> [Option<Point>; MAX_CHANNELS] {
        let inner = self.inner.read();
        std::array::from_fn(|i| inner.channels[i].last().copied())
    }
    pub fn newest_timestamp(&self) -> Option<Timestamp> {
        self.inner.read().newest
    }
    pub fn oldest_timestamp(&self) -> Option<Timestamp> {
        let inner = self.inner.read();
        inner
            .channels
            .iter()
            .filter_map(|c| match c.sealed.front() {
                Some(front) => front.get(c.head).map(|p| p.timestamp),
                None => c.tail.first().map(|p| p.timestamp),
            })
            .min()
    }
    pub fn len(&self, channel: ChannelId) -> usize {
        self.inner.read().channels[channel.index()].len
    }
    pub fn total_len(&self) -> usize {
        self.inner.read().channels.iter().map(|c| c.len).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sample;
    use chrono::{TimeZone, Utc};
    use std::thread;
    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }
    fn ch(i: usize) -> ChannelId {
        ChannelId::new(i).unwrap()
    }
    fn batch_at(seconds: i64, values: &[f64]) -> SampleBatch {
        let ts = t0() + TimeDelta::seconds(seconds);
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Sample::new(ch(i), ts, v))
            .collect()
    }
    fn pinned(from: i64, to: i64) -> TimeWindow {
        TimeWindow::pinned(t0() + TimeDelta::seconds(from), t0() + TimeDelta::seconds(to)).unwrap()
    }
    #[test]
    fn query_returns_only_points_inside_the_window() {
        let store = TimeseriesStore::new();
        for s in 0..100 {
            store.insert_batch(&batch_at(s, &[s as f64, -(s as f64)]));
        }
        let snap = store.query(&pinned(10, 19), PointLimit::Unbounded).unwrap();
        let series = snap.channel(ch(0)).unwrap();
        assert_eq!(series.points.len(), 10);
        assert_eq!(series.points[0].value, 10.0);
        assert_eq!(series.points[9].value, 19.0);
        for p in &snap.channel(ch(1)).unwrap().points {
            assert!(p.timestamp >= snap.window.start() && p.timestamp <= snap.window.end());
        }
        assert!(snap.channel(ch(5)).unwrap().points.is_empty());
        assert_eq!(snap.as_of, Some(t0() + TimeDelta::seconds(99)));
    }
    #[test]
    fn queries_span_sealed_segments_and_tail() {
        let store = TimeseriesStore::new();
        let total = SEGMENT_LEN as i64 * 2 + 100;
        for s in 0..total {
            store.insert_batch(&batch_at(s, &[s as f64]));
        }
        let from = SEGMENT_LEN as i64 - 5;
        let snap = store.query(&pinned(from, total), PointLimit::Unbounded).unwrap();
        let points = &snap.channel(ch(0)).unwrap().points;
        assert_eq!(points.len() as i64, total - from);
        assert!(points.windows(2).all(|w| w[1].value == w[0].value + 1.0));
    }
    #[test]
    fn decimated_queries_keep_the_anomaly() {
        let store = TimeseriesStore::new();
        for s in 0..20_000 {
            let v = if s == 12_345 { 99.0 } else { 1.0 };
            store.insert_batch(&batch_at(s, &[v]));
        }
        let snap = store.query(&pinned(0, 20_000), PointLimit::Max(200)).unwrap();
        let series = snap.channel(ch(0)).unwrap();
        assert!(series.points.len() <= 200);
        assert!(series.is_decimated());
        assert_eq!(series.raw_count, 20_000);
        assert!(series.points.iter().any(|p| p.value == 99.0));
    }
    #[test]
    fn eviction_enforces_the_horizon() {
        let store = TimeseriesStore::with_retention(TimeDelta::hours(24));
        let step = 60;
        let end = 30 * 3600;
        for s in (0..=end).step_by(step) {
            store.insert_batch(&batch_at(s as i64, &[1.0]));
        }
        let newest = t0() + TimeDelta::seconds(end as i64);
        let horizon = newest - TimeDelta::hours(24);
        let snap = store
            .query(&TimeWindow::pinned(t0(), newest).unwrap(), PointLimit::Unbounded)
            .unwrap();
        let points = &snap.channel(ch(0)).unwrap().points;
        assert!(points.iter().all(|p| p.timestamp >= horizon));
        assert_eq!(points.len(), 24 * 60 + 1);
        assert_eq!(store.len(ch(0)), points.len());
        assert_eq!(store.oldest_timestamp(), Some(horizon));
    }
    #[test]
    fn repeated_pinned_queries_are_identical() {
        let store = TimeseriesStore::new();
        for s in 0..500 {
            store.insert_batch(&batch_at(s, &[(s as f64).sin(), (s as f64).cos()]));
        }
        let w = pinned(100, 400);
        let a = store.query(&w, PointLimit::Max(50)).unwrap();
        let b = store.query(&w, PointLimit::Max(50)).unwrap();
        assert_eq!(a, b);
    }
    #[test]
    fn snapshots_do_not_change_after_later_inserts() {
        let store = TimeseriesStore::new();
        store.insert_batch(&batch_at(0, &[1.0]));
        let snap = store.query(&pinned(0, 10), PointLimit::Unbounded).unwrap();
        store.insert_batch(&batch_at(5, &[2.0]));
        assert_eq!(snap.channel(ch(0)).unwrap().points.len(), 1);
        assert!(store.generation() > snap.generation);
    }
    #[test]
    fn zero_budget_is_rejected() {
        let store = TimeseriesStore::new();
        assert_eq!(
            store.query(&pinned(0, 1), PointLimit::Max(0)),
            Err(QueryError::ZeroPointBudget)
        );
    }
    #[test]
    fn latest_tracks_the_newest_value_per_channel() {
        let store = TimeseriesStore::new();
        store.insert_batch(&batch_at(0, &[1.0, 2.0]));
        store.insert_batch(&batch_at(1, &[3.0]));
        let latest = store.latest();
        assert_eq!(latest[0].map(|p| p.value), Some(3.0));
        assert_eq!(latest[1].map(|p| p.value), Some(2.0));
        assert_eq!(latest[2], None);
    }
    #[test]
    fn concurrent_queries_see_whole_batches_only() {
        let store = Arc::new(TimeseriesStore::new());
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..1000 {
                    store.insert_batch(&batch_at(i, &[i as f64; MAX_CHANNELS]));
                }
            })
        };
        let window = pinned(0, 1000);
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let snap = store.query(&window, PointLimit::Unbounded).unwrap();
                        let counts: Vec<usize> = snap.series.iter().map(|s| s.points.len()).collect();
                        assert!(counts.iter().all(|&c| c == counts[0]), "torn batch: {counts:?}");
                        let lasts: Vec<Option<f64>> =
                            snap.series.iter().map(|s| s.points.last().map(|p| p.value)).collect();
                        assert!(lasts.iter().all(|l| *l == lasts[0]));
                        if let Some(Some(last)) = lasts.first() {
                            assert_eq!(counts[0], *last as usize + 1);
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.len(ch(7)), 1000);
    }
}
