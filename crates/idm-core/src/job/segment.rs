//! Segment model and range planning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Smallest range worth a dedicated connection.
const MIN_SEGMENT: u64 = 64 * 1024;
/// Upper bound on segments per job, independent of file size.
const MAX_SEGMENTS: usize = 256;

/// Where a segment's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SegmentSource {
    /// Byte range `[start, end)` of the job's effective URL.
    Range { start: u64, end: u64 },
    /// The entire resource in one sequential GET (non-resumable or unknown
    /// size). Interrupted downloads restart from zero.
    Whole,
    /// One media fragment (HLS/DASH) with its own URL.
    Media {
        url: String,
        sequence: u64,
        /// Optional `#EXT-X-BYTERANGE` window, half-open.
        byterange: Option<(u64, u64)>,
        /// AES-128 key URL + optional explicit IV (hex) when encrypted.
        key_url: Option<String>,
        iv_hex: Option<String>,
    },
}

impl SegmentSource {
    /// Declared length in bytes, when knowable up front.
    pub fn declared_len(&self) -> Option<u64> {
        match self {
            SegmentSource::Range { start, end } => Some(end.saturating_sub(*start)),
            SegmentSource::Whole => None,
            SegmentSource::Media { byterange, .. } => {
                byterange.map(|(s, e)| e.saturating_sub(s))
            }
        }
    }

    /// Whether an interrupted attempt can continue where it left off.
    pub fn supports_append(&self) -> bool {
        matches!(self, SegmentSource::Range { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    Idle,
    Downloading,
    Done,
    Failed,
}

/// One segment's runtime slot. The set of slots is frozen at admission;
/// workers only touch `state`, `bytes_written` and `attempts` of their own.
#[derive(Debug)]
pub struct SegmentSlot {
    pub index: usize,
    pub source: SegmentSource,
    /// Part file under the job's temp dir.
    pub path: PathBuf,
    state: Mutex<SegmentState>,
    bytes_written: AtomicU64,
    attempts: AtomicU32,
}

impl SegmentSlot {
    pub fn new(index: usize, source: SegmentSource, path: PathBuf) -> Self {
        Self {
            index,
            source,
            path,
            state: Mutex::new(SegmentState::Idle),
            bytes_written: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> SegmentState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: SegmentState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn set_bytes_written(&self, n: u64) {
        self.bytes_written.store(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) -> u64 {
        self.bytes_written.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn bump_attempts(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A new worker tenure counts its retries from zero.
    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }

    /// The byte range still to fetch, for `Range` sources.
    pub fn missing_range(&self) -> Option<(u64, u64)> {
        match self.source {
            SegmentSource::Range { start, end } => {
                let from = start + self.bytes_written();
                (from < end).then_some((from, end))
            }
            SegmentSource::Whole | SegmentSource::Media { .. } => None,
        }
    }
}

/// How many segments a resumable download of `total` bytes gets.
///
/// The connection count sets the floor (so every allowed connection has a
/// range to own), the size hint sets the ceiling for huge files, and tiny
/// files stop splitting at `MIN_SEGMENT`.
pub fn plan_segment_count(total: u64, size_hint: u64, max_connections: usize) -> usize {
    if total == 0 {
        return 1;
    }
    let hint = size_hint.max(MIN_SEGMENT);
    let by_hint = ((total + hint - 1) / hint) as usize;
    let want = by_hint.max(max_connections.max(1)).min(MAX_SEGMENTS);
    let fit = (total / MIN_SEGMENT).max(1) as usize;
    want.min(fit)
}

/// Splits `[0, total)` into `count` contiguous ranges, as equal as possible.
/// Earlier segments absorb the remainder, one byte each.
pub fn plan_ranges(total: u64, count: usize) -> Vec<(u64, u64)> {
    if total == 0 || count == 0 {
        return Vec::new();
    }
    let count = count as u64;
    let base = total / count;
    let remainder = total % count;
    let mut out = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    for i in 0..count {
        let len = base + u64::from(i < remainder);
        let end = (offset + len).min(total);
        out.push((offset, end));
        offset = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_connections_split_ten_mib_evenly() {
        let total = 10 * 1024 * 1024;
        let count = plan_segment_count(total, 4 * 1024 * 1024, 4);
        assert_eq!(count, 4);
        let ranges = plan_ranges(total, count);
        assert_eq!(
            ranges,
            vec![
                (0, 2_621_440),
                (2_621_440, 5_242_880),
                (5_242_880, 7_864_320),
                (7_864_320, 10_485_760),
            ]
        );
    }

    #[test]
    fn ranges_partition_exactly() {
        for (total, count) in [(1000u64, 4usize), (10, 4), (7, 3), (100, 1)] {
            let ranges = plan_ranges(total, count);
            assert_eq!(ranges.len(), count);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges.last().unwrap().1, total);
            for w in ranges.windows(2) {
                assert_eq!(w[0].1, w[1].0, "contiguous, no overlap");
            }
        }
    }

    #[test]
    fn tiny_files_do_not_oversplit() {
        // 100 KiB with 8 connections: only one 64 KiB floor fits.
        assert_eq!(plan_segment_count(100 * 1024, 4 * 1024 * 1024, 8), 1);
        assert_eq!(plan_segment_count(0, 4 * 1024 * 1024, 8), 1);
    }

    #[test]
    fn huge_files_follow_the_hint() {
        // 1 GiB with a 4 MiB hint wants 256 segments (capped).
        assert_eq!(
            plan_segment_count(1024 * 1024 * 1024, 4 * 1024 * 1024, 4),
            256
        );
    }

    #[test]
    fn missing_range_tracks_progress() {
        let slot = SegmentSlot::new(
            0,
            SegmentSource::Range { start: 100, end: 200 },
            PathBuf::from("part-000000"),
        );
        assert_eq!(slot.missing_range(), Some((100, 200)));
        slot.set_bytes_written(40);
        assert_eq!(slot.missing_range(), Some((140, 200)));
        slot.set_bytes_written(100);
        assert_eq!(slot.missing_range(), None);
    }

    #[test]
    fn media_source_declared_len() {
        let s = SegmentSource::Media {
            url: "http://x/seg1.ts".into(),
            sequence: 7,
            byterange: Some((0, 1000)),
            key_url: None,
            iv_hex: None,
        };
        assert_eq!(s.declared_len(), Some(1000));
    }
}
