use std::{fmt, sync::Mutex};

/// One observation of a metric: a position on a totally ordered axis and the
/// value sampled there.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DataPoint<K, V> {
    pub position: K,
    pub value: V,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SeriesError {
    #[error("appended position regresses behind the latest point")]
    OutOfOrder,
}

/// An append-only, ordered sequence of observations for one subject and one
/// metric. Implementations are safe for concurrent appends and readers.
pub trait Series<K, V>: Send + Sync
where
    K: Ord + Copy,
    V: Clone,
{
    /// All points with `from <= position < to`, in order.
    fn get_range(&self, from: K, to: K) -> Vec<DataPoint<K, V>>;

    /// The most recent point, or `None` for an empty series.
    fn get_latest(&self) -> Option<DataPoint<K, V>>;

    /// Every recorded point, in order.
    fn get_all(&self) -> Vec<DataPoint<K, V>>;
}

/// Mutex-guarded vector storage with binary-searched range reads.
pub struct SyncedSeries<K, V> {
    points: Mutex<Vec<DataPoint<K, V>>>,
}

impl<K, V> SyncedSeries<K, V>
where
    K: Ord + Copy,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            points: Mutex::new(Vec::new()),
        }
    }

    /// Appends a point. Positions must be non-decreasing; a regressing
    /// position is rejected rather than reordered.
    pub fn append(&self, position: K, value: V) -> Result<(), SeriesError> {
        let mut points = self.points.lock().expect("series lock poisoned");
        if let Some(last) = points.last() {
            if position < last.position {
                return Err(SeriesError::OutOfOrder);
            }
        }
        points.push(DataPoint { position, value });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.lock().expect("series lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for SyncedSeries<K, V>
where
    K: Ord + Copy,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Series<K, V> for SyncedSeries<K, V>
where
    K: Ord + Copy + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get_range(&self, from: K, to: K) -> Vec<DataPoint<K, V>> {
        let points = self.points.lock().expect("series lock poisoned");
        let lo = points.partition_point(|p| p.position < from);
        let hi = points.partition_point(|p| p.position < to);
        points[lo..hi].to_vec()
    }

    fn get_latest(&self) -> Option<DataPoint<K, V>> {
        self.points
            .lock()
            .expect("series lock poisoned")
            .last()
            .cloned()
    }

    fn get_all(&self) -> Vec<DataPoint<K, V>> {
        self.points.lock().expect("series lock poisoned").clone()
    }
}

impl<K, V> fmt::Debug for SyncedSeries<K, V>
where
    K: Ord + Copy,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedSeries")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_are_ordered() {
        let series = SyncedSeries::new();
        for pos in [1, 3, 3, 7, 10] {
            series.append(pos, pos * 2).unwrap();
        }

        let all = series.get_all();
        let positions: Vec<_> = all.iter().map(|p| p.position).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn regressing_position_is_rejected() {
        let series = SyncedSeries::new();
        series.append(5, "a").unwrap();
        assert_eq!(series.append(4, "b"), Err(SeriesError::OutOfOrder));
        // Equal positions are fine.
        series.append(5, "c").unwrap();
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn latest_is_none_iff_empty() {
        let series: SyncedSeries<u64, u64> = SyncedSeries::new();
        assert!(series.get_latest().is_none());

        series.append(1, 10).unwrap();
        let latest = series.get_latest().unwrap();
        assert_eq!(latest.position, 1);
        assert_eq!(latest.value, 10);
    }

    #[test]
    fn range_is_half_open() {
        let series = SyncedSeries::new();
        for pos in 0..10u64 {
            series.append(pos, pos).unwrap();
        }

        let range = series.get_range(3, 7);
        let positions: Vec<_> = range.iter().map(|p| p.position).collect();
        assert_eq!(positions, vec![3, 4, 5, 6]);

        assert!(series.get_range(7, 3).is_empty());
        assert_eq!(series.get_range(0, 100).len(), 10);
    }
}
