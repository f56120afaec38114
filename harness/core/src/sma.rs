use std::sync::Arc;

use crate::series::{DataPoint, Series};

/// Simple-moving-average view over a numeric source series.
///
/// Each output point mirrors a source position and carries the mean of the
/// last `window` source values up to that point; leading points average the
/// partial window available so far. Values are computed on read, so the view
/// always reflects the current content of the source.
pub struct SmaSeries<K> {
    source: Arc<dyn Series<K, f64>>,
    window: usize,
}

impl<K> SmaSeries<K>
where
    K: Ord + Copy,
{
    #[must_use]
    pub fn new(source: Arc<dyn Series<K, f64>>, window: usize) -> Self {
        Self {
            source,
            window: window.max(1),
        }
    }

    fn averaged(&self) -> Vec<DataPoint<K, f64>> {
        let input = self.source.get_all();
        let mut out = Vec::with_capacity(input.len());
        let mut sum = 0.0;
        for (i, point) in input.iter().enumerate() {
            sum += point.value;
            if i >= self.window {
                sum -= input[i - self.window].value;
            }
            let count = (i + 1).min(self.window);
            out.push(DataPoint {
                position: point.position,
                value: sum / count as f64,
            });
        }
        out
    }
}

impl<K> Series<K, f64> for SmaSeries<K>
where
    K: Ord + Copy + Send + Sync,
{
    fn get_range(&self, from: K, to: K) -> Vec<DataPoint<K, f64>> {
        self.averaged()
            .into_iter()
            .filter(|p| from <= p.position && p.position < to)
            .collect()
    }

    fn get_latest(&self) -> Option<DataPoint<K, f64>> {
        self.averaged().pop()
    }

    fn get_all(&self) -> Vec<DataPoint<K, f64>> {
        self.averaged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SyncedSeries;

    fn source(values: &[f64]) -> Arc<SyncedSeries<u64, f64>> {
        let series = Arc::new(SyncedSeries::new());
        for (i, v) in values.iter().enumerate() {
            series.append(i as u64, *v).unwrap();
        }
        series
    }

    #[test]
    fn averages_over_full_windows() {
        let src = source(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let sma = SmaSeries::new(src, 3);

        let all = sma.get_all();
        let values: Vec<_> = all.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 1.5, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn positions_mirror_the_source() {
        let src = source(&[10.0, 20.0]);
        let sma = SmaSeries::new(src.clone(), 10);

        let all = sma.get_all();
        assert_eq!(all[0].position, 0);
        assert_eq!(all[1].position, 1);
        assert_eq!(sma.get_latest().unwrap().position, 1);

        // The view tracks later appends to the source.
        src.append(2, 30.0).unwrap();
        assert_eq!(sma.get_latest().unwrap().value, 20.0);
    }

    #[test]
    fn window_of_one_is_identity() {
        let src = source(&[4.0, 8.0, 15.0]);
        let sma = SmaSeries::new(src, 1);
        let values: Vec<_> = sma.get_all().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![4.0, 8.0, 15.0]);
    }

    #[test]
    fn empty_source_yields_empty_view() {
        let src: Arc<SyncedSeries<u64, f64>> = Arc::new(SyncedSeries::new());
        let sma = SmaSeries::new(src, 5);
        assert!(sma.get_latest().is_none());
        assert!(sma.get_all().is_empty());
    }
}
