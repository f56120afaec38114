use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use squall_core::{
    Series, SyncedSeries,
    monitoring::{Record, Subject},
};

/// One synchronized series per subject, the storage shared by all listener
/// driven sources.
pub struct SeriesBank<S, K, V>
where
    S: Subject,
    K: Ord + Copy,
    V: Clone,
{
    series: Mutex<BTreeMap<S, Arc<SyncedSeries<K, V>>>>,
}

impl<S, K, V> SeriesBank<S, K, V>
where
    S: Subject,
    K: Ord + Copy + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            series: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get_or_add(&self, subject: &S) -> Arc<SyncedSeries<K, V>> {
        let mut series = self.series.lock().expect("series bank poisoned");
        Arc::clone(series.entry(subject.clone()).or_default())
    }

    #[must_use]
    pub fn subjects(&self) -> Vec<S> {
        self.series
            .lock()
            .expect("series bank poisoned")
            .keys()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, subject: &S) -> Option<Arc<dyn Series<K, V>>> {
        self.series
            .lock()
            .expect("series bank poisoned")
            .get(subject)
            .map(|s| Arc::clone(s) as Arc<dyn Series<K, V>>)
    }
}

impl<S, K, V> SeriesBank<S, K, V>
where
    S: Subject,
    K: Ord + Copy + fmt::Display + Send + Sync + 'static,
    V: Clone + fmt::Display + Send + Sync + 'static,
{
    pub fn for_each_record(&self, consumer: &mut dyn FnMut(Record)) {
        let series = self.series.lock().expect("series bank poisoned");
        for (subject, series) in series.iter() {
            for point in series.get_all() {
                consumer(Record::new(subject, point.position, point.value));
            }
        }
    }
}

impl<S, K, V> Default for SeriesBank<S, K, V>
where
    S: Subject,
    K: Ord + Copy + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
