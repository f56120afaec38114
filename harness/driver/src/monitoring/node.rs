use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use squall_core::{
    Series, SmaSeries, Time,
    monitoring::{
        DynError, Metric, Monitor, NodeTag, Record, RecordSource, Source,
        dispatch::{BlockEvent, BlockEventListener},
        periodic::TimeSeries,
    },
};

use super::util::SeriesBank;

/// Shared handle to a block-number-indexed series.
pub type BlockSeries<V> = Arc<dyn Series<u64, V>>;

/// Per-block state of one node as observed through its log.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockStatus {
    pub height: u64,
    pub txs: u32,
    pub gas_used: u64,
    pub processing_time: Duration,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.height, self.txs, self.gas_used)
    }
}

pub const NODE_BLOCK_STATUS: Metric<NodeTag, TimeSeries<BlockStatus>> = Metric::new(
    "NodeBlockStatus",
    "Block completion status per node over time",
);

pub const NODE_TX_THROUGHPUT: Metric<NodeTag, BlockSeries<f64>> = Metric::new(
    "TransactionsThroughput",
    "Transactions per second between consecutive blocks",
);

/// Windows for the moving-average views over the throughput series.
pub const THROUGHPUT_SMA_WINDOWS: &[(&str, usize)] = &[
    ("TransactionsThroughputSMA_10", 10),
    ("TransactionsThroughputSMA_100", 100),
    ("TransactionsThroughputSMA_1000", 1000),
];

/// Records each node's block completions as a time series.
pub struct NodeBlockStatusSource {
    bank: SeriesBank<NodeTag, Time, BlockStatus>,
}

impl NodeBlockStatusSource {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bank: SeriesBank::new(),
        })
    }
}

impl BlockEventListener for NodeBlockStatusSource {
    fn on_block(&self, event: &BlockEvent) {
        let series = self.bank.get_or_add(&event.node);
        let status = BlockStatus {
            height: event.height,
            txs: event.txs,
            gas_used: event.gas_used,
            processing_time: event.processing_time,
        };
        if let Err(err) = series.append(event.time, status) {
            tracing::debug!(node = %event.node, %err, "dropping block status sample");
        }
    }
}

#[async_trait]
impl RecordSource for NodeBlockStatusSource {
    fn metric_name(&self) -> &'static str {
        NODE_BLOCK_STATUS.name
    }

    fn for_each_record(&self, consumer: &mut dyn FnMut(Record)) {
        self.bank.for_each_record(consumer);
    }

    async fn shutdown(&self) -> Result<(), DynError> {
        Ok(())
    }
}

impl Source<NodeTag, TimeSeries<BlockStatus>> for NodeBlockStatusSource {
    fn subjects(&self) -> Vec<NodeTag> {
        self.bank.subjects()
    }

    fn get_data(&self, subject: &NodeTag) -> Option<TimeSeries<BlockStatus>> {
        self.bank.get(subject)
    }
}

/// Derives transaction throughput per node from consecutive block events,
/// indexed by block height.
pub struct NodeTxThroughputSource {
    bank: SeriesBank<NodeTag, u64, f64>,
    previous: Mutex<BTreeMap<NodeTag, Time>>,
}

impl NodeTxThroughputSource {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bank: SeriesBank::new(),
            previous: Mutex::new(BTreeMap::new()),
        })
    }
}

impl BlockEventListener for NodeTxThroughputSource {
    fn on_block(&self, event: &BlockEvent) {
        let previous = {
            let mut previous = self.previous.lock().expect("throughput source poisoned");
            previous.insert(event.node.clone(), event.time)
        };
        // The first block observed for a node has no interval to rate over.
        let Some(previous) = previous else { return };
        let elapsed = event.time.since(previous).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let series = self.bank.get_or_add(&event.node);
        if let Err(err) = series.append(event.height, f64::from(event.txs) / elapsed) {
            tracing::debug!(node = %event.node, %err, "dropping throughput sample");
        }
    }
}

#[async_trait]
impl RecordSource for NodeTxThroughputSource {
    fn metric_name(&self) -> &'static str {
        NODE_TX_THROUGHPUT.name
    }

    fn for_each_record(&self, consumer: &mut dyn FnMut(Record)) {
        self.bank.for_each_record(consumer);
    }

    async fn shutdown(&self) -> Result<(), DynError> {
        Ok(())
    }
}

impl Source<NodeTag, BlockSeries<f64>> for NodeTxThroughputSource {
    fn subjects(&self) -> Vec<NodeTag> {
        self.bank.subjects()
    }

    fn get_data(&self, subject: &NodeTag) -> Option<BlockSeries<f64>> {
        self.bank.get(subject)
    }
}

/// Reshapes another node-keyed series metric, building the derived series
/// lazily per subject and caching it.
pub struct BlockSeriesTransformSource {
    metric: Metric<NodeTag, BlockSeries<f64>>,
    source_metric: Metric<NodeTag, BlockSeries<f64>>,
    monitor: Weak<Monitor>,
    window: usize,
    cache: Mutex<BTreeMap<NodeTag, BlockSeries<f64>>>,
}

impl BlockSeriesTransformSource {
    #[must_use]
    pub fn sma(
        metric: Metric<NodeTag, BlockSeries<f64>>,
        source_metric: Metric<NodeTag, BlockSeries<f64>>,
        monitor: Weak<Monitor>,
        window: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            metric,
            source_metric,
            monitor,
            window,
            cache: Mutex::new(BTreeMap::new()),
        })
    }
}

#[async_trait]
impl RecordSource for BlockSeriesTransformSource {
    fn metric_name(&self) -> &'static str {
        self.metric.name
    }

    fn for_each_record(&self, consumer: &mut dyn FnMut(Record)) {
        for subject in self.subjects() {
            let Some(series) = self.get_data(&subject) else {
                continue;
            };
            for point in series.get_all() {
                consumer(Record::new(&subject, point.position, point.value));
            }
        }
    }

    async fn shutdown(&self) -> Result<(), DynError> {
        Ok(())
    }
}

impl Source<NodeTag, BlockSeries<f64>> for BlockSeriesTransformSource {
    fn subjects(&self) -> Vec<NodeTag> {
        self.monitor
            .upgrade()
            .map(|monitor| monitor.subjects(&self.source_metric))
            .unwrap_or_default()
    }

    fn get_data(&self, subject: &NodeTag) -> Option<BlockSeries<f64>> {
        let mut cache = self.cache.lock().expect("transform source poisoned");
        if let Some(series) = cache.get(subject) {
            return Some(Arc::clone(series));
        }
        let monitor = self.monitor.upgrade()?;
        let input = monitor.get_data(subject, &self.source_metric)?;
        let derived: BlockSeries<f64> = Arc::new(SmaSeries::new(input, self.window));
        cache.insert(subject.clone(), Arc::clone(&derived));
        Some(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(node: &str, height: u64, txs: u32, at: f64) -> BlockEvent {
        BlockEvent {
            node: NodeTag(node.to_owned()),
            height,
            txs,
            gas_used: 21_000,
            gas_base_fee: 0,
            gas_rate: 0.0,
            time: Time::from_secs_f64(at),
            processing_time: Duration::from_millis(10),
        }
    }

    #[test]
    fn block_status_series_follows_events() {
        let source = NodeBlockStatusSource::new();
        source.on_block(&event("a", 1, 3, 1.0));
        source.on_block(&event("a", 2, 5, 2.0));
        source.on_block(&event("b", 1, 0, 2.0));

        let series = source.get_data(&NodeTag("a".to_owned())).unwrap();
        let latest = series.get_latest().unwrap();
        assert_eq!(latest.value.height, 2);
        assert_eq!(latest.value.txs, 5);
        assert_eq!(source.subjects().len(), 2);
    }

    #[test]
    fn throughput_rates_over_block_intervals() {
        let source = NodeTxThroughputSource::new();
        source.on_block(&event("a", 1, 10, 1.0));
        // 20 transactions over 2 seconds.
        source.on_block(&event("a", 2, 20, 3.0));

        let series = source.get_data(&NodeTag("a".to_owned())).unwrap();
        let point = series.get_latest().unwrap();
        assert_eq!(point.position, 2);
        assert!((point.value - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sma_transform_builds_lazily_from_the_monitor() {
        let monitor = Arc::new(Monitor::new(squall_core::monitoring::MonitorConfig::default()));

        let throughput = NodeTxThroughputSource::new();
        throughput.on_block(&event("a", 1, 10, 1.0));
        throughput.on_block(&event("a", 2, 20, 2.0));
        throughput.on_block(&event("a", 3, 40, 3.0));
        monitor.install_source(throughput).unwrap();

        const SMA: Metric<NodeTag, BlockSeries<f64>> = Metric::new("ThroughputSma2", "sma");
        let transform = BlockSeriesTransformSource::sma(
            SMA,
            NODE_TX_THROUGHPUT,
            Arc::downgrade(&monitor),
            2,
        );
        monitor.install_source(transform).unwrap();

        let node = NodeTag("a".to_owned());
        assert_eq!(monitor.subjects(&SMA), vec![node.clone()]);
        let series = monitor.get_data(&node, &SMA).unwrap();
        let values: Vec<_> = series.get_all().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![20.0, 30.0]);
    }
}
