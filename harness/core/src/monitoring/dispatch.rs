use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use regex::Regex;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt as _},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{Clock, Time};

use super::NodeTag;

/// A block completion reported by a node's log.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockEvent {
    pub node: NodeTag,
    pub height: u64,
    pub txs: u32,
    pub gas_used: u64,
    pub gas_base_fee: u64,
    pub gas_rate: f64,
    /// When the event was observed on the harness timeline.
    pub time: Time,
    pub processing_time: Duration,
}

/// Identity of a Prometheus metric stream: name plus the quantile and label
/// set when present.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrometheusKey {
    pub name: String,
    pub quantile: Option<String>,
    pub labels: Option<String>,
}

impl PrometheusKey {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            quantile: None,
            labels: None,
        }
    }

    #[must_use]
    pub fn with_quantile(name: &str, quantile: &str) -> Self {
        Self {
            name: name.to_owned(),
            quantile: Some(quantile.to_owned()),
            labels: None,
        }
    }

    /// Metric name with the quantile suffix used for persisted series.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.quantile {
            Some(q) => format!("{}_q{q}", self.name),
            None => self.name.clone(),
        }
    }
}

/// One scraped Prometheus value.
#[derive(Clone, Debug, PartialEq)]
pub struct PrometheusSample {
    pub node: NodeTag,
    pub key: PrometheusKey,
    pub time: Time,
    pub value: f64,
}

pub trait BlockEventListener: Send + Sync {
    fn on_block(&self, event: &BlockEvent);
}

pub trait PrometheusListener: Send + Sync {
    fn on_sample(&self, sample: &PrometheusSample);
}

fn block_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"New block\s+index=(?P<height>\d+)\s+txs=(?P<txs>\d+)\s+gas_used=(?P<gas>[\d,]+)\s+base_fee=(?P<fee>\d+)\s+gas_rate=(?P<rate>[\d.eE+-]+)\s+age=\S+\s+t=(?P<proc>\S+)",
        )
        .expect("block line pattern is valid")
    })
}

fn prometheus_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<name>[a-zA-Z_:][a-zA-Z0-9_:]*)(?:\{(?P<labels>[^}]*)\})?\s+(?P<value>[^\s]+)\s*$",
        )
        .expect("prometheus line pattern is valid")
    })
}

/// Block fields parsed from a single log line; the observation time is
/// stamped by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedBlock {
    pub height: u64,
    pub txs: u32,
    pub gas_used: u64,
    pub gas_base_fee: u64,
    pub gas_rate: f64,
    pub processing_time: Duration,
}

/// Parses a client log line of the form
/// `New block index=5 txs=42 gas_used=417,928 base_fee=1000000000
/// gas_rate=123.4 age=343.255ms t=287.714ms`.
#[must_use]
pub fn parse_block_line(line: &str) -> Option<ParsedBlock> {
    let captures = block_line_pattern().captures(line)?;
    let digits = |name: &str| captures.name(name).map(|m| m.as_str().replace(',', ""));

    Some(ParsedBlock {
        height: digits("height")?.parse().ok()?,
        txs: digits("txs")?.parse().ok()?,
        gas_used: digits("gas")?.parse().ok()?,
        gas_base_fee: digits("fee")?.parse().ok()?,
        gas_rate: captures.name("rate")?.as_str().parse().ok()?,
        processing_time: humantime::parse_duration(captures.name("proc")?.as_str()).ok()?,
    })
}

/// Parses one Prometheus text-exposition line into its key and value.
/// Comment and empty lines yield `None`.
#[must_use]
pub fn parse_prometheus_line(line: &str) -> Option<(PrometheusKey, f64)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let captures = prometheus_line_pattern().captures(line)?;
    let value: f64 = captures.name("value")?.as_str().parse().ok()?;
    let name = captures.name("name")?.as_str().to_owned();

    let mut quantile = None;
    let mut rest = Vec::new();
    if let Some(labels) = captures.name("labels") {
        for label in labels.as_str().split(',') {
            let label = label.trim();
            if label.is_empty() {
                continue;
            }
            match label
                .split_once('=')
                .map(|(k, v)| (k, v.trim_matches('"')))
            {
                Some(("quantile", q)) => quantile = Some(q.to_owned()),
                Some(_) | None => rest.push(label.to_owned()),
            }
        }
    }

    let key = PrometheusKey {
        name,
        quantile,
        labels: if rest.is_empty() {
            None
        } else {
            Some(rest.join(","))
        },
    };
    Some((key, value))
}

/// Classifies node output into typed events and fans them out to registered
/// listeners.
///
/// Delivery is best-effort and in registration order; a panicking listener is
/// logged and skipped for that event but stays registered.
pub struct LogDispatcher {
    clock: Arc<dyn Clock>,
    block_listeners: Mutex<Vec<Arc<dyn BlockEventListener>>>,
    prom_listeners: Mutex<HashMap<PrometheusKey, Vec<Arc<dyn PrometheusListener>>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl LogDispatcher {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            block_listeners: Mutex::new(Vec::new()),
            prom_listeners: Mutex::new(HashMap::new()),
            readers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn register_block_listener(&self, listener: Arc<dyn BlockEventListener>) {
        self.block_listeners
            .lock()
            .expect("dispatcher poisoned")
            .push(listener);
    }

    pub fn register_prometheus_listener(
        &self,
        key: PrometheusKey,
        listener: Arc<dyn PrometheusListener>,
    ) {
        self.prom_listeners
            .lock()
            .expect("dispatcher poisoned")
            .entry(key)
            .or_default()
            .push(listener);
    }

    /// Spawns a task consuming the node's log stream line by line until the
    /// stream ends or the dispatcher shuts down.
    pub fn attach_node<R>(self: &Arc<Self>, node: NodeTag, reader: R)
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let dispatcher = Arc::clone(self);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                let line = tokio::select! {
                    () = cancel.cancelled() => return,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => dispatcher.dispatch_line(&node, &line),
                    Ok(None) => return,
                    Err(err) => {
                        debug!(node = %node, %err, "log stream closed");
                        return;
                    }
                }
            }
        });
        self.readers.lock().expect("dispatcher poisoned").push(task);
    }

    fn dispatch_line(&self, node: &NodeTag, line: &str) {
        if let Some(parsed) = parse_block_line(line) {
            let event = BlockEvent {
                node: node.clone(),
                height: parsed.height,
                txs: parsed.txs,
                gas_used: parsed.gas_used,
                gas_base_fee: parsed.gas_base_fee,
                gas_rate: parsed.gas_rate,
                time: self.clock.now(),
                processing_time: parsed.processing_time,
            };
            self.dispatch_block(&event);
        }
    }

    fn dispatch_block(&self, event: &BlockEvent) {
        let listeners = self
            .block_listeners
            .lock()
            .expect("dispatcher poisoned")
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_block(event))).is_err() {
                warn!(node = %event.node, height = event.height, "block listener panicked");
            }
        }
    }

    /// Parses a scraped Prometheus payload and fans out the samples whose key
    /// has registered listeners.
    pub fn ingest_prometheus_text(&self, node: &NodeTag, payload: &str) {
        let time = self.clock.now();
        for line in payload.lines() {
            let Some((key, value)) = parse_prometheus_line(line) else {
                continue;
            };
            let listeners = {
                let registry = self.prom_listeners.lock().expect("dispatcher poisoned");
                match registry.get(&key) {
                    Some(listeners) => listeners.clone(),
                    // Tolerate extra labels on an otherwise registered stream.
                    None => registry
                        .get(&PrometheusKey {
                            name: key.name.clone(),
                            quantile: key.quantile.clone(),
                            labels: None,
                        })
                        .cloned()
                        .unwrap_or_default(),
                }
            };
            if listeners.is_empty() {
                continue;
            }
            let sample = PrometheusSample {
                node: node.clone(),
                key,
                time,
                value,
            };
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener.on_sample(&sample))).is_err() {
                    warn!(node = %node, metric = %sample.key.name, "prometheus listener panicked");
                }
            }
        }
    }

    /// Stops all reader tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let readers = std::mem::take(&mut *self.readers.lock().expect("dispatcher poisoned"));
        for task in readers {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::clock::SimClock;

    #[test]
    fn parses_well_formed_block_line() {
        let line = "INFO [08-02|12:01:05.123] New block index=5 txs=42 gas_used=417,928 \
                    base_fee=1000000000 gas_rate=123.4 age=343.255ms t=287.714ms";
        let block = parse_block_line(line).unwrap();
        assert_eq!(block.height, 5);
        assert_eq!(block.txs, 42);
        assert_eq!(block.gas_used, 417_928);
        assert_eq!(block.gas_base_fee, 1_000_000_000);
        assert!((block.gas_rate - 123.4).abs() < 1e-9);
        assert_eq!(block.processing_time, Duration::from_micros(287_714));
    }

    #[test]
    fn ignores_unrelated_log_lines() {
        assert!(parse_block_line("INFO starting p2p server").is_none());
        assert!(parse_block_line("New block without fields").is_none());
    }

    #[test]
    fn parses_prometheus_lines() {
        let (key, value) = parse_prometheus_line("txpool_received 42").unwrap();
        assert_eq!(key, PrometheusKey::named("txpool_received"));
        assert!((value - 42.0).abs() < f64::EPSILON);

        let (key, value) =
            parse_prometheus_line("chain_execution{quantile=\"0.999\"} 0.25").unwrap();
        assert_eq!(key, PrometheusKey::with_quantile("chain_execution", "0.999"));
        assert!((value - 0.25).abs() < f64::EPSILON);
        assert_eq!(key.display_name(), "chain_execution_q0.999");

        assert!(parse_prometheus_line("# HELP txpool_received ...").is_none());
        assert!(parse_prometheus_line("").is_none());
    }

    struct CountingBlockListener {
        seen: AtomicU64,
        panic_on_call: bool,
    }

    impl BlockEventListener for CountingBlockListener {
        fn on_block(&self, event: &BlockEvent) {
            if self.panic_on_call {
                panic!("listener failure");
            }
            self.seen.fetch_add(event.height, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn fans_out_block_events_from_a_log_stream() {
        let dispatcher = Arc::new(LogDispatcher::new(Arc::new(SimClock::new())));
        let listener = Arc::new(CountingBlockListener {
            seen: AtomicU64::new(0),
            panic_on_call: false,
        });
        dispatcher.register_block_listener(listener.clone());

        let log = "boot complete\n\
                   New block index=1 txs=0 gas_used=0 base_fee=0 gas_rate=0 age=1ms t=1ms\n\
                   New block index=2 txs=1 gas_used=21000 base_fee=0 gas_rate=1 age=1ms t=1ms\n";
        dispatcher.attach_node(NodeTag("a".to_owned()), std::io::Cursor::new(log.to_owned()));

        while listener.seen.load(Ordering::Relaxed) < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        dispatcher.shutdown().await;
        assert_eq!(listener.seen.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn panicking_listener_is_skipped_not_unregistered() {
        let dispatcher = Arc::new(LogDispatcher::new(Arc::new(SimClock::new())));
        let panicking = Arc::new(CountingBlockListener {
            seen: AtomicU64::new(0),
            panic_on_call: true,
        });
        let healthy = Arc::new(CountingBlockListener {
            seen: AtomicU64::new(0),
            panic_on_call: false,
        });
        dispatcher.register_block_listener(panicking);
        dispatcher.register_block_listener(healthy.clone());

        let event = BlockEvent {
            node: NodeTag("a".to_owned()),
            height: 7,
            txs: 0,
            gas_used: 0,
            gas_base_fee: 0,
            gas_rate: 0.0,
            time: Time::ZERO,
            processing_time: Duration::ZERO,
        };
        dispatcher.dispatch_block(&event);
        dispatcher.dispatch_block(&event);

        assert_eq!(healthy.seen.load(Ordering::Relaxed), 14);
    }

    struct RecordingPromListener {
        values: Mutex<Vec<f64>>,
    }

    impl PrometheusListener for RecordingPromListener {
        fn on_sample(&self, sample: &PrometheusSample) {
            self.values.lock().unwrap().push(sample.value);
        }
    }

    #[tokio::test]
    async fn prometheus_ingest_routes_by_key() {
        let dispatcher = LogDispatcher::new(Arc::new(SimClock::new()));
        let listener = Arc::new(RecordingPromListener {
            values: Mutex::new(Vec::new()),
        });
        dispatcher
            .register_prometheus_listener(PrometheusKey::named("txpool_pending"), listener.clone());

        dispatcher.ingest_prometheus_text(
            &NodeTag("a".to_owned()),
            "# comment\ntxpool_pending 10\ntxpool_queued 99\ntxpool_pending 12\n",
        );

        assert_eq!(*listener.values.lock().unwrap(), vec![10.0, 12.0]);
    }
}
