use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use squall_core::{
    Time,
    monitoring::{
        DynError, NodeTag, Record, RecordSource, Source,
        dispatch::{LogDispatcher, PrometheusKey, PrometheusListener, PrometheusSample},
        periodic::TimeSeries,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::util::SeriesBank;

/// How often node metric endpoints are scraped.
pub const SCRAPE_PERIOD: Duration = Duration::from_secs(1);

/// The Prometheus streams captured from every node, with the metric name the
/// resulting series is persisted under.
pub struct PromMetricSpec {
    pub metric_name: &'static str,
    pub key_name: &'static str,
    pub quantile: Option<&'static str>,
}

impl PromMetricSpec {
    #[must_use]
    pub fn key(&self) -> PrometheusKey {
        match self.quantile {
            Some(quantile) => PrometheusKey::with_quantile(self.key_name, quantile),
            None => PrometheusKey::named(self.key_name),
        }
    }
}

pub const DEFAULT_PROM_METRICS: &[PromMetricSpec] = &[
    PromMetricSpec { metric_name: "txpool_received", key_name: "txpool_received", quantile: None },
    PromMetricSpec { metric_name: "txpool_valid", key_name: "txpool_valid", quantile: None },
    PromMetricSpec { metric_name: "txpool_invalid", key_name: "txpool_invalid", quantile: None },
    PromMetricSpec { metric_name: "txpool_underpriced", key_name: "txpool_underpriced", quantile: None },
    PromMetricSpec { metric_name: "txpool_overflowed", key_name: "txpool_overflowed", quantile: None },
    PromMetricSpec { metric_name: "txpool_pending", key_name: "txpool_pending", quantile: None },
    PromMetricSpec { metric_name: "txpool_queued", key_name: "txpool_queued", quantile: None },
    PromMetricSpec { metric_name: "system_cpu_procload", key_name: "system_cpu_procload", quantile: None },
    PromMetricSpec { metric_name: "system_memory_used", key_name: "system_memory_used", quantile: None },
    PromMetricSpec { metric_name: "db_size", key_name: "db_size", quantile: None },
    PromMetricSpec { metric_name: "statedb_disksize", key_name: "statedb_disksize", quantile: None },
    PromMetricSpec {
        metric_name: "chain_execution_q0.999",
        key_name: "chain_execution",
        quantile: Some("0.999"),
    },
];

/// Captures one Prometheus stream into a per-node time series.
pub struct PromSeriesSource {
    metric_name: &'static str,
    bank: SeriesBank<NodeTag, Time, f64>,
}

impl PromSeriesSource {
    /// Creates the source and subscribes it to the dispatcher.
    #[must_use]
    pub fn install(spec: &PromMetricSpec, dispatcher: &LogDispatcher) -> Arc<Self> {
        let source = Arc::new(Self {
            metric_name: spec.metric_name,
            bank: SeriesBank::new(),
        });
        dispatcher.register_prometheus_listener(spec.key(), source.clone());
        source
    }
}

impl PrometheusListener for PromSeriesSource {
    fn on_sample(&self, sample: &PrometheusSample) {
        let series = self.bank.get_or_add(&sample.node);
        if let Err(err) = series.append(sample.time, sample.value) {
            debug!(node = %sample.node, metric = self.metric_name, %err, "dropping sample");
        }
    }
}

#[async_trait]
impl RecordSource for PromSeriesSource {
    fn metric_name(&self) -> &'static str {
        self.metric_name
    }

    fn for_each_record(&self, consumer: &mut dyn FnMut(Record)) {
        self.bank.for_each_record(consumer);
    }

    async fn shutdown(&self) -> Result<(), DynError> {
        Ok(())
    }
}

impl Source<NodeTag, TimeSeries<f64>> for PromSeriesSource {
    fn subjects(&self) -> Vec<NodeTag> {
        self.bank.subjects()
    }

    fn get_data(&self, subject: &NodeTag) -> Option<TimeSeries<f64>> {
        self.bank.get(subject)
    }
}

struct ScrapeTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Scrapes every attached node's metrics endpoint on a fixed period and
/// feeds the payloads to the dispatcher.
pub struct PrometheusPoller {
    dispatcher: Arc<LogDispatcher>,
    http: reqwest::Client,
    period: Duration,
    tasks: Mutex<HashMap<String, ScrapeTask>>,
}

impl PrometheusPoller {
    #[must_use]
    pub fn new(dispatcher: Arc<LogDispatcher>) -> Self {
        Self {
            dispatcher,
            http: reqwest::Client::new(),
            period: SCRAPE_PERIOD,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_node(&self, node: NodeTag, url: Url) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::scrape_loop(
            Arc::clone(&self.dispatcher),
            self.http.clone(),
            node.clone(),
            url,
            self.period,
            cancel.clone(),
        ));
        let previous = self
            .tasks
            .lock()
            .expect("prometheus poller poisoned")
            .insert(node.0, ScrapeTask { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    pub fn remove_node(&self, node: &NodeTag) {
        if let Some(task) = self
            .tasks
            .lock()
            .expect("prometheus poller poisoned")
            .remove(&node.0)
        {
            task.cancel.cancel();
        }
    }

    async fn scrape_loop(
        dispatcher: Arc<LogDispatcher>,
        http: reqwest::Client,
        node: NodeTag,
        url: Url,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let response = match http.get(url.clone()).send().await {
                Ok(response) => response,
                Err(err) => {
                    debug!(node = %node, %err, "metrics scrape failed");
                    continue;
                }
            };
            match response.text().await {
                Ok(payload) => dispatcher.ingest_prometheus_text(&node, &payload),
                Err(err) => debug!(node = %node, %err, "metrics payload unreadable"),
            }
        }
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<ScrapeTask> = {
            let mut tasks = self.tasks.lock().expect("prometheus poller poisoned");
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in &tasks {
            task.cancel.cancel();
        }
        for task in tasks {
            let _ = task.task.await;
        }
    }
}
