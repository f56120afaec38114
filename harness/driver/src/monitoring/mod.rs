pub mod apps;
pub mod node;
pub mod prom;
pub mod profile;
pub mod util;

use std::sync::Arc;

use squall_core::{
    Clock,
    monitoring::{
        AppTag, Monitor, MonitorError, NodeTag,
        dispatch::LogDispatcher,
        periodic::PeriodicSource,
    },
};
use tracing::{debug, warn};

use crate::network::{DynNode, Network, NetworkListener, Node as _, ServiceKind};

use self::{
    apps::{
        APP_RECEIVED_TRANSACTIONS, APP_SENT_TRANSACTIONS, AppObservationListener,
        NETWORK_NODE_COUNT, NodeCountSensor,
    },
    node::{
        BlockSeriesTransformSource, NODE_TX_THROUGHPUT, NodeBlockStatusSource,
        NodeTxThroughputSource, THROUGHPUT_SMA_WINDOWS,
    },
    prom::{DEFAULT_PROM_METRICS, PromSeriesSource, PrometheusPoller},
    profile::{CpuProfileSensor, NODE_CPU_PROFILE, PROFILE_PERIOD},
};

/// Wires new nodes into the observation pipeline: log stream to the
/// dispatcher, metrics endpoint to the Prometheus poller, pprof endpoint to
/// the profile sampler.
pub struct NodeObservationListener {
    dispatcher: Arc<LogDispatcher>,
    poller: Arc<PrometheusPoller>,
    profiles: Arc<PeriodicSource<NodeTag, u64>>,
    output_dir: std::path::PathBuf,
}

impl NetworkListener for NodeObservationListener {
    fn after_node_creation(&self, node: &DynNode) {
        let tag = NodeTag(node.label().to_owned());

        match node.take_log_stream() {
            Some(stream) => self.dispatcher.attach_node(tag.clone(), stream),
            None => debug!(node = %tag, "node exposes no log stream"),
        }

        if let Some(url) = node.service_url(ServiceKind::Metrics) {
            self.poller.add_node(tag.clone(), url);
        }

        if let Some(url) = node.service_url(ServiceKind::Pprof) {
            match CpuProfileSensor::new(&tag, url, &self.output_dir) {
                Ok(sensor) => {
                    if let Err(err) = self.profiles.add_subject(tag.clone(), Arc::new(sensor)) {
                        warn!(node = %tag, %err, "cannot sample cpu profiles");
                    }
                }
                Err(err) => warn!(node = %tag, %err, "cannot prepare profile directory"),
            }
        }
    }

    fn after_node_removal(&self, node: &DynNode) {
        let tag = NodeTag(node.label().to_owned());
        self.poller.remove_node(&tag);
        let profiles = Arc::clone(&self.profiles);
        tokio::spawn(async move {
            if let Err(err) = profiles.remove_subject(&tag).await {
                debug!(node = %tag, %err, "profile sampler already stopped");
            }
        });
    }
}

impl NodeObservationListener {
    /// Stops the scrape tasks owned by this listener; series data stays in
    /// the monitor.
    pub async fn shutdown(&self) {
        self.poller.shutdown().await;
    }
}

/// Installs the standard metric sources into the monitor and registers the
/// listeners that keep them fed as the network changes.
pub fn install_default_sources(
    monitor: &Arc<Monitor>,
    network: &Arc<dyn Network>,
    dispatcher: &Arc<LogDispatcher>,
    clock: &Arc<dyn Clock>,
) -> Result<Arc<NodeObservationListener>, MonitorError> {
    // Log-driven node sources.
    let block_status = NodeBlockStatusSource::new();
    dispatcher.register_block_listener(block_status.clone());
    monitor.install_source(block_status)?;

    let throughput = NodeTxThroughputSource::new();
    dispatcher.register_block_listener(throughput.clone());
    monitor.install_source(throughput)?;

    for (name, window) in THROUGHPUT_SMA_WINDOWS.iter().copied() {
        let metric = squall_core::monitoring::Metric::new(name, "Throughput moving average");
        monitor.install_source(BlockSeriesTransformSource::sma(
            metric,
            NODE_TX_THROUGHPUT,
            Arc::downgrade(monitor),
            window,
        ))?;
    }

    // Prometheus streams.
    for spec in DEFAULT_PROM_METRICS {
        monitor.install_source(PromSeriesSource::install(spec, dispatcher))?;
    }

    // Periodic samplers.
    let node_count = Arc::new(PeriodicSource::new(NETWORK_NODE_COUNT, Arc::clone(clock)));
    node_count
        .add_subject(
            squall_core::monitoring::NetworkTag,
            NodeCountSensor::new(network),
        )
        .expect("fresh sampler has no subjects");
    monitor.install_source(node_count)?;

    let sent: Arc<PeriodicSource<AppTag, u64>> =
        Arc::new(PeriodicSource::new(APP_SENT_TRANSACTIONS, Arc::clone(clock)));
    let received: Arc<PeriodicSource<AppTag, u64>> = Arc::new(PeriodicSource::new(
        APP_RECEIVED_TRANSACTIONS,
        Arc::clone(clock),
    ));
    monitor.install_source(sent.clone())?;
    monitor.install_source(received.clone())?;
    network.register_listener(AppObservationListener::new(sent, received));

    let profiles: Arc<PeriodicSource<NodeTag, u64>> = Arc::new(PeriodicSource::with_period(
        NODE_CPU_PROFILE,
        Arc::clone(clock),
        PROFILE_PERIOD,
    ));
    monitor.install_source(profiles.clone())?;

    let node_listener = Arc::new(NodeObservationListener {
        dispatcher: Arc::clone(dispatcher),
        poller: Arc::new(PrometheusPoller::new(Arc::clone(dispatcher))),
        profiles,
        output_dir: monitor.config().output_dir.clone(),
    });
    network.register_listener(node_listener.clone());
    // Nodes started before the monitor, the genesis validators in
    // particular, have to be picked up as well.
    for node in network.active_nodes() {
        node_listener.after_node_creation(&node);
    }

    Ok(node_listener)
}
