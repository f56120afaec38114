use std::sync::{Arc, Weak};

use async_trait::async_trait;
use squall_core::monitoring::{
    AppTag, DynError, Metric, NetworkTag,
    periodic::{PeriodicSource, Sensor, TimeSeries},
};
use tracing::warn;

use crate::network::{Application as _, DynApplication, Network, NetworkListener};

pub const APP_SENT_TRANSACTIONS: Metric<AppTag, TimeSeries<u64>> = Metric::new(
    "SentTransactions",
    "Transactions generated by an application's users",
);

pub const APP_RECEIVED_TRANSACTIONS: Metric<AppTag, TimeSeries<u64>> = Metric::new(
    "ReceivedTransactions",
    "Transactions the chain processed for an application",
);

pub const NETWORK_NODE_COUNT: Metric<NetworkTag, TimeSeries<u64>> =
    Metric::new("NumberOfNodes", "Active nodes in the network");

struct SentTransactionsSensor {
    app: DynApplication,
}

#[async_trait]
impl Sensor<u64> for SentTransactionsSensor {
    async fn read(&self) -> Result<u64, DynError> {
        let total = (0..self.app.user_count())
            .map(|user| self.app.sent_transactions(user))
            .sum();
        Ok(total)
    }
}

struct ReceivedTransactionsSensor {
    app: DynApplication,
}

#[async_trait]
impl Sensor<u64> for ReceivedTransactionsSensor {
    async fn read(&self) -> Result<u64, DynError> {
        self.app
            .received_transactions()
            .await
            .map_err(|err| -> DynError { format!("receipt count unavailable: {err}").into() })
    }
}

/// Counts active nodes. The network holds monitor listeners, so the sensor
/// must hold the network weakly to keep the graph acyclic.
pub struct NodeCountSensor {
    network: Weak<dyn Network>,
}

impl NodeCountSensor {
    #[must_use]
    pub fn new(network: &Arc<dyn Network>) -> Arc<Self> {
        Arc::new(Self {
            network: Arc::downgrade(network),
        })
    }
}

#[async_trait]
impl Sensor<u64> for NodeCountSensor {
    async fn read(&self) -> Result<u64, DynError> {
        let network = self
            .network
            .upgrade()
            .ok_or("network is gone")?;
        Ok(network.active_nodes().len() as u64)
    }
}

/// Starts per-application samplers as applications appear on the network.
pub struct AppObservationListener {
    sent: Arc<PeriodicSource<AppTag, u64>>,
    received: Arc<PeriodicSource<AppTag, u64>>,
}

impl AppObservationListener {
    #[must_use]
    pub fn new(
        sent: Arc<PeriodicSource<AppTag, u64>>,
        received: Arc<PeriodicSource<AppTag, u64>>,
    ) -> Arc<Self> {
        Arc::new(Self { sent, received })
    }
}

impl NetworkListener for AppObservationListener {
    fn after_application_creation(&self, app: &DynApplication) {
        let tag = AppTag(app.label().to_owned());
        if let Err(err) = self.sent.add_subject(
            tag.clone(),
            Arc::new(SentTransactionsSensor { app: app.clone() }),
        ) {
            warn!(app = %tag, %err, "cannot sample sent transactions");
        }
        if let Err(err) = self.received.add_subject(
            tag.clone(),
            Arc::new(ReceivedTransactionsSensor { app: app.clone() }),
        ) {
            warn!(app = %tag, %err, "cannot sample received transactions");
        }
    }
}
