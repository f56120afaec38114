use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use squall_core::ErrorList;
use tokio::io::AsyncBufRead;
use url::Url;

use crate::{
    rpc::{RpcClient, RpcError, SignedTransaction},
    rules::RuleMap,
    scenario::{Rate, ValidatorDecl},
};

/// Image used for client nodes when a scenario does not name one.
pub const DEFAULT_CLIENT_IMAGE: &str = "sonic";

pub type DynNode = Arc<dyn Node>;
pub type DynApplication = Arc<dyn Application>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("operation is not supported by this network")]
    Unsupported,
    #[error("node {0} is not part of the network")]
    NodeNotFound(String),
    #[error("failed to create node: {0}")]
    NodeCreation(String),
    #[error("failed to create application: {0}")]
    ApplicationCreation(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("network rules update failed: {0}")]
    Rules(String),
    #[error("network shutdown failed:\n{0}")]
    Shutdown(ErrorList),
    #[error("{0}")]
    Other(String),
}

/// Endpoints a node may expose besides its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Rpc,
    Metrics,
    Pprof,
}

impl std::fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("label", &self.label())
            .field("is_expected_failure", &self.is_expected_failure())
            .finish()
    }
}

/// A running client node as seen by the harness.
#[async_trait]
pub trait Node: Send + Sync {
    /// Stable label identifying the node across the run.
    fn label(&self) -> &str;

    /// Whether the scenario declared this node as faulty; such nodes are
    /// excluded from must-agree invariants but must show up in the observed
    /// failure set.
    fn is_expected_failure(&self) -> bool;

    fn service_url(&self, kind: ServiceKind) -> Option<Url>;

    /// Client-reported identity, available once the node finished startup.
    async fn node_id(&self) -> Result<String, NetworkError>;

    async fn dial_rpc(&self) -> Result<Arc<dyn RpcClient>, RpcError>;

    /// One-shot handle on the node's log output, consumed by the monitoring
    /// dispatcher.
    fn take_log_stream(&self) -> Option<Box<dyn AsyncBufRead + Send + Unpin>>;

    async fn stop(&self) -> Result<(), NetworkError>;

    async fn cleanup(&self) -> Result<(), NetworkError>;
}

/// A load-producing application registered with the network.
#[async_trait]
pub trait Application: Send + Sync {
    fn label(&self) -> &str;

    async fn start(&self) -> Result<(), NetworkError>;

    async fn stop(&self) -> Result<(), NetworkError>;

    /// Transactions generated so far by the given user.
    fn sent_transactions(&self, user: usize) -> u64;

    /// Transactions the chain reports as processed for this application.
    async fn received_transactions(&self) -> Result<u64, NetworkError>;

    fn user_count(&self) -> usize;
}

/// Callbacks fired on network membership changes. Registration is idempotent;
/// notifications are delivered in registration order without atomicity across
/// listeners.
pub trait NetworkListener: Send + Sync {
    fn after_node_creation(&self, _node: &DynNode) {}
    fn after_node_removal(&self, _node: &DynNode) {}
    fn after_application_creation(&self, _app: &DynApplication) {}
}

/// Execution environment scenarios run against: locally provisioned clusters
/// and externally hosted chains implement the same contract, so the executor
/// never needs to know which one it drives.
#[async_trait]
pub trait Network: Send + Sync {
    /// Brings a new node into the network. External networks report
    /// [`NetworkError::Unsupported`].
    async fn create_node(&self, config: &NodeConfig) -> Result<DynNode, NetworkError>;

    /// Detaches a node from the network without stopping it.
    async fn remove_node(&self, node: &DynNode) -> Result<(), NetworkError>;

    async fn create_application(
        &self,
        config: &ApplicationConfig,
    ) -> Result<DynApplication, NetworkError>;

    fn active_nodes(&self) -> Vec<DynNode>;

    fn active_applications(&self) -> Vec<DynApplication>;

    fn register_listener(&self, listener: Arc<dyn NetworkListener>);

    fn unregister_listener(&self, listener: &Arc<dyn NetworkListener>);

    /// Fire-and-forget submission to one RPC endpoint; dial or send failures
    /// are logged and the transaction is dropped.
    async fn send_transaction(&self, tx: SignedTransaction);

    /// A usable RPC client for a random endpoint, retried with backoff.
    async fn dial_random_rpc(&self) -> Result<Arc<dyn RpcClient>, RpcError>;

    /// Translates and broadcasts a rule update. External networks report
    /// [`NetworkError::Unsupported`].
    async fn apply_network_rules(&self, rules: &RuleMap) -> Result<(), NetworkError>;

    /// Stops all applications, then all nodes; failures are aggregated.
    async fn shutdown(&self) -> Result<(), NetworkError>;
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub name: String,
    pub failing: bool,
    pub validator: bool,
    pub image: String,
    pub data_volume: Option<String>,
}

impl NodeConfig {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            failing: false,
            validator: false,
            image: DEFAULT_CLIENT_IMAGE.to_owned(),
            data_volume: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApplicationConfig {
    pub name: String,
    /// Which on-chain application generates the traffic.
    pub app_type: String,
    /// Tx/s shape the application should produce while active.
    pub rate: Option<Rate>,
    /// Number of users sending transactions to the application.
    pub users: usize,
}

/// A group of validators started with the network.
#[derive(Clone, Debug)]
pub struct ValidatorGroup {
    pub name: String,
    pub failing: bool,
    pub instances: u32,
    pub image: String,
}

impl ValidatorGroup {
    #[must_use]
    pub fn default_group(instances: u32) -> Vec<Self> {
        vec![Self {
            name: "validator".to_owned(),
            failing: false,
            instances,
            image: DEFAULT_CLIENT_IMAGE.to_owned(),
        }]
    }

    #[must_use]
    pub fn from_declarations(declarations: &[ValidatorDecl]) -> Vec<Self> {
        if declarations.is_empty() {
            return Self::default_group(1);
        }
        declarations
            .iter()
            .map(|decl| Self {
                name: decl.name.clone(),
                failing: decl.failing,
                instances: decl.instance_count(),
                image: decl
                    .imagename
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CLIENT_IMAGE.to_owned()),
            })
            .collect()
    }
}

/// Parameters shared by all network variants.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub validators: Vec<ValidatorGroup>,
    /// Genesis rule overrides consumed at network construction.
    pub genesis_rules: RuleMap,
    pub output_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            validators: ValidatorGroup::default_group(1),
            genesis_rules: RuleMap::new(),
            output_dir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;

    #[test]
    fn validator_groups_default_to_one_validator() {
        let groups = ValidatorGroup::from_declarations(&[]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].instances, 1);
        assert_eq!(groups[0].image, DEFAULT_CLIENT_IMAGE);
    }

    #[test]
    fn validator_groups_follow_declarations() {
        let scenario = Scenario::from_yaml(
            "name: X\nduration: 1\nvalidators:\n  - name: v\n    instances: 3\n    failing: true\n",
        )
        .unwrap();
        let groups = ValidatorGroup::from_declarations(&scenario.validators);
        assert_eq!(groups[0].instances, 3);
        assert!(groups[0].failing);
    }
}
