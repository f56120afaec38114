use std::sync::{Arc, Mutex, OnceLock, Weak};

use alloy_primitives::{Address, Bytes, U256, address};
use async_trait::async_trait;
use rand::seq::SliceRandom as _;
use squall_core::ErrorList;
use squall_driver::{
    DynApplication, DynNode, Network, NetworkConfig, NetworkError, NetworkListener, Node as _,
    NodeConfig, RpcClient, RpcError, SignedTransaction,
    network::ApplicationConfig,
    rpc::{DEFAULT_RETRY_ATTEMPTS, retry},
    rules::{ChainRules, RuleMap, RuleVocabulary, diff_rules},
    scenario::instance_label,
};
use squall_load::{Account, AppContext};
use tracing::{info, warn};

use crate::{
    provision::NodeProvisioner,
    shared::{AppRegistry, ListenerSet, create_controlled_application},
};

/// Governance contract consuming rule-update payloads.
pub const RULES_CONTRACT_ADDRESS: Address = address!("d100ae0000000000000000000000000000000000");

const RULES_UPDATE_GAS_LIMIT: u64 = 1_000_000;

/// Funded account driving treasury operations on harness-provisioned chains.
pub const DEFAULT_TREASURY_KEY: &str =
    "163f5f0f9a621d72fedd85ffca3d08d131ab4e812181e0d30ffd1c885d20aac7";

/// A locally orchestrated cluster: nodes come and go through the
/// provisioner, rule updates are translated and broadcast as governance
/// transactions.
pub struct LocalNetwork {
    config: NetworkConfig,
    provisioner: Box<dyn NodeProvisioner>,
    nodes: Mutex<Vec<DynNode>>,
    listeners: ListenerSet,
    apps: AppRegistry,
    vocabulary: RuleVocabulary,
    rules: tokio::sync::Mutex<ChainRules>,
    context: AppContext,
    chain_id: u64,
    self_ref: OnceLock<Weak<dyn Network>>,
}

impl LocalNetwork {
    /// Starts the validator groups declared in the configuration and
    /// prepares the treasury over one of their RPC endpoints. Genesis rule
    /// overrides are consumed here, before the first scenario event.
    pub async fn new(
        config: NetworkConfig,
        provisioner: Box<dyn NodeProvisioner>,
    ) -> Result<Arc<Self>, NetworkError> {
        let vocabulary = RuleVocabulary::standard();
        let mut rules = ChainRules::default();
        vocabulary
            .configure_from_map(&mut rules, &config.genesis_rules)
            .map_err(|err| NetworkError::Rules(err.to_string()))?;

        let mut nodes: Vec<DynNode> = Vec::new();
        for group in &config.validators {
            for instance in 0..group.instances {
                let label = instance_label(&group.name, instance, group.instances);
                let node_config = NodeConfig {
                    name: label,
                    failing: group.failing,
                    validator: true,
                    image: group.image.clone(),
                    data_volume: None,
                };
                nodes.push(provisioner.start_node(&node_config).await?);
            }
        }

        let first = nodes
            .first()
            .ok_or_else(|| NetworkError::Other("network needs at least one validator".into()))?;
        let rpc = first.dial_rpc().await?;
        let chain_id = rpc.chain_id().await?;
        let treasury = Account::from_private_key(DEFAULT_TREASURY_KEY, chain_id)
            .map_err(|err| NetworkError::Other(err.to_string()))?;
        let context = AppContext::new(rpc, treasury)
            .await
            .map_err(|err| NetworkError::Other(err.to_string()))?;

        let network = Arc::new(Self {
            config,
            provisioner,
            nodes: Mutex::new(nodes),
            listeners: ListenerSet::new(),
            apps: AppRegistry::new(),
            vocabulary,
            rules: tokio::sync::Mutex::new(rules),
            context,
            chain_id,
            self_ref: OnceLock::new(),
        });
        let as_network: Arc<dyn Network> = network.clone();
        network
            .self_ref
            .set(Arc::downgrade(&as_network))
            .expect("self reference is set once");
        Ok(network)
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn self_network(&self) -> Result<Arc<dyn Network>, NetworkError> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| NetworkError::Other("network is shutting down".into()))
    }
}

#[async_trait]
impl Network for LocalNetwork {
    async fn create_node(&self, config: &NodeConfig) -> Result<DynNode, NetworkError> {
        let node = self.provisioner.start_node(config).await?;
        self.nodes
            .lock()
            .expect("local network poisoned")
            .push(node.clone());
        self.listeners.notify_node_created(&node);
        Ok(node)
    }

    async fn remove_node(&self, node: &DynNode) -> Result<(), NetworkError> {
        let removed = {
            let mut nodes = self.nodes.lock().expect("local network poisoned");
            let before = nodes.len();
            nodes.retain(|known| !Arc::ptr_eq(known, node));
            nodes.len() != before
        };
        if !removed {
            return Err(NetworkError::NodeNotFound(node.label().to_owned()));
        }
        self.listeners.notify_node_removed(node);
        Ok(())
    }

    async fn create_application(
        &self,
        config: &ApplicationConfig,
    ) -> Result<DynApplication, NetworkError> {
        let app = create_controlled_application(
            config,
            &self.context,
            self.self_network()?,
            self.chain_id,
            self.apps.next_app_id(),
        )
        .await?;
        self.apps.register(app.clone());
        self.listeners.notify_application_created(&app);
        Ok(app)
    }

    fn active_nodes(&self) -> Vec<DynNode> {
        self.nodes.lock().expect("local network poisoned").clone()
    }

    fn active_applications(&self) -> Vec<DynApplication> {
        self.apps.snapshot()
    }

    fn register_listener(&self, listener: Arc<dyn NetworkListener>) {
        self.listeners.register(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn NetworkListener>) {
        self.listeners.unregister(listener);
    }

    async fn send_transaction(&self, tx: SignedTransaction) {
        let client = match self.dial_random_rpc().await {
            Ok(client) => client,
            Err(err) => {
                warn!(%err, "dropping transaction, no endpoint reachable");
                return;
            }
        };
        if let Err(err) = client.send_raw_transaction(&tx.raw).await {
            warn!(%err, hash = %tx.hash, "dropping transaction, submission failed");
        }
    }

    async fn dial_random_rpc(&self) -> Result<Arc<dyn RpcClient>, RpcError> {
        let nodes = self.active_nodes();
        if nodes.is_empty() {
            return Err(RpcError::Transport("no active nodes".to_owned()));
        }
        retry(DEFAULT_RETRY_ATTEMPTS, || {
            let node = nodes
                .choose(&mut rand::thread_rng())
                .cloned()
                .expect("node list is non-empty");
            async move { node.dial_rpc().await }
        })
        .await
    }

    async fn apply_network_rules(&self, update: &RuleMap) -> Result<(), NetworkError> {
        let mut current = self.rules.lock().await;
        let mut updated = current.clone();
        self.vocabulary
            .configure_from_map(&mut updated, update)
            .map_err(|err| NetworkError::Rules(err.to_string()))?;

        let diff = diff_rules(&current, &updated);
        if diff.as_object().is_some_and(serde_json::Map::is_empty) {
            info!("network rules unchanged, nothing to broadcast");
            return Ok(());
        }
        let payload =
            serde_json::to_vec(&diff).map_err(|err| NetworkError::Rules(err.to_string()))?;
        info!(diff = %diff, "broadcasting network rule update");

        let tx = self
            .context
            .treasury()
            .sign_call(
                RULES_CONTRACT_ADDRESS,
                U256::ZERO,
                Bytes::from(payload),
                RULES_UPDATE_GAS_LIMIT,
            )
            .map_err(|err| NetworkError::Rules(err.to_string()))?;

        let rpc = self.context.rpc();
        let hash = rpc.send_raw_transaction(&tx.raw).await?;
        let receipt = rpc.wait_transaction_receipt(hash).await?;
        if !receipt.succeeded() {
            return Err(NetworkError::Rules(format!(
                "rule update transaction {hash} was rejected"
            )));
        }
        match rpc.get_rules().await {
            Ok(active) => tracing::debug!(%active, "rules reported by the network"),
            Err(err) => tracing::debug!(%err, "cannot read back network rules"),
        }

        *current = updated;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), NetworkError> {
        info!("shutting down local network");
        let mut failures = self.apps.stop_all().await;

        let nodes: Vec<DynNode> = {
            let mut nodes = self.nodes.lock().expect("local network poisoned");
            nodes.drain(..).collect()
        };
        for node in nodes {
            if let Err(err) = node.stop().await {
                failures.push(format!("failed to stop node {}: {err}", node.label()));
            }
            if let Err(err) = node.cleanup().await {
                failures.push(format!("failed to clean up node {}: {err}", node.label()));
            }
        }

        ErrorList::join(failures).map_err(NetworkError::Shutdown)
    }
}
