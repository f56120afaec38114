use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use rand::seq::SliceRandom as _;
use squall_core::ErrorList;
use squall_driver::{
    DynApplication, DynNode, HttpRpcClient, Network, NetworkError, NetworkListener, NodeConfig,
    RpcClient, RpcError, SignedTransaction,
    network::ApplicationConfig,
    rpc::{DEFAULT_RETRY_ATTEMPTS, retry},
    rules::RuleMap,
};
use squall_load::{Account, AppContext};
use tracing::{info, warn};
use url::Url;

use crate::{
    local::DEFAULT_TREASURY_KEY,
    shared::{AppRegistry, ListenerSet, create_controlled_application},
};

/// Drives load against an externally hosted chain through a fixed list of
/// RPC endpoints. The chain's nodes are not under harness control, so node
/// and rule operations are unsupported.
pub struct ExternalNetwork {
    endpoints: Vec<Url>,
    listeners: ListenerSet,
    apps: AppRegistry,
    context: AppContext,
    chain_id: u64,
    self_ref: OnceLock<Weak<dyn Network>>,
}

impl std::fmt::Debug for ExternalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalNetwork")
            .field("endpoints", &self.endpoints)
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl ExternalNetwork {
    pub async fn new(
        endpoints: Vec<Url>,
        treasury_key: Option<&str>,
    ) -> Result<Arc<Self>, NetworkError> {
        if endpoints.is_empty() {
            return Err(NetworkError::Other(
                "at least one RPC endpoint must be provided".into(),
            ));
        }

        let rpc: Arc<dyn RpcClient> = Arc::new(HttpRpcClient::new(endpoints[0].clone()));
        let chain_id = rpc.chain_id().await?;
        info!(chain_id, endpoints = endpoints.len(), "connected to external chain");

        let treasury =
            Account::from_private_key(treasury_key.unwrap_or(DEFAULT_TREASURY_KEY), chain_id)
                .map_err(|err| NetworkError::Other(err.to_string()))?;
        let context = AppContext::new(rpc, treasury)
            .await
            .map_err(|err| NetworkError::Other(err.to_string()))?;

        let network = Arc::new(Self {
            endpoints,
            listeners: ListenerSet::new(),
            apps: AppRegistry::new(),
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

    fn self_network(&self) -> Result<Arc<dyn Network>, NetworkError> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| NetworkError::Other("network is shutting down".into()))
    }
}

#[async_trait]
impl Network for ExternalNetwork {
    async fn create_node(&self, _config: &NodeConfig) -> Result<DynNode, NetworkError> {
        Err(NetworkError::Unsupported)
    }

    async fn remove_node(&self, _node: &DynNode) -> Result<(), NetworkError> {
        Err(NetworkError::Unsupported)
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

    /// External chains manage their own membership; there is nothing to
    /// enumerate.
    fn active_nodes(&self) -> Vec<DynNode> {
        Vec::new()
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
        retry(DEFAULT_RETRY_ATTEMPTS, || {
            let url = self
                .endpoints
                .choose(&mut rand::thread_rng())
                .cloned()
                .expect("endpoint list is non-empty");
            async move {
                let client = HttpRpcClient::new(url);
                client.block_number().await?;
                Ok::<Arc<dyn RpcClient>, RpcError>(Arc::new(client))
            }
        })
        .await
    }

    async fn apply_network_rules(&self, _rules: &RuleMap) -> Result<(), NetworkError> {
        Err(NetworkError::Unsupported)
    }

    async fn shutdown(&self) -> Result<(), NetworkError> {
        info!("shutting down external network connection");
        let failures = self.apps.stop_all().await;
        ErrorList::join(failures).map_err(NetworkError::Shutdown)
    }
}
