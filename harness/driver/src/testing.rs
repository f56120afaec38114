//! Hand-rolled test doubles for the network contracts.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncBufRead;
use url::Url;

use crate::{
    network::{
        Application, ApplicationConfig, DynApplication, DynNode, Network, NetworkConfig,
        NetworkError, NetworkListener, Node, NodeConfig, ServiceKind,
    },
    rpc::{BlockSummary, RpcClient, RpcError, SignedTransaction, encode_block_number},
    rules::RuleMap,
};

/// RPC double answering the block-walk subset from canned data.
pub struct FakeRpc {
    pub height: u64,
    pub blocks: Vec<Option<BlockSummary>>,
}

impl FakeRpc {
    pub fn with_height(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height,
            blocks: Vec::new(),
        })
    }

    pub fn with_blocks(blocks: Vec<Option<BlockSummary>>) -> Arc<Self> {
        Arc::new(Self { height: 2, blocks })
    }
}

fn summary_json(summary: &BlockSummary) -> Value {
    json!({
        "hash": format!("{:?}", summary.hash),
        "stateRoot": format!("{:?}", summary.state_root),
        "receiptsRoot": format!("{:?}", summary.receipts_root),
    })
}

#[async_trait]
impl RpcClient for FakeRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "eth_blockNumber" => Ok(json!(encode_block_number(self.height))),
            "eth_getBlockByNumber" => {
                let param = params[0]
                    .as_str()
                    .ok_or_else(|| RpcError::Protocol("missing block number".into()))?;
                let number = u64::from_str_radix(param.trim_start_matches("0x"), 16)
                    .map_err(|err| RpcError::Protocol(err.to_string()))?;
                Ok(self
                    .blocks
                    .get(number as usize)
                    .and_then(|block| block.as_ref())
                    .map(summary_json)
                    .unwrap_or(Value::Null))
            }
            other => Err(RpcError::Protocol(format!("unexpected call to {other}"))),
        }
    }
}

pub struct FakeNode {
    pub label: String,
    pub failing: bool,
    pub rpc: Arc<FakeRpc>,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl FakeNode {
    pub fn with_rpc(label: &str, failing: bool, rpc: Arc<FakeRpc>) -> DynNode {
        Arc::new(Self {
            label: label.to_owned(),
            failing,
            rpc,
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl Node for FakeNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_expected_failure(&self) -> bool {
        self.failing
    }

    fn service_url(&self, _kind: ServiceKind) -> Option<Url> {
        None
    }

    async fn node_id(&self) -> Result<String, NetworkError> {
        Ok(self.label.clone())
    }

    async fn dial_rpc(&self) -> Result<Arc<dyn RpcClient>, RpcError> {
        Ok(self.rpc.clone())
    }

    fn take_log_stream(&self) -> Option<Box<dyn AsyncBufRead + Send + Unpin>> {
        None
    }

    async fn stop(&self) -> Result<(), NetworkError> {
        self.events.lock().unwrap().push(format!("stop {}", self.label));
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), NetworkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("cleanup {}", self.label));
        Ok(())
    }
}

pub struct FakeApplication {
    pub label: String,
    pub events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Application for FakeApplication {
    fn label(&self) -> &str {
        &self.label
    }

    async fn start(&self) -> Result<(), NetworkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("start app {}", self.label));
        Ok(())
    }

    async fn stop(&self) -> Result<(), NetworkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("stop app {}", self.label));
        Ok(())
    }

    fn sent_transactions(&self, _user: usize) -> u64 {
        0
    }

    async fn received_transactions(&self) -> Result<u64, NetworkError> {
        Ok(0)
    }

    fn user_count(&self) -> usize {
        1
    }
}

/// Network double recording every operation in order.
pub struct FakeNetwork {
    pub config: NetworkConfig,
    pub events: Arc<Mutex<Vec<String>>>,
    pub nodes: Mutex<Vec<DynNode>>,
    pub sent: AtomicU64,
    pub listeners: Mutex<Vec<Arc<dyn NetworkListener>>>,
    pub create_node_hook: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            config: NetworkConfig::default(),
            events: Arc::new(Mutex::new(Vec::new())),
            nodes: Mutex::new(Vec::new()),
            sent: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            create_node_hook: Mutex::new(None),
        })
    }

    pub fn with_nodes(nodes: Vec<DynNode>) -> Arc<Self> {
        let network = Self::new();
        *network.nodes.lock().unwrap() = nodes;
        network
    }

    pub fn event_log(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn create_node(&self, config: &NodeConfig) -> Result<DynNode, NetworkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("create node {}", config.name));
        if let Some(hook) = self.create_node_hook.lock().unwrap().as_ref() {
            hook();
        }
        let node = Arc::new(FakeNode {
            label: config.name.clone(),
            failing: config.failing,
            rpc: FakeRpc::with_height(2),
            events: Arc::clone(&self.events),
        });
        self.nodes.lock().unwrap().push(node.clone());
        Ok(node)
    }

    async fn remove_node(&self, node: &DynNode) -> Result<(), NetworkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("remove node {}", node.label()));
        let mut nodes = self.nodes.lock().unwrap();
        let before = nodes.len();
        nodes.retain(|candidate| !Arc::ptr_eq(candidate, node));
        if nodes.len() == before {
            return Err(NetworkError::NodeNotFound(node.label().to_owned()));
        }
        Ok(())
    }

    async fn create_application(
        &self,
        config: &ApplicationConfig,
    ) -> Result<DynApplication, NetworkError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("create app {}", config.name));
        Ok(Arc::new(FakeApplication {
            label: config.name.clone(),
            events: Arc::clone(&self.events),
        }))
    }

    fn active_nodes(&self) -> Vec<DynNode> {
        self.nodes.lock().unwrap().clone()
    }

    fn active_applications(&self) -> Vec<DynApplication> {
        Vec::new()
    }

    fn register_listener(&self, listener: Arc<dyn NetworkListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn NetworkListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|candidate| !Arc::ptr_eq(candidate, listener));
    }

    async fn send_transaction(&self, _tx: SignedTransaction) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    async fn dial_random_rpc(&self) -> Result<Arc<dyn RpcClient>, RpcError> {
        Ok(FakeRpc::with_height(2))
    }

    async fn apply_network_rules(&self, rules: &RuleMap) -> Result<(), NetworkError> {
        let rendered: Vec<String> = rules.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.events
            .lock()
            .unwrap()
            .push(format!("apply rules {}", rendered.join(",")));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), NetworkError> {
        self.events.lock().unwrap().push("shutdown".to_owned());
        Ok(())
    }
}
