use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU16, Ordering},
    },
};

use async_trait::async_trait;
use squall_driver::{
    DynNode, NetworkError, Node, NodeConfig, ServiceKind,
    rpc::{DEFAULT_RETRY_ATTEMPTS, HttpRpcClient, RpcClient, RpcError, retry},
};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::info;
use url::Url;

/// Brings nodes up and hands them to the network. Container and cluster
/// orchestration live behind this contract, outside the harness; the
/// in-repo implementation launches client processes on the local host.
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    async fn start_node(&self, config: &NodeConfig) -> Result<DynNode, NetworkError>;
}

/// Launches one client process per node with distinct ports, capturing its
/// stdout as the node's log stream.
pub struct ProcessProvisioner {
    binary: PathBuf,
    data_root: PathBuf,
    next_port: AtomicU16,
}

const FIRST_PORT: u16 = 18545;
const PORTS_PER_NODE: u16 = 3;

impl ProcessProvisioner {
    #[must_use]
    pub fn new(binary: PathBuf, data_root: PathBuf) -> Self {
        Self {
            binary,
            data_root,
            next_port: AtomicU16::new(FIRST_PORT),
        }
    }

    fn allocate_ports(&self) -> (u16, u16, u16) {
        let base = self.next_port.fetch_add(PORTS_PER_NODE, Ordering::Relaxed);
        (base, base + 1, base + 2)
    }
}

fn local_url(port: u16, path: &str) -> Url {
    Url::parse(&format!("http://127.0.0.1:{port}{path}")).expect("loopback url is valid")
}

#[async_trait]
impl NodeProvisioner for ProcessProvisioner {
    async fn start_node(&self, config: &NodeConfig) -> Result<DynNode, NetworkError> {
        let (rpc_port, metrics_port, pprof_port) = self.allocate_ports();
        let data_dir = self.data_root.join(&config.name);
        std::fs::create_dir_all(&data_dir)
            .map_err(|err| NetworkError::NodeCreation(err.to_string()))?;

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("--datadir")
            .arg(&data_dir)
            .args(["--http", "--http.port", &rpc_port.to_string()])
            .args(["--metrics", "--metrics.port", &metrics_port.to_string()])
            .args(["--pprof", "--pprof.port", &pprof_port.to_string()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if config.validator {
            command.arg("--validator");
        }

        info!(node = %config.name, rpc_port, "launching client process");
        let mut child = command
            .spawn()
            .map_err(|err| NetworkError::NodeCreation(format!("cannot launch client: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .map(|stdout| Box::new(BufReader::new(stdout)) as Box<dyn AsyncBufRead + Send + Unpin>);

        let node = Arc::new(ProvisionedNode {
            label: config.name.clone(),
            failing: config.failing,
            rpc_url: local_url(rpc_port, "/"),
            metrics_url: local_url(metrics_port, "/metrics"),
            pprof_url: local_url(pprof_port, "/debug/pprof/profile"),
            child: Mutex::new(Some(child)),
            log_stream: Mutex::new(stdout),
            data_dir,
        });

        // The process is up once its RPC endpoint answers.
        node.dial_rpc()
            .await
            .map_err(|err| NetworkError::NodeCreation(format!("node never became ready: {err}")))?;
        Ok(node)
    }
}

/// A node backed by a locally launched client process.
pub struct ProvisionedNode {
    label: String,
    failing: bool,
    rpc_url: Url,
    metrics_url: Url,
    pprof_url: Url,
    child: Mutex<Option<tokio::process::Child>>,
    log_stream: Mutex<Option<Box<dyn AsyncBufRead + Send + Unpin>>>,
    data_dir: PathBuf,
}

#[async_trait]
impl Node for ProvisionedNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_expected_failure(&self) -> bool {
        self.failing
    }

    fn service_url(&self, kind: ServiceKind) -> Option<Url> {
        match kind {
            ServiceKind::Rpc => Some(self.rpc_url.clone()),
            ServiceKind::Metrics => Some(self.metrics_url.clone()),
            ServiceKind::Pprof => Some(self.pprof_url.clone()),
        }
    }

    async fn node_id(&self) -> Result<String, NetworkError> {
        let client = self.dial_rpc().await?;
        let info = client
            .call("admin_nodeInfo", serde_json::json!([]))
            .await
            .map_err(NetworkError::Rpc)?;
        info["id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| NetworkError::Other("node info carries no id".to_owned()))
    }

    async fn dial_rpc(&self) -> Result<Arc<dyn RpcClient>, RpcError> {
        let url = self.rpc_url.clone();
        retry(DEFAULT_RETRY_ATTEMPTS, || {
            let url = url.clone();
            async move {
                let client = HttpRpcClient::new(url);
                client.block_number().await?;
                Ok::<Arc<dyn RpcClient>, RpcError>(Arc::new(client))
            }
        })
        .await
    }

    fn take_log_stream(&self) -> Option<Box<dyn AsyncBufRead + Send + Unpin>> {
        self.log_stream.lock().expect("node poisoned").take()
    }

    async fn stop(&self) -> Result<(), NetworkError> {
        let child = self.child.lock().expect("node poisoned").take();
        let Some(mut child) = child else {
            return Ok(());
        };
        info!(node = %self.label, "stopping client process");
        child
            .kill()
            .await
            .map_err(|err| NetworkError::Other(format!("cannot stop client: {err}")))?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), NetworkError> {
        tokio::fs::remove_dir_all(&self.data_dir)
            .await
            .map_err(|err| NetworkError::Other(format!("cannot remove node data: {err}")))
    }
}
