use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use squall_driver::{Network, RpcClient};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    app::{AppContext, AppError, Application, User},
    shaper::{LoadInfo, Shaper},
};

/// Pacing tick converting the shaper integral into discrete send signals.
const PACING_TICK: Duration = Duration::from_millis(100);

/// Capacity of each user's trigger channel; signals beyond it are dropped
/// and surfaced as underflow.
const TRIGGER_BUFFER: usize = 100;

/// Drives one application: creates its users, paces the shaper and fans the
/// send signals out over per-user emitter tasks.
pub struct AppController {
    application: Arc<dyn Application>,
    shaper: Mutex<Box<dyn Shaper>>,
    users: Vec<Arc<dyn User>>,
    network: Arc<dyn Network>,
    rpc: Arc<dyn RpcClient>,
    underflows: AtomicU64,
}

struct ControllerLoad {
    users: Vec<Arc<dyn User>>,
    application: Arc<dyn Application>,
    rpc: Arc<dyn RpcClient>,
}

#[async_trait]
impl LoadInfo for ControllerLoad {
    async fn sent_transactions(&self) -> Result<u64, String> {
        Ok(self.users.iter().map(|user| user.sent_transactions()).sum())
    }

    async fn received_transactions(&self) -> Result<u64, String> {
        self.application
            .received_transactions(&self.rpc)
            .await
            .map_err(|err| err.to_string())
    }
}

impl AppController {
    /// Creates the controller and its users over one shared RPC connection.
    pub async fn new(
        application: Arc<dyn Application>,
        shaper: Box<dyn Shaper>,
        num_users: usize,
        context: &AppContext,
        network: Arc<dyn Network>,
    ) -> Result<Self, AppError> {
        let users = application.create_users(context, num_users).await?;
        Ok(Self {
            application,
            shaper: Mutex::new(shaper),
            users,
            network,
            rpc: context.rpc(),
            underflows: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn users(&self) -> &[Arc<dyn User>] {
        &self.users
    }

    /// Send signals dropped because an emitter could not keep up.
    #[must_use]
    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    /// Runs the load until cancellation. Emitter tasks are joined before the
    /// call returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AppError> {
        info!(users = self.users.len(), "starting load controller");

        let mut emitters = JoinSet::new();
        let mut triggers = Vec::with_capacity(self.users.len());
        for user in &self.users {
            let (sender, mut receiver) = mpsc::channel::<()>(TRIGGER_BUFFER);
            triggers.push(sender);
            let user = Arc::clone(user);
            let network = Arc::clone(&self.network);
            emitters.spawn(async move {
                while receiver.recv().await.is_some() {
                    match user.generate_tx() {
                        Ok(tx) => network.send_transaction(tx).await,
                        Err(err) => warn!(%err, "failed to generate transaction"),
                    }
                }
            });
        }

        self.pace(&triggers, &cancel).await;

        // Closing the triggers lets every emitter drain and exit.
        drop(triggers);
        while emitters.join_next().await.is_some() {}

        let underflows = self.underflows();
        if underflows > 0 {
            warn!(underflows, "load was produced slower than requested");
        }
        Ok(())
    }

    async fn pace(&self, triggers: &[mpsc::Sender<()>], cancel: &CancellationToken) {
        let mut shaper = self.shaper.lock().await;
        let started = Instant::now();
        shaper.start(
            started,
            Arc::new(ControllerLoad {
                users: self.users.clone(),
                application: Arc::clone(&self.application),
                rpc: Arc::clone(&self.rpc),
            }),
        );

        let mut ticker = tokio::time::interval(PACING_TICK);
        let mut previous = started;
        let mut carry = 0.0f64;
        let mut next_user = 0usize;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let expected =
                shaper.messages_in_interval(previous, now - previous).await + carry;
            previous = now;

            let whole = expected.max(0.0).floor();
            carry = expected.max(0.0) - whole;

            for _ in 0..whole as u64 {
                let trigger = &triggers[next_user];
                next_user = (next_user + 1) % triggers.len();
                if trigger.try_send(()).is_err() {
                    self.underflows.fetch_add(1, Ordering::Relaxed);
                    debug!("trigger channel full, dropping send signal");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use squall_driver::{
        NetworkError, NetworkListener, RpcError, SignedTransaction,
        network::{ApplicationConfig, DynApplication, DynNode, NodeConfig},
        rpc::encode_block_number,
        rules::RuleMap,
    };

    use super::*;
    use crate::{
        app::{Account, AppContext, TransferApplication},
        shaper::ConstantShaper,
    };

    /// RPC double that answers enough of the wire for user creation.
    struct StubRpc;

    #[async_trait]
    impl RpcClient for StubRpc {
        async fn call(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
            match method {
                "eth_getTransactionCount" => Ok(json!("0x0")),
                "eth_sendRawTransaction" => {
                    Ok(json!(format!("{:?}", alloy_primitives::B256::repeat_byte(7))))
                }
                "eth_getTransactionReceipt" => Ok(json!({
                    "status": "0x1",
                    "blockNumber": encode_block_number(1),
                })),
                other => Err(RpcError::Protocol(format!("unexpected call to {other}"))),
            }
        }
    }

    /// Network double that only counts submissions.
    struct CountingNetwork {
        sent: AtomicU64,
    }

    #[async_trait]
    impl Network for CountingNetwork {
        async fn create_node(&self, _config: &NodeConfig) -> Result<DynNode, NetworkError> {
            Err(NetworkError::Unsupported)
        }

        async fn remove_node(&self, _node: &DynNode) -> Result<(), NetworkError> {
            Err(NetworkError::Unsupported)
        }

        async fn create_application(
            &self,
            _config: &ApplicationConfig,
        ) -> Result<DynApplication, NetworkError> {
            Err(NetworkError::Unsupported)
        }

        fn active_nodes(&self) -> Vec<DynNode> {
            Vec::new()
        }

        fn active_applications(&self) -> Vec<DynApplication> {
            Vec::new()
        }

        fn register_listener(&self, _listener: Arc<dyn NetworkListener>) {}

        fn unregister_listener(&self, _listener: &Arc<dyn NetworkListener>) {}

        async fn send_transaction(&self, _tx: SignedTransaction) {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }

        async fn dial_random_rpc(&self) -> Result<Arc<dyn RpcClient>, RpcError> {
            Ok(Arc::new(StubRpc))
        }

        async fn apply_network_rules(&self, _rules: &RuleMap) -> Result<(), NetworkError> {
            Err(NetworkError::Unsupported)
        }

        async fn shutdown(&self) -> Result<(), NetworkError> {
            Ok(())
        }
    }

    async fn context() -> AppContext {
        let rpc: Arc<dyn RpcClient> = Arc::new(StubRpc);
        AppContext::new(rpc, Account::generate(0)).await.unwrap()
    }

    #[tokio::test]
    async fn realizes_constant_rates_within_tolerance() {
        for rate in [10.0f64, 50.0, 100.0] {
            let network = Arc::new(CountingNetwork {
                sent: AtomicU64::new(0),
            });
            let context = context().await;
            let controller = AppController::new(
                Arc::new(TransferApplication::new(0, 0)),
                Box::new(ConstantShaper::new(rate)),
                10,
                &context,
                network.clone(),
            )
            .await
            .unwrap();

            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                stop.cancel();
            });

            controller.run(cancel).await.unwrap();
            handle.await.unwrap();

            let produced = network.sent.load(Ordering::Relaxed) as f64;
            let tolerance = (rate * 0.02).max(2.0);
            assert!(
                (produced - rate).abs() <= tolerance,
                "rate {rate}: produced {produced}, outside ±{tolerance}"
            );
            assert_eq!(controller.underflows(), 0);
        }
    }

    #[tokio::test]
    async fn users_are_funded_through_the_shared_connection() {
        let context = context().await;
        let application = Arc::new(TransferApplication::new(0, 1));
        let users = application.create_users(&context, 3).await.unwrap();
        assert_eq!(users.len(), 3);

        let rpc = context.rpc();
        // Receipt counting sums user nonces, all zero before any traffic.
        assert_eq!(application.received_transactions(&rpc).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_emitters_promptly() {
        let network = Arc::new(CountingNetwork {
            sent: AtomicU64::new(0),
        });
        let context = context().await;
        let controller = AppController::new(
            Arc::new(TransferApplication::new(0, 2)),
            Box::new(ConstantShaper::new(1000.0)),
            4,
            &context,
            network,
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), controller.run(cancel))
            .await
            .expect("run must return promptly after cancellation")
            .unwrap();
    }
}
