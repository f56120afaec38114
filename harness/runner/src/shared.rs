use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use squall_driver::{
    Application, DynApplication, DynNode, Network, NetworkError, NetworkListener, RpcClient,
    network::ApplicationConfig,
};
use squall_load::{AppContext, AppController, Application as LoadApplication, User as _};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Listener membership shared by all network variants. Registration is
/// idempotent; the set is copied before notifying so a listener may mutate
/// the membership from within its callback.
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn NetworkListener>>>,
}

impl ListenerSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, listener: Arc<dyn NetworkListener>) {
        let mut listeners = self.listeners.lock().expect("listener set poisoned");
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn unregister(&self, listener: &Arc<dyn NetworkListener>) {
        self.listeners
            .lock()
            .expect("listener set poisoned")
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    fn snapshot(&self) -> Vec<Arc<dyn NetworkListener>> {
        self.listeners.lock().expect("listener set poisoned").clone()
    }

    pub fn notify_node_created(&self, node: &DynNode) {
        for listener in self.snapshot() {
            listener.after_node_creation(node);
        }
    }

    pub fn notify_node_removed(&self, node: &DynNode) {
        for listener in self.snapshot() {
            listener.after_node_removal(node);
        }
    }

    pub fn notify_application_created(&self, app: &DynApplication) {
        for listener in self.snapshot() {
            listener.after_application_creation(app);
        }
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Applications registered with a network, with the id counter new
/// applications draw from.
pub struct AppRegistry {
    apps: Mutex<Vec<DynApplication>>,
    next_id: AtomicU32,
}

impl AppRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            apps: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn next_app_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, app: DynApplication) {
        self.apps.lock().expect("app registry poisoned").push(app);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<DynApplication> {
        self.apps.lock().expect("app registry poisoned").clone()
    }

    /// Stops every registered application, collecting failures.
    pub async fn stop_all(&self) -> Vec<String> {
        let apps = self.snapshot();
        let mut failures = Vec::new();
        for app in apps {
            if let Err(err) = app.stop().await {
                failures.push(format!("failed to stop application {}: {err}", app.label()));
            }
        }
        failures
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The network-facing face of one load controller: lifecycle plus the
/// sent/received counters the monitor samples.
pub struct ControlledApplication {
    label: String,
    controller: Arc<AppController>,
    application: Arc<dyn LoadApplication>,
    rpc: Arc<dyn RpcClient>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlledApplication {
    #[must_use]
    pub fn new(
        label: String,
        controller: Arc<AppController>,
        application: Arc<dyn LoadApplication>,
        rpc: Arc<dyn RpcClient>,
    ) -> Self {
        Self {
            label,
            controller,
            application,
            rpc,
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Application for ControlledApplication {
    fn label(&self) -> &str {
        &self.label
    }

    async fn start(&self) -> Result<(), NetworkError> {
        let mut task = self.task.lock().expect("application poisoned");
        if task.is_some() {
            return Ok(());
        }
        info!(app = %self.label, "starting application");

        let token = CancellationToken::new();
        *self.cancel.lock().expect("application poisoned") = Some(token.clone());
        let controller = Arc::clone(&self.controller);
        let label = self.label.clone();
        *task = Some(tokio::spawn(async move {
            if let Err(err) = controller.run(token).await {
                warn!(app = %label, %err, "load controller failed");
            }
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<(), NetworkError> {
        let task = {
            if let Some(cancel) = self.cancel.lock().expect("application poisoned").take() {
                cancel.cancel();
            }
            self.task.lock().expect("application poisoned").take()
        };
        if let Some(task) = task {
            info!(app = %self.label, "stopping application");
            task.await
                .map_err(|err| NetworkError::Other(format!("load task failed: {err}")))?;
        }
        Ok(())
    }

    fn sent_transactions(&self, user: usize) -> u64 {
        self.controller
            .users()
            .get(user)
            .map_or(0, |user| user.sent_transactions())
    }

    async fn received_transactions(&self) -> Result<u64, NetworkError> {
        self.application
            .received_transactions(&self.rpc)
            .await
            .map_err(|err| NetworkError::Other(err.to_string()))
    }

    fn user_count(&self) -> usize {
        self.controller.users().len()
    }
}

/// Builds the load pipeline for an application: the typed application, its
/// shaper, the controller and the network-facing wrapper. Shared by every
/// network variant.
pub(crate) async fn create_controlled_application(
    config: &ApplicationConfig,
    context: &AppContext,
    network: Arc<dyn Network>,
    chain_id: u64,
    app_id: u32,
) -> Result<DynApplication, NetworkError> {
    let application = squall_load::new_application(&config.app_type, chain_id, app_id)
        .map_err(|err| NetworkError::ApplicationCreation(err.to_string()))?;
    let shaper = squall_load::from_rate(config.rate.as_ref());
    let controller = AppController::new(
        Arc::clone(&application),
        shaper,
        config.users.max(1),
        context,
        network,
    )
    .await
    .map_err(|err| NetworkError::ApplicationCreation(err.to_string()))?;

    Ok(Arc::new(ControlledApplication::new(
        config.name.clone(),
        Arc::new(controller),
        application,
        context.rpc(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingListener {
        created: std::sync::atomic::AtomicU32,
    }

    impl NetworkListener for CountingListener {
        fn after_application_creation(&self, _app: &DynApplication) {
            self.created
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    struct NoopApp;

    #[async_trait]
    impl Application for NoopApp {
        fn label(&self) -> &str {
            "noop"
        }

        async fn start(&self) -> Result<(), NetworkError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), NetworkError> {
            Ok(())
        }

        fn sent_transactions(&self, _user: usize) -> u64 {
            0
        }

        async fn received_transactions(&self) -> Result<u64, NetworkError> {
            Ok(0)
        }

        fn user_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn listener_registration_is_idempotent() {
        let set = ListenerSet::new();
        let listener = Arc::new(CountingListener {
            created: std::sync::atomic::AtomicU32::new(0),
        });
        let dyn_listener: Arc<dyn NetworkListener> = listener.clone();

        set.register(dyn_listener.clone());
        set.register(dyn_listener.clone());

        let app: DynApplication = Arc::new(NoopApp);
        set.notify_application_created(&app);
        assert_eq!(listener.created.load(std::sync::atomic::Ordering::Relaxed), 1);

        set.unregister(&dyn_listener);
        set.notify_application_created(&app);
        assert_eq!(listener.created.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn app_ids_are_unique_and_increasing() {
        let registry = AppRegistry::new();
        assert_eq!(registry.next_app_id(), 0);
        assert_eq!(registry.next_app_id(), 1);
        assert_eq!(registry.next_app_id(), 2);
    }
}
