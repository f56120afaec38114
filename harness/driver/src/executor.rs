use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BinaryHeap},
    sync::Arc,
};

use squall_core::{Clock, ErrorList, Time, monitoring::Monitor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    checking::Checks,
    network::{
        Application as _, ApplicationConfig, DEFAULT_CLIENT_IMAGE, DynApplication, DynNode,
        Network, Node as _, NodeConfig,
    },
    rules::RuleMap,
    scenario::{Scenario, instance_label},
};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("scenario execution was cancelled")]
    Cancelled,
    #[error("scenario execution failed:\n{0}")]
    Failed(ErrorList),
}

/// What happens when an event fires. The discriminant order is the tie-break
/// for events scheduled at the same time.
enum EventAction {
    CreateNode(NodeConfig),
    CreateApplication(ApplicationConfig),
    StartApplication(String),
    ApplyRules(RuleMap),
    StopApplication(String),
    DestroyNode(String),
    End,
}

impl EventAction {
    const fn rank(&self) -> u8 {
        match self {
            Self::CreateNode(_) | Self::CreateApplication(_) => 0,
            Self::StartApplication(_) => 1,
            Self::ApplyRules(_) => 2,
            Self::StopApplication(_) => 3,
            Self::DestroyNode(_) => 4,
            Self::End => 5,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::CreateNode(config) => format!("create node {}", config.name),
            Self::CreateApplication(config) => format!("create application {}", config.name),
            Self::StartApplication(label) => format!("start application {label}"),
            Self::ApplyRules(rules) => format!("apply {} network rules", rules.len()),
            Self::StopApplication(label) => format!("stop application {label}"),
            Self::DestroyNode(label) => format!("destroy node {label}"),
            Self::End => "end of scenario".to_owned(),
        }
    }
}

struct Event {
    time: Time,
    action: EventAction,
    seq: u64,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then(self.action.rank().cmp(&other.action.rank()))
            .then(self.seq.cmp(&other.seq))
    }
}

struct Schedule {
    queue: BinaryHeap<Reverse<Event>>,
    next_seq: u64,
}

impl Schedule {
    fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, time: Time, action: EventAction) {
        self.queue.push(Reverse(Event {
            time,
            action,
            seq: self.next_seq,
        }));
        self.next_seq += 1;
    }

    fn pop(&mut self) -> Option<Event> {
        self.queue.pop().map(|Reverse(event)| event)
    }
}

fn build_schedule(scenario: &Scenario) -> Schedule {
    let mut schedule = Schedule::new();

    for update in &scenario.network_rules.updates {
        schedule.push(
            Time::from_secs_f64(update.time),
            EventAction::ApplyRules(update.rules.clone()),
        );
    }

    for node in &scenario.nodes {
        let total = node.instance_count();
        for instance in 0..total {
            let label = instance_label(&node.name, instance, total);
            let image = node
                .client
                .as_ref()
                .and_then(|client| client.imagename.clone())
                .unwrap_or_else(|| DEFAULT_CLIENT_IMAGE.to_owned());
            let config = NodeConfig {
                name: label.clone(),
                failing: false,
                validator: false,
                image,
                data_volume: node
                    .client
                    .as_ref()
                    .and_then(|client| client.data_volume.clone()),
            };
            schedule.push(node.start_time(), EventAction::CreateNode(config));
            schedule.push(
                node.end_time(scenario.duration),
                EventAction::DestroyNode(label),
            );
        }
    }

    for app in &scenario.applications {
        let total = app.instance_count();
        for instance in 0..total {
            let label = instance_label(&app.name, instance, total);
            let config = ApplicationConfig {
                name: label.clone(),
                app_type: app.app_type.clone(),
                rate: Some(app.rate.clone()),
                users: app.user_count() as usize,
            };
            schedule.push(app.start_time(), EventAction::CreateApplication(config));
            schedule.push(app.start_time(), EventAction::StartApplication(label.clone()));
            schedule.push(
                app.end_time(scenario.duration),
                EventAction::StopApplication(label),
            );
        }
    }

    schedule.push(scenario.end_time(), EventAction::End);
    schedule
}

/// Mutable state of a run: what exists right now and has to be torn down.
#[derive(Default)]
struct RunState {
    nodes: BTreeMap<String, DynNode>,
    applications: BTreeMap<String, DynApplication>,
    failures: Vec<String>,
}

impl RunState {
    fn note(&mut self, context: &str, err: impl std::fmt::Display) {
        warn!("{context}: {err}");
        self.failures.push(format!("{context}: {err}"));
    }
}

/// Runs the scenario's timeline against the network.
///
/// Events fire in time order, ties broken by kind; at the end of the run (or
/// on cancellation) remaining applications are stopped, remaining nodes are
/// removed, the checkers run and the monitor is shut down. Cancellation is
/// always reported as an error so interrupted runs cannot look clean.
pub async fn run(
    clock: &dyn Clock,
    network: &Arc<dyn Network>,
    scenario: &Scenario,
    checks: &Checks,
    monitor: Option<&Arc<Monitor>>,
    cancel: &CancellationToken,
) -> Result<(), ExecutorError> {
    info!(scenario = %scenario.name, duration = scenario.duration, "starting scenario");

    let mut schedule = build_schedule(scenario);
    let mut state = RunState::default();
    let mut cancelled = false;

    while let Some(event) = schedule.pop() {
        if clock.sleep_until(event.time, cancel).await.is_err() {
            info!("scenario interrupted, draining teardown");
            cancelled = true;
            break;
        }
        info!(at = %event.time, "processing event: {}", event.action.describe());
        execute_event(network, event.action, &mut state).await;
        if !state.failures.is_empty() {
            break;
        }
    }

    teardown(network, &mut state).await;

    if let Err(err) = checks.check().await {
        state.note("post-scenario checks failed", err);
    }

    if let Some(monitor) = monitor {
        if let Err(err) = monitor.shutdown().await {
            state.note("monitor shutdown failed", err);
        }
    }

    if cancelled {
        return Err(ExecutorError::Cancelled);
    }
    ErrorList::join(std::mem::take(&mut state.failures)).map_err(ExecutorError::Failed)
}

async fn execute_event(network: &Arc<dyn Network>, action: EventAction, state: &mut RunState) {
    match action {
        EventAction::CreateNode(config) => match network.create_node(&config).await {
            Ok(node) => {
                state.nodes.insert(config.name.clone(), node);
            }
            Err(err) => state.note(&format!("failed to create node {}", config.name), err),
        },
        EventAction::CreateApplication(config) => {
            match network.create_application(&config).await {
                Ok(app) => {
                    state.applications.insert(config.name.clone(), app);
                }
                Err(err) => {
                    state.note(&format!("failed to create application {}", config.name), err);
                }
            }
        }
        EventAction::StartApplication(label) => {
            if let Some(app) = state.applications.get(&label) {
                if let Err(err) = app.start().await {
                    state.note(&format!("failed to start application {label}"), err);
                }
            }
        }
        EventAction::ApplyRules(rules) => {
            if let Err(err) = network.apply_network_rules(&rules).await {
                state.note("failed to apply network rules", err);
            }
        }
        EventAction::StopApplication(label) => {
            if let Some(app) = state.applications.remove(&label) {
                if let Err(err) = app.stop().await {
                    state.note(&format!("failed to stop application {label}"), err);
                }
            }
        }
        EventAction::DestroyNode(label) => {
            if let Some(node) = state.nodes.remove(&label) {
                destroy_node(network, &label, &node, state).await;
            }
        }
        EventAction::End => {}
    }
}

async fn destroy_node(
    network: &Arc<dyn Network>,
    label: &str,
    node: &DynNode,
    state: &mut RunState,
) {
    if let Err(err) = network.remove_node(node).await {
        state.note(&format!("failed to remove node {label}"), err);
    }
    if let Err(err) = node.stop().await {
        state.note(&format!("failed to stop node {label}"), err);
    }
    if let Err(err) = node.cleanup().await {
        state.note(&format!("failed to clean up node {label}"), err);
    }
}

/// Stops whatever the timeline did not get to, applications before nodes.
async fn teardown(network: &Arc<dyn Network>, state: &mut RunState) {
    let applications = std::mem::take(&mut state.applications);
    for (label, app) in applications {
        if let Err(err) = app.stop().await {
            state.note(&format!("failed to stop application {label}"), err);
        }
    }

    let nodes = std::mem::take(&mut state.nodes);
    for (label, node) in nodes {
        destroy_node(network, &label, &node, state).await;
    }
}

#[cfg(test)]
mod tests {
    use squall_core::SimClock;

    use super::*;
    use crate::testing::FakeNetwork;

    fn scenario(text: &str) -> Scenario {
        Scenario::from_yaml(text).unwrap()
    }

    async fn run_scenario(
        clock: &SimClock,
        network: &Arc<FakeNetwork>,
        scenario: &Scenario,
    ) -> Result<(), ExecutorError> {
        let network: Arc<dyn Network> = network.clone();
        run(
            clock,
            &network,
            scenario,
            &Checks::none(),
            None,
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn empty_scenario_advances_the_clock_to_the_end() {
        let clock = SimClock::new();
        let network = FakeNetwork::new();
        let scenario = scenario("name: Test\nduration: 10\n");

        run_scenario(&clock, &network, &scenario).await.unwrap();

        assert!(clock.now() >= Time::from_secs_f64(10.0));
        assert!(network.event_log().is_empty());
    }

    #[tokio::test]
    async fn single_node_lifecycle_is_create_remove_stop_cleanup() {
        let clock = SimClock::new();
        let network = FakeNetwork::new();
        let scenario = scenario(
            "name: Test\nduration: 10\nnodes:\n  - name: A\n    start: 3\n    end: 7\n",
        );

        run_scenario(&clock, &network, &scenario).await.unwrap();

        assert_eq!(
            network.event_log(),
            vec!["create node A", "remove node A", "stop A", "cleanup A"]
        );
        assert!(clock.now() >= Time::from_secs_f64(10.0));
    }

    #[tokio::test]
    async fn multi_instance_nodes_expand_to_labelled_instances() {
        let clock = SimClock::new();
        let network = FakeNetwork::new();
        let scenario = scenario(
            "name: Test\nduration: 10\nnodes:\n  - name: A\n    instances: 2\n    start: 3\n    end: 7\n",
        );

        run_scenario(&clock, &network, &scenario).await.unwrap();

        let log = network.event_log();
        assert!(log.contains(&"create node A-0".to_owned()));
        assert!(log.contains(&"create node A-1".to_owned()));
        assert!(log.contains(&"cleanup A-1".to_owned()));
    }

    #[tokio::test]
    async fn applications_are_created_started_and_stopped() {
        let clock = SimClock::new();
        let network = FakeNetwork::new();
        let scenario = scenario(
            "name: Test\nduration: 10\napplications:\n  - name: A\n    type: transfer\n    instances: 2\n    start: 3\n    end: 7\n    rate:\n      constant: 10\n",
        );

        run_scenario(&clock, &network, &scenario).await.unwrap();

        let log = network.event_log();
        for label in ["A-0", "A-1"] {
            assert!(log.contains(&format!("create app {label}")));
            assert!(log.contains(&format!("start app {label}")));
            assert!(log.contains(&format!("stop app {label}")));
        }
        assert!(clock.now() >= Time::from_secs_f64(10.0));
    }

    #[tokio::test]
    async fn rule_updates_fire_in_declared_order() {
        let clock = SimClock::new();
        let network = FakeNetwork::new();
        let scenario = scenario(
            "name: Test\nduration: 10\nnetwork_rules:\n  updates:\n    - time: 2\n      rules:\n        MAX_BLOCK_GAS: \"20500000000\"\n    - time: 6\n      rules:\n        MAX_EPOCH_GAS: \"1500000000000\"\n",
        );

        run_scenario(&clock, &network, &scenario).await.unwrap();

        assert_eq!(
            network.event_log(),
            vec![
                "apply rules MAX_BLOCK_GAS=20500000000",
                "apply rules MAX_EPOCH_GAS=1500000000000",
            ]
        );
    }

    #[tokio::test]
    async fn equal_time_events_follow_the_kind_order() {
        let clock = SimClock::new();
        let network = FakeNetwork::new();
        let scenario = scenario(
            "name: Test\nduration: 10\napplications:\n  - name: A\n    type: transfer\n    start: 3\n    end: 3\n    rate:\n      constant: 1\n\nnetwork_rules:\n  updates:\n    - time: 3\n      rules:\n        MAX_BLOCK_GAS: \"1\"\n",
        );

        run_scenario(&clock, &network, &scenario).await.unwrap();

        assert_eq!(
            network.event_log(),
            vec![
                "create app A",
                "start app A",
                "apply rules MAX_BLOCK_GAS=1",
                "stop app A",
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_reports_an_error_and_still_tears_down() {
        let clock = SimClock::new();
        let network = FakeNetwork::new();
        let scenario = scenario(
            "name: Test\nduration: 10\nnodes:\n  - name: A\n    start: 0\n    end: 9\n",
        );

        let cancel = CancellationToken::new();
        let dyn_network: Arc<dyn Network> = network.clone();

        // The interrupt arrives while the node-creation event is in flight,
        // so the wait for the node's scheduled end returns early.
        let interrupt = cancel.clone();
        *network.create_node_hook.lock().unwrap() = Some(Box::new(move || interrupt.cancel()));

        let result = run(&clock, &dyn_network, &scenario, &Checks::none(), None, &cancel).await;

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        // Teardown still removed and cleaned the created node.
        let log = network.event_log();
        assert!(log.contains(&"create node A".to_owned()));
        assert!(log.contains(&"cleanup A".to_owned()));
    }
}
