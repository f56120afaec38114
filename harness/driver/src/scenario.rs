use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use squall_core::{ErrorList, Time};

use crate::rules::RuleVocabulary;

/// A declarative load scenario: a named timeline of node and application
/// lifecycles, traffic rates and network-rule changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    /// Scenario length in seconds.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<ValidatorDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationDecl>,
    #[serde(default, skip_serializing_if = "NetworkRulesDecl::is_empty")]
    pub network_rules: NetworkRulesDecl,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cheats: Vec<CheatDecl>,
}

/// A group of validator instances present from genesis.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imagename: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failing: bool,
}

/// A node joining (and possibly leaving) the network mid-run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientDecl>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientDecl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imagename: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<String>,
}

/// A load-producing application driven by a traffic shaper.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    pub rate: Rate,
}

/// Traffic rate shape: exactly one of the supported forms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum Rate {
    /// Fixed frequency in transactions per second.
    Constant(f64),
    /// Linearly changing frequency.
    Slope { start: f64, increment: f64 },
    /// Sinusoidal frequency between `min` and `max`.
    Wave {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        max: f64,
        /// Full oscillation period in seconds.
        period: f64,
    },
    /// Closed-loop rate adapting to what the network keeps up with.
    Auto {
        #[serde(skip_serializing_if = "Option::is_none")]
        increase: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        decrease: Option<f64>,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkRulesDecl {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub genesis: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<RulesUpdateDecl>,
}

impl NetworkRulesDecl {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.genesis.is_empty() && self.updates.is_empty()
    }
}

/// A scheduled change of network rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesUpdateDecl {
    /// Seconds into the run at which the update is applied.
    pub time: f64,
    pub rules: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheatDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("failed to read scenario file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid scenario:\n{0}")]
    Invalid(ErrorList),
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yaml::from_str(text)?)
    }

    #[must_use]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).expect("scenario serialization cannot fail")
    }

    #[must_use]
    pub fn end_time(&self) -> Time {
        Time::from_secs_f64(self.duration)
    }

    /// Validates the scenario before any side effect happens. All problems
    /// are reported at once.
    pub fn check(&self, vocabulary: &RuleVocabulary) -> Result<(), ScenarioError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("scenario name must not be empty".to_owned());
        }
        if !(self.duration > 0.0) {
            problems.push(format!(
                "scenario duration must be positive, got {}",
                self.duration
            ));
        }

        for validator in &self.validators {
            if validator.instances == Some(0) {
                problems.push(format!(
                    "validator {} must have at least one instance",
                    validator.name
                ));
            }
        }

        for node in &self.nodes {
            self.check_window(&mut problems, "node", &node.name, node.start, node.end);
            if node.instances == Some(0) {
                problems.push(format!("node {} must have at least one instance", node.name));
            }
        }

        for app in &self.applications {
            self.check_window(&mut problems, "application", &app.name, app.start, app.end);
            if app.instances == Some(0) {
                problems.push(format!(
                    "application {} must have at least one instance",
                    app.name
                ));
            }
            if app.users == Some(0) {
                problems.push(format!("application {} must have at least one user", app.name));
            }
            if app.app_type.trim().is_empty() {
                problems.push(format!("application {} is missing a type", app.name));
            }
            self.check_rate(&mut problems, &app.name, &app.rate);
        }

        for key in self.network_rules.genesis.keys() {
            if !vocabulary.is_supported(key) {
                problems.push(format!("unknown genesis network rule {key}"));
            }
        }
        for update in &self.network_rules.updates {
            if update.time < 0.0 || update.time > self.duration {
                problems.push(format!(
                    "network rule update at {}s lies outside the run",
                    update.time
                ));
            }
            for key in update.rules.keys() {
                if !vocabulary.is_supported(key) {
                    problems.push(format!("unknown network rule {key}"));
                }
            }
        }

        for cheat in &self.cheats {
            if cheat.name.trim().is_empty() {
                problems.push("cheat name must not be empty".to_owned());
            }
        }

        ErrorList::join(problems).map_err(ScenarioError::Invalid)
    }

    fn check_window(
        &self,
        problems: &mut Vec<String>,
        kind: &str,
        name: &str,
        start: Option<f64>,
        end: Option<f64>,
    ) {
        let start = start.unwrap_or(0.0);
        let end = end.unwrap_or(self.duration);
        if start < 0.0 || start > self.duration {
            problems.push(format!("{kind} {name} starts outside the run at {start}s"));
        }
        if end < 0.0 || end > self.duration {
            problems.push(format!("{kind} {name} ends outside the run at {end}s"));
        }
        if start > end {
            problems.push(format!("{kind} {name} ends before it starts"));
        }
    }

    fn check_rate(&self, problems: &mut Vec<String>, app: &str, rate: &Rate) {
        match rate {
            Rate::Constant(hz) => {
                if *hz < 0.0 {
                    problems.push(format!("application {app} has a negative constant rate"));
                }
            }
            Rate::Wave { min, max, period } => {
                let min = min.unwrap_or(0.0);
                if min < 0.0 || *max < min {
                    problems.push(format!(
                        "application {app} has an invalid wave range [{min}, {max}]"
                    ));
                }
                if !(*period > 0.0) {
                    problems.push(format!("application {app} has a non-positive wave period"));
                }
            }
            Rate::Slope { .. } => {}
            Rate::Auto { increase, decrease } => {
                if increase.is_some_and(|v| v < 1.0) {
                    problems.push(format!(
                        "application {app} has an auto increase factor below 1"
                    ));
                }
                if decrease.is_some_and(|v| !(0.0..1.0).contains(&v)) {
                    problems.push(format!(
                        "application {app} has an auto decrease factor outside [0, 1)"
                    ));
                }
            }
        }
    }
}

impl NodeDecl {
    #[must_use]
    pub fn start_time(&self) -> Time {
        Time::from_secs_f64(self.start.unwrap_or(0.0))
    }

    #[must_use]
    pub fn end_time(&self, scenario_duration: f64) -> Time {
        Time::from_secs_f64(self.end.unwrap_or(scenario_duration))
    }

    #[must_use]
    pub fn instance_count(&self) -> u32 {
        self.instances.unwrap_or(1)
    }
}

impl ApplicationDecl {
    #[must_use]
    pub fn start_time(&self) -> Time {
        Time::from_secs_f64(self.start.unwrap_or(0.0))
    }

    #[must_use]
    pub fn end_time(&self, scenario_duration: f64) -> Time {
        Time::from_secs_f64(self.end.unwrap_or(scenario_duration))
    }

    #[must_use]
    pub fn instance_count(&self) -> u32 {
        self.instances.unwrap_or(1)
    }

    #[must_use]
    pub fn user_count(&self) -> u32 {
        self.users.unwrap_or(1)
    }
}

impl ValidatorDecl {
    #[must_use]
    pub fn instance_count(&self) -> u32 {
        self.instances.unwrap_or(1)
    }
}

/// Label of the `i`-th instance spawned for a declaration.
#[must_use]
pub fn instance_label(name: &str, index: u32, total: u32) -> String {
    if total <= 1 {
        name.to_owned()
    } else {
        format!("{name}-{index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocabulary() -> RuleVocabulary {
        RuleVocabulary::standard()
    }

    #[test]
    fn parses_a_minimal_scenario() {
        let scenario = Scenario::from_yaml("name: Test\nduration: 10\n").unwrap();
        assert_eq!(scenario.name, "Test");
        assert_eq!(scenario.end_time(), Time::from_secs_f64(10.0));
        scenario.check(&vocabulary()).unwrap();
    }

    #[test]
    fn parses_a_full_scenario() {
        let text = r#"
name: small
duration: 60
validators:
  - name: validator
    instances: 3
nodes:
  - name: A
    instances: 2
    start: 3
    end: 7
    client:
      imagename: sonic
applications:
  - name: load
    type: transfer
    instances: 2
    users: 5
    start: 3
    end: 7
    rate:
      constant: 10
network_rules:
  genesis:
    MAX_BLOCK_GAS: "20500000000"
  updates:
    - time: 2
      rules:
        MAX_EPOCH_GAS: "1500000000000"
"#;
        let scenario = Scenario::from_yaml(text).unwrap();
        scenario.check(&vocabulary()).unwrap();

        assert_eq!(scenario.nodes[0].instance_count(), 2);
        assert_eq!(scenario.applications[0].rate, Rate::Constant(10.0));
        assert_eq!(scenario.network_rules.updates[0].time, 2.0);
    }

    #[test]
    fn unknown_keys_are_a_parse_error() {
        let err = Scenario::from_yaml("name: X\nduration: 1\nbogus: 2\n").unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)));
    }

    #[test]
    fn rate_is_exactly_one_of() {
        let err = Scenario::from_yaml(
            "name: X\nduration: 1\napplications:\n  - name: a\n    type: transfer\n    rate:\n      constant: 1\n      wave: {max: 2, period: 1}\n",
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)));

        let slope = Scenario::from_yaml(
            "name: X\nduration: 1\napplications:\n  - name: a\n    type: transfer\n    rate:\n      slope: {start: 1, increment: 0.5}\n",
        )
        .unwrap();
        assert_eq!(
            slope.applications[0].rate,
            Rate::Slope {
                start: 1.0,
                increment: 0.5
            }
        );
    }

    #[test]
    fn validation_collects_all_problems() {
        let text = r#"
name: ""
duration: 10
nodes:
  - name: A
    start: 8
    end: 4
applications:
  - name: load
    type: transfer
    users: 0
    rate:
      wave:
        max: -1
        period: 0
network_rules:
  updates:
    - time: 20
      rules:
        NOT_A_RULE: "1"
"#;
        let err = Scenario::from_yaml(text)
            .unwrap()
            .check(&vocabulary())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("name must not be empty"));
        assert!(message.contains("ends before it starts"));
        assert!(message.contains("at least one user"));
        assert!(message.contains("invalid wave range"));
        assert!(message.contains("outside the run"));
        assert!(message.contains("unknown network rule NOT_A_RULE"));
    }

    #[test]
    fn instance_labels_are_stable() {
        assert_eq!(instance_label("A", 0, 1), "A");
        assert_eq!(instance_label("A", 1, 2), "A-1");
    }
}
