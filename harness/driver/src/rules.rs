use std::{collections::BTreeMap, time::Duration};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use squall_core::ErrorList;

/// Flat rule update as found in scenario files and the environment.
pub type RuleMap = BTreeMap<String, String>;

/// Structured consensus-rule tree the flat key vocabulary translates into.
/// The JSON rendering mirrors the client's own rule document, which is what
/// rule-update transactions carry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChainRules {
    pub blocks: BlockRules,
    pub epochs: EpochRules,
    pub emitter: EmitterRules,
    pub upgrades: UpgradeRules,
    pub economy: EconomyRules,
    pub dag: DagRules,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockRules {
    pub max_block_gas: u64,
    /// Nanoseconds.
    pub max_empty_block_skip_period: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EpochRules {
    pub max_epoch_gas: u64,
    /// Nanoseconds.
    pub max_epoch_duration: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmitterRules {
    /// Nanoseconds.
    pub interval: u64,
    /// Nanoseconds.
    pub stall_threshold: u64,
    /// Nanoseconds.
    pub stalled_interval: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpgradeRules {
    pub berlin: bool,
    pub london: bool,
    pub llr: bool,
    pub sonic: bool,
    pub allegro: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EconomyRules {
    pub min_gas_price: U256,
    pub min_base_fee: U256,
    pub block_missed_slack: u64,
    pub gas: GasRules,
    pub short_gas_power: GasPowerRules,
    pub long_gas_power: GasPowerRules,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GasRules {
    pub max_event_gas: u64,
    pub event_gas: u64,
    pub parent_gas: u64,
    pub extra_data_gas: u64,
    pub block_votes_base_gas: u64,
    pub block_vote_gas: u64,
    pub epoch_vote_gas: u64,
    pub misbehaviour_proof_gas: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GasPowerRules {
    pub alloc_per_sec: u64,
    /// Nanoseconds.
    pub max_alloc_period: u64,
    /// Nanoseconds.
    pub startup_alloc_period: u64,
    pub min_startup_gas: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DagRules {
    pub max_parents: u64,
    pub max_free_parents: u64,
    pub max_extra_data: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("cannot parse {key}={value}: {reason}")]
    BadValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("rule configuration failed:\n{0}")]
    Joined(ErrorList),
}

type Setter = fn(&str, &mut ChainRules) -> Result<(), String>;

/// The fixed vocabulary of flat rule keys, each paired with a typed
/// parser+setter into the structured tree. Built as a value and threaded to
/// its consumers rather than living in global state.
pub struct RuleVocabulary {
    setters: BTreeMap<&'static str, Setter>,
}

impl RuleVocabulary {
    #[must_use]
    pub fn standard() -> Self {
        let mut setters: BTreeMap<&'static str, Setter> = BTreeMap::new();

        // Blocks
        setters.insert("MAX_BLOCK_GAS", |v, r| {
            r.blocks.max_block_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("MAX_EMPTY_BLOCK_SKIP_PERIOD", |v, r| {
            r.blocks.max_empty_block_skip_period = parse_nanos(v)?;
            Ok(())
        });

        // Epochs
        setters.insert("MAX_EPOCH_GAS", |v, r| {
            r.epochs.max_epoch_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("MAX_EPOCH_DURATION", |v, r| {
            r.epochs.max_epoch_duration = parse_nanos(v)?;
            Ok(())
        });

        // Emitter
        setters.insert("EMITTER_INTERVAL", |v, r| {
            r.emitter.interval = parse_nanos(v)?;
            Ok(())
        });
        setters.insert("EMITTER_STALL_THRESHOLD", |v, r| {
            r.emitter.stall_threshold = parse_nanos(v)?;
            Ok(())
        });
        setters.insert("EMITTER_STALLED_INTERVAL", |v, r| {
            r.emitter.stalled_interval = parse_nanos(v)?;
            Ok(())
        });

        // Upgrades
        setters.insert("UPGRADES_BERLIN", |v, r| {
            r.upgrades.berlin = parse_bool(v);
            Ok(())
        });
        setters.insert("UPGRADES_LONDON", |v, r| {
            r.upgrades.london = parse_bool(v);
            Ok(())
        });
        setters.insert("UPGRADES_LLR", |v, r| {
            r.upgrades.llr = parse_bool(v);
            Ok(())
        });
        setters.insert("UPGRADES_SONIC", |v, r| {
            r.upgrades.sonic = parse_bool(v);
            Ok(())
        });
        setters.insert("UPGRADES_ALLEGRO", |v, r| {
            r.upgrades.allegro = parse_bool(v);
            Ok(())
        });

        // Economy
        setters.insert("MIN_GAS_PRICE", |v, r| {
            r.economy.min_gas_price = parse_u256(v)?;
            Ok(())
        });
        setters.insert("MIN_BASE_FEE", |v, r| {
            r.economy.min_base_fee = parse_u256(v)?;
            Ok(())
        });
        setters.insert("BLOCK_MISSED_SLACK", |v, r| {
            r.economy.block_missed_slack = parse_u64(v)?;
            Ok(())
        });
        setters.insert("MAX_EVENT_GAS", |v, r| {
            r.economy.gas.max_event_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("EVENT_GAS", |v, r| {
            r.economy.gas.event_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("PARENT_GAS", |v, r| {
            r.economy.gas.parent_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("EXTRA_DATA_GAS", |v, r| {
            r.economy.gas.extra_data_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("BLOCK_VOTES_BASE_GAS", |v, r| {
            r.economy.gas.block_votes_base_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("BLOCK_VOTE_GAS", |v, r| {
            r.economy.gas.block_vote_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("EPOCH_VOTE_GAS", |v, r| {
            r.economy.gas.epoch_vote_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("MISBEHAVIOUR_PROOF_GAS", |v, r| {
            r.economy.gas.misbehaviour_proof_gas = parse_u64(v)?;
            Ok(())
        });

        setters.insert("SHORT_ALLOC_PER_SEC", |v, r| {
            r.economy.short_gas_power.alloc_per_sec = parse_u64(v)?;
            Ok(())
        });
        setters.insert("SHORT_MAX_ALLOC_PERIOD", |v, r| {
            r.economy.short_gas_power.max_alloc_period = parse_nanos(v)?;
            Ok(())
        });
        setters.insert("SHORT_STARTUP_ALLOC_PERIOD", |v, r| {
            r.economy.short_gas_power.startup_alloc_period = parse_nanos(v)?;
            Ok(())
        });
        setters.insert("SHORT_MIN_STARTUP_GAS", |v, r| {
            r.economy.short_gas_power.min_startup_gas = parse_u64(v)?;
            Ok(())
        });
        setters.insert("LONG_ALLOC_PER_SEC", |v, r| {
            r.economy.long_gas_power.alloc_per_sec = parse_u64(v)?;
            Ok(())
        });
        setters.insert("LONG_MAX_ALLOC_PERIOD", |v, r| {
            r.economy.long_gas_power.max_alloc_period = parse_nanos(v)?;
            Ok(())
        });
        setters.insert("LONG_STARTUP_ALLOC_PERIOD", |v, r| {
            r.economy.long_gas_power.startup_alloc_period = parse_nanos(v)?;
            Ok(())
        });
        setters.insert("LONG_MIN_STARTUP_GAS", |v, r| {
            r.economy.long_gas_power.min_startup_gas = parse_u64(v)?;
            Ok(())
        });

        // DAG
        setters.insert("MAX_PARENTS", |v, r| {
            r.dag.max_parents = parse_u64(v)?;
            Ok(())
        });
        setters.insert("MAX_FREE_PARENTS", |v, r| {
            r.dag.max_free_parents = parse_u64(v)?;
            Ok(())
        });
        setters.insert("MAX_EXTRA_DATA", |v, r| {
            r.dag.max_extra_data = parse_u64(v)?.try_into().map_err(|_| {
                "value exceeds 32 bits".to_owned()
            })?;
            Ok(())
        });

        Self { setters }
    }

    #[must_use]
    pub fn is_supported(&self, key: &str) -> bool {
        self.setters.contains_key(key)
    }

    /// All keys in the vocabulary, ordered.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.setters.keys().copied()
    }

    /// Applies every recognized key from the update map; unrecognized keys
    /// are ignored, per-key parse failures are collected and joined.
    pub fn configure_from_map(
        &self,
        rules: &mut ChainRules,
        updates: &RuleMap,
    ) -> Result<(), RuleError> {
        let mut failures = Vec::new();
        for (key, setter) in &self.setters {
            let Some(value) = updates.get(*key) else {
                continue;
            };
            if let Err(reason) = setter(value, rules) {
                failures.push(
                    RuleError::BadValue {
                        key,
                        value: value.clone(),
                        reason,
                    }
                    .to_string(),
                );
            }
        }
        ErrorList::join(failures).map_err(RuleError::Joined)
    }

    /// Applies every rule key set as a non-empty environment variable.
    pub fn configure_from_env(&self, rules: &mut ChainRules) -> Result<(), RuleError> {
        let updates: RuleMap = self
            .setters
            .keys()
            .filter_map(|key| {
                std::env::var(key)
                    .ok()
                    .filter(|value| !value.is_empty())
                    .map(|value| ((*key).to_owned(), value))
            })
            .collect();
        self.configure_from_map(rules, &updates)
    }
}

/// Minimal nested JSON object carrying only the leaves that differ between
/// the two rule trees.
#[must_use]
pub fn diff_rules(original: &ChainRules, updated: &ChainRules) -> Value {
    let a = serde_json::to_value(original).expect("rules serialize cleanly");
    let b = serde_json::to_value(updated).expect("rules serialize cleanly");
    diff_objects(&a, &b)
}

fn diff_objects(a: &Value, b: &Value) -> Value {
    let (Value::Object(a), Value::Object(b)) = (a, b) else {
        return Value::Object(serde_json::Map::new());
    };

    let mut out = serde_json::Map::new();
    for (key, value_a) in a {
        let Some(value_b) = b.get(key) else {
            continue;
        };
        if value_a.is_object() && value_b.is_object() {
            let nested = diff_objects(value_a, value_b);
            if nested.as_object().is_some_and(|m| !m.is_empty()) {
                out.insert(key.clone(), nested);
            }
        } else if value_a != value_b {
            out.insert(key.clone(), value_b.clone());
        }
    }
    Value::Object(out)
}

fn parse_u64(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|err| format!("not a base-10 unsigned integer: {err}"))
}

fn parse_nanos(value: &str) -> Result<u64, String> {
    let duration: Duration = humantime::parse_duration(value)
        .map_err(|err| format!("not a duration: {err}"))?;
    u64::try_from(duration.as_nanos()).map_err(|_| "duration overflows".to_owned())
}

fn parse_u256(value: &str) -> Result<U256, String> {
    value
        .parse::<U256>()
        .map_err(|err| format!("not a base-10 big integer: {err}"))
}

fn parse_bool(value: &str) -> bool {
    value == "true"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> RuleMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn applies_recognized_keys_and_ignores_the_rest() {
        let vocabulary = RuleVocabulary::standard();
        let mut rules = ChainRules::default();
        vocabulary
            .configure_from_map(
                &mut rules,
                &map(&[
                    ("MAX_BLOCK_GAS", "20500000000"),
                    ("EMITTER_INTERVAL", "600ms"),
                    ("UPGRADES_SONIC", "true"),
                    ("UPGRADES_LLR", "no"),
                    ("MIN_BASE_FEE", "123456789012345678901234567890"),
                    ("SOMETHING_ELSE", "ignored"),
                ]),
            )
            .unwrap();

        assert_eq!(rules.blocks.max_block_gas, 20_500_000_000);
        assert_eq!(rules.emitter.interval, 600_000_000);
        assert!(rules.upgrades.sonic);
        assert!(!rules.upgrades.llr);
        assert_eq!(
            rules.economy.min_base_fee,
            "123456789012345678901234567890".parse::<U256>().unwrap()
        );
    }

    #[test]
    fn parse_failures_are_collected_not_short_circuited() {
        let vocabulary = RuleVocabulary::standard();
        let mut rules = ChainRules::default();
        let err = vocabulary
            .configure_from_map(
                &mut rules,
                &map(&[
                    ("MAX_BLOCK_GAS", "not-a-number"),
                    ("MAX_EPOCH_GAS", "10"),
                    ("MAX_EPOCH_DURATION", "bogus"),
                ]),
            )
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("MAX_BLOCK_GAS"));
        assert!(message.contains("MAX_EPOCH_DURATION"));
        // The valid key in the same batch still landed.
        assert_eq!(rules.epochs.max_epoch_gas, 10);
    }

    #[test]
    fn every_key_round_trips() {
        let vocabulary = RuleVocabulary::standard();
        let samples: RuleMap = vocabulary
            .keys()
            .map(|key| {
                let value = if key.starts_with("UPGRADES_") {
                    "true"
                } else if key.ends_with("_PERIOD")
                    || key.ends_with("_DURATION")
                    || key.ends_with("_INTERVAL")
                    || key.ends_with("_THRESHOLD")
                {
                    "1s"
                } else {
                    "42"
                };
                (key.to_owned(), value.to_owned())
            })
            .collect();

        let mut first = ChainRules::default();
        vocabulary.configure_from_map(&mut first, &samples).unwrap();

        // Rendering the configured tree and re-parsing the same flat values
        // must reproduce it exactly.
        let mut second = ChainRules::default();
        vocabulary.configure_from_map(&mut second, &samples).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn diff_contains_only_changed_leaves() {
        let vocabulary = RuleVocabulary::standard();
        let original = ChainRules::default();
        let mut updated = original.clone();
        vocabulary
            .configure_from_map(
                &mut updated,
                &map(&[("MAX_BLOCK_GAS", "7"), ("UPGRADES_BERLIN", "true")]),
            )
            .unwrap();

        let diff = diff_rules(&original, &updated);
        assert_eq!(diff["Blocks"]["MaxBlockGas"], 7);
        assert_eq!(diff["Upgrades"]["Berlin"], true);
        assert!(diff.get("Epochs").is_none());
        assert!(diff["Blocks"].get("MaxEmptyBlockSkipPeriod").is_none());

        let empty = diff_rules(&original, &original);
        assert!(empty.as_object().unwrap().is_empty());
    }

    #[test]
    fn env_configuration_applies_set_keys() {
        let vocabulary = RuleVocabulary::standard();
        // Safety: test-local variable, no concurrent reader depends on it.
        unsafe { std::env::set_var("MAX_PARENTS", "12") };
        let mut rules = ChainRules::default();
        vocabulary.configure_from_env(&mut rules).unwrap();
        assert_eq!(rules.dag.max_parents, 12);
        unsafe { std::env::remove_var("MAX_PARENTS") };
    }
}
