mod block_height;
mod blocks_hashes;
mod blocks_rolling;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use squall_core::{ErrorList, monitoring::Monitor};

pub use block_height::BlockHeightChecker;
pub use blocks_hashes::BlockHashesChecker;
pub use blocks_rolling::BlocksRollingChecker;

use crate::network::Network;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// A consistency check run against the network at the end of a scenario.
#[async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<(), DynError>;
}

pub type CheckerFactory = fn(Arc<dyn Network>, Arc<Monitor>) -> Box<dyn Checker>;

/// Maps checker names to factories. Built as a value and threaded through to
/// the executor instead of living in global state, so embedders can extend
/// or replace the set at startup.
pub struct CheckerRegistry {
    factories: BTreeMap<&'static str, CheckerFactory>,
}

impl CheckerRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// The built-in consistency checks.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("block_height", |network, _| {
            Box::new(BlockHeightChecker::new(network))
        });
        registry.register("blocks_hashes", |network, _| {
            Box::new(BlockHashesChecker::new(network))
        });
        registry.register("blocks_rolling", |_, monitor| {
            Box::new(BlocksRollingChecker::new(monitor))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: CheckerFactory) {
        self.factories.insert(name, factory);
    }

    /// Instantiates every registered checker against the given network and
    /// monitor.
    #[must_use]
    pub fn init(&self, network: Arc<dyn Network>, monitor: Arc<Monitor>) -> Checks {
        Checks(
            self.factories
                .values()
                .map(|factory| factory(Arc::clone(&network), Arc::clone(&monitor)))
                .collect(),
        )
    }
}

/// The instantiated checker set.
pub struct Checks(Vec<Box<dyn Checker>>);

impl Checks {
    #[must_use]
    pub fn none() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Runs every checker; failures are joined so all checkers get their say.
    pub async fn check(&self) -> Result<(), ErrorList> {
        let mut failures = Vec::new();
        for checker in &self.0 {
            if let Err(err) = checker.check().await {
                failures.push(format!("{}: {err}", checker.name()));
            }
        }
        ErrorList::join(failures)
    }
}
