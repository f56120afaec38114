use std::sync::Arc;

use async_trait::async_trait;
use squall_core::{Series as _, monitoring::Monitor};
use tracing::info;

use crate::monitoring::node::NODE_BLOCK_STATUS;

use super::{Checker, DynError};

/// Samples per sliding window; the height at a window's end must exceed the
/// height at its start for a node to count as functional.
pub const DEFAULT_TOLERANCE_SAMPLES: usize = 10;

/// Verifies the network kept producing blocks: at least one node must show a
/// strictly growing block height across every full window of samples.
pub struct BlocksRollingChecker {
    monitor: Arc<Monitor>,
    tolerance_samples: usize,
}

impl BlocksRollingChecker {
    #[must_use]
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self {
            monitor,
            tolerance_samples: DEFAULT_TOLERANCE_SAMPLES,
        }
    }

    #[must_use]
    pub fn with_tolerance_samples(mut self, tolerance_samples: usize) -> Self {
        self.tolerance_samples = tolerance_samples.max(2);
        self
    }
}

#[async_trait]
impl Checker for BlocksRollingChecker {
    fn name(&self) -> &'static str {
        "blocks_rolling"
    }

    async fn check(&self) -> Result<(), DynError> {
        let nodes = self.monitor.subjects(&NODE_BLOCK_STATUS);
        info!(nodes = nodes.len(), "checking rolling block production");

        let mut network_functional = false;
        for node in nodes {
            let Some(series) = self.monitor.get_data(&node, &NODE_BLOCK_STATUS) else {
                continue;
            };
            let points = series.get_all();
            if points.is_empty() {
                // A node that produced no blocks at all is not functional.
                continue;
            }

            let mut node_functional = true;
            let mut window = vec![0u64; self.tolerance_samples];
            for (i, point) in points.iter().enumerate() {
                window[i % self.tolerance_samples] = point.value.height;
                if i < self.tolerance_samples - 1 {
                    continue;
                }
                let start = (i + 1) % self.tolerance_samples;
                if window[start] >= point.value.height {
                    node_functional = false;
                    break;
                }
            }
            network_functional = network_functional || node_functional;
        }

        if network_functional {
            Ok(())
        } else {
            Err("network is down, nodes stopped producing blocks".into())
        }
    }
}
