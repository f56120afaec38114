use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use tracing::info;

use crate::{
    network::{DynNode, Network, Node as _},
    rpc::RpcClient as _,
};

use super::{Checker, DynError};

/// Verifies that all nodes agree on the chain height, allowing declared
/// failures to lag as long as the set of laggers matches the declaration.
pub struct BlockHeightChecker {
    network: Arc<dyn Network>,
}

impl BlockHeightChecker {
    #[must_use]
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self { network }
    }

    async fn block_height(node: &DynNode) -> Result<u64, DynError> {
        let client = node
            .dial_rpc()
            .await
            .map_err(|err| format!("failed to dial node RPC: {err}"))?;
        client
            .block_number()
            .await
            .map_err(|err| format!("failed to get block number from RPC: {err}").into())
    }
}

#[async_trait]
impl Checker for BlockHeightChecker {
    fn name(&self) -> &'static str {
        "block_height"
    }

    async fn check(&self) -> Result<(), DynError> {
        let nodes = self.network.active_nodes();
        info!(nodes = nodes.len(), "checking block heights");

        let mut expected_failures = BTreeSet::new();
        let mut heights = Vec::with_capacity(nodes.len());
        let mut max_height = 0u64;

        for node in &nodes {
            if node.is_expected_failure() {
                expected_failures.insert(node.label().to_owned());
            }

            let height = Self::block_height(node)
                .await
                .map_err(|err| format!("failed to get block height of node {}: {err}", node.label()))?;
            if height == 1 {
                return Err(format!(
                    "node {} reports it is at block 1 (only genesis is applied)",
                    node.label()
                )
                .into());
            }
            if height < 1 {
                return Err(format!(
                    "node {} reports it is at invalid block {height}",
                    node.label()
                )
                .into());
            }
            max_height = max_height.max(height);
            heights.push(height);
        }

        let mut got_failures = BTreeSet::new();
        for (node, height) in nodes.iter().zip(&heights) {
            if *height < max_height.saturating_sub(1) {
                if node.is_expected_failure() {
                    got_failures.insert(node.label().to_owned());
                } else {
                    return Err(format!(
                        "node {} reports too old block {height} (max block is {max_height})",
                        node.label()
                    )
                    .into());
                }
            }
        }

        if got_failures != expected_failures {
            return Err(format!(
                "unexpected failure set to provide the block height, got {got_failures:?}, want {expected_failures:?}"
            )
            .into());
        }

        Ok(())
    }
}
