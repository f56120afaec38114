use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use tracing::info;

use crate::{
    network::{Network, Node as _},
    rpc::{BlockSummary, RpcClient},
};

use super::{Checker, DynError};

/// Walks the chain block by block and verifies that every node reports the
/// same state root, receipts root and hash, with declared failures allowed
/// to diverge or fall out of data.
pub struct BlockHashesChecker {
    network: Arc<dyn Network>,
}

impl BlockHashesChecker {
    #[must_use]
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self { network }
    }
}

fn compare(
    reference: &BlockSummary,
    block: &BlockSummary,
    block_number: u64,
) -> Result<(), DynError> {
    // Field order is part of the diagnostic contract: the first differing
    // field is the one reported.
    if reference.state_root != block.state_root {
        return Err(format!("stateRoot of the block {block_number} does not match").into());
    }
    if reference.receipts_root != block.receipts_root {
        return Err(format!("receiptsRoot of the block {block_number} does not match").into());
    }
    if reference.hash != block.hash {
        return Err(format!("hash of the block {block_number} does not match").into());
    }
    Ok(())
}

#[async_trait]
impl Checker for BlockHashesChecker {
    fn name(&self) -> &'static str {
        "blocks_hashes"
    }

    async fn check(&self) -> Result<(), DynError> {
        let nodes = self.network.active_nodes();
        info!(nodes = nodes.len(), "checking block hashes");

        let mut expected_failures = BTreeSet::new();
        let mut clients: Vec<Arc<dyn RpcClient>> = Vec::with_capacity(nodes.len());
        for node in &nodes {
            if node.is_expected_failure() {
                expected_failures.insert(node.label().to_owned());
            }
            let client = node
                .dial_rpc()
                .await
                .map_err(|err| format!("failed to dial RPC for node {}: {err}", node.label()))?;
            clients.push(client);
        }

        // With every node expected to fail there is no pivot to compare
        // against; the walk ends before it starts.
        if expected_failures.len() == nodes.len() {
            return Ok(());
        }

        let mut got_failures = BTreeSet::new();
        let mut block_number = 0u64;
        loop {
            let mut summaries = Vec::with_capacity(nodes.len());
            let mut nodes_lacking_block = 0usize;
            for (node, client) in nodes.iter().zip(&clients) {
                let summary = client.block_summary(block_number).await.map_err(|err| {
                    format!(
                        "failed to get block {block_number} detail at node {}: {err}",
                        node.label()
                    )
                })?;
                if summary.is_none() {
                    if block_number <= 2 {
                        return Err(format!(
                            "unable to check block hashes - block {block_number} does not exist at node {}",
                            node.label()
                        )
                        .into());
                    }
                    nodes_lacking_block += 1;
                }
                summaries.push(summary);
            }

            // No node has this block, so the end of the chain is reached.
            if nodes_lacking_block == nodes.len() {
                if got_failures != expected_failures {
                    return Err(format!(
                        "unexpected failure set to provide the block hashes: got {got_failures:?}, want {expected_failures:?}"
                    )
                    .into());
                }
                return Ok(());
            }

            // Pivot on the first healthy node that reached this height.
            let reference = nodes
                .iter()
                .zip(&summaries)
                .find_map(|(node, summary)| {
                    summary.filter(|_| !node.is_expected_failure())
                })
                .ok_or_else(|| {
                    format!("no reference data available for block {block_number}")
                })?;

            for (node, summary) in nodes.iter().zip(&summaries) {
                let Some(summary) = summary else {
                    if node.is_expected_failure() {
                        got_failures.insert(node.label().to_owned());
                    }
                    continue;
                };
                if let Err(err) = compare(&reference, summary, block_number) {
                    if node.is_expected_failure() {
                        got_failures.insert(node.label().to_owned());
                    } else {
                        return Err(err);
                    }
                }
            }

            block_number += 1;
        }
    }
}
