pub mod checking;
pub mod executor;
pub mod monitoring;
pub mod network;
pub mod rpc;
pub mod rules;
pub mod scenario;

#[cfg(test)]
pub(crate) mod testing;

pub use network::{
    Application, DynApplication, DynNode, Network, NetworkConfig, NetworkError, NetworkListener,
    Node, NodeConfig, ServiceKind,
};
pub use rpc::{HttpRpcClient, RpcClient, RpcError, SignedTransaction};
pub use scenario::{Rate, Scenario, ScenarioError};
