pub mod external;
pub mod local;
pub mod provision;
pub mod shared;

pub use external::ExternalNetwork;
pub use local::{DEFAULT_TREASURY_KEY, LocalNetwork};
pub use provision::{NodeProvisioner, ProcessProvisioner, ProvisionedNode};
