//! Consensus constants, parameters, checkpoints, and the deployment schedule.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub use deployments::{
    Deployment, DeploymentIndex, ThresholdState, ALL_DEPLOYMENTS, MAX_DEPLOYMENTS,
};
pub use params::{
    consensus_params, hash256_from_hex, hash256_to_hex, Checkpoint, ConsensusOptions,
    ConsensusParams, Network,
};
pub use rewards::block_subsidy;

pub type Hash256 = [u8; 32];
