//! Chain state, UTXO management and the consensus rule pipeline.

pub mod blockstore;
pub mod coinview;
pub mod deployments;
pub mod ibd;
pub mod index;
pub mod rules;
pub mod state;
pub mod undo;
pub mod utxo;
