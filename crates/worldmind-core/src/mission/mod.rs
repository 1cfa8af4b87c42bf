//! Mission state: the data model, the state container, and the channel
//! reducers that merge node patches into it.

pub mod model;
pub mod patch;
pub mod state;

pub use model::*;
pub use patch::{MissionPatch, ReducerError, apply_patch};
pub use state::MissionState;
