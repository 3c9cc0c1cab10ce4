mod backend;
mod command;
mod config;
mod consensus;
mod constants;
mod errors;
mod fsm;
mod membership;
mod snapshot;
mod store;
pub mod utils;

pub use backend::*;
pub use command::*;
pub use config::*;
pub use consensus::*;
pub use errors::*;
pub use fsm::*;
pub use membership::*;
pub use snapshot::*;
pub use store::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
