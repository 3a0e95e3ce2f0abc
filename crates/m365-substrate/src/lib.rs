pub mod driver;
pub mod frames;
pub mod jwt;

pub use driver::{ActiveTurn, SubstrateClient, SubstrateError, TurnOutcome, TurnRequest};
