pub mod client;
pub mod snapshot;
pub mod sse;

pub use client::{GraphClient, GraphError};
