//! Broker protocol
//!
//! Registration, the task offer stream, claim/release and status reporting
//! between this worker and the CodeTether broker.

pub mod client;
pub mod registry;
pub mod stream;
pub mod types;
pub mod worker;

pub use types::*;
