//! Wire headers of the identity exchange.

pub mod baggage;
pub mod exchange;
mod parser;

pub use baggage::BAGGAGE;
pub use exchange::{EXCHANGE_METADATA, EXCHANGE_METADATA_ID};
