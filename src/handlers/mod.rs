// Handlers for the relay gateway

pub mod relay;

pub use relay::{relay_count_tokens, relay_messages};
