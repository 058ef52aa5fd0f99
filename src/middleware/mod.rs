// Middleware modules for the relay gateway

pub mod admission;
pub mod connection;

pub use admission::{admission_middleware, REQUEST_ID_HEADER};
pub use connection::{socket_identity_intact, ClientConn, ConnLiveness, QueueIdentity};
