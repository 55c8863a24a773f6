//! Client side of the external classification service.

mod connection;
mod error;
mod pool;
pub mod protocol;

pub use connection::ClassifierConnection;
pub use error::ClassifierError;
pub use pool::{ClassifierPool, PooledConnection};
