//! Connection reuse and HTTP/3 discovery.

pub mod alt_svc;
pub mod connection_pool;

pub use alt_svc::{AltService, AltSvc, AltSvcCache};
pub use connection_pool::{ConnectionPool, PoolKey, PoolStats, PooledConnection};
