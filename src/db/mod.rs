pub mod clickhouse_cli;
pub mod clickhouse_native;
pub mod executor;
pub mod postgres_cli;
pub mod postgres_native;

pub use executor::{ExecuteRequest, QueryExecutor};

use crate::config::Implementation;

/// Wire protocol a ClickHouse executor actually speaks once the configured
/// port has been mapped to the protocol it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickHouseProtocol {
    Http,
    Https,
    Native,
    NativeSecure,
}

/// Single source of truth for ClickHouse port remapping: both the native and
/// CLI executors, and the `list_connections` display path, call this so the
/// displayed port always matches the port actually dialed.
pub fn clickhouse_effective_port(implementation: Implementation, configured_port: u16) -> (ClickHouseProtocol, u16) {
    match implementation {
        Implementation::Native => match configured_port {
            9000 => (ClickHouseProtocol::Http, 8123),
            9440 => (ClickHouseProtocol::Https, 8443),
            8443 => (ClickHouseProtocol::Https, 8443),
            other => (ClickHouseProtocol::Http, other),
        },
        Implementation::Cli => match configured_port {
            8123 => (ClickHouseProtocol::Native, 9000),
            8443 => (ClickHouseProtocol::NativeSecure, 9440),
            9440 => (ClickHouseProtocol::NativeSecure, 9440),
            other => (ClickHouseProtocol::Native, other),
        },
    }
}
