pub mod connection;
pub mod raw;
pub mod registry;

pub use connection::{Connection, Engine, Implementation, Server, SshConfig};
pub use registry::ConnectionRegistry;
