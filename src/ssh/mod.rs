pub mod inprocess;
pub mod spawned;

use async_trait::async_trait;

use crate::error::GatewayError;

/// Shared contract for both tunnel implementations. `start` must complete
/// within the configured SSH timeout or raise [`GatewayError::SshTimeout`];
/// `stop` is idempotent and safe to call even if `start` never succeeded.
#[async_trait]
pub trait SshTunnel: Send {
    async fn start(&mut self) -> Result<u16, GatewayError>;
    async fn stop(&mut self);
}

/// Bind an ephemeral TCP port on localhost and hand back just the port
/// number, mirroring the bind-then-close trick the original used to pick a
/// free port before the real listener takes it.
pub fn find_free_local_port() -> Result<u16, GatewayError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| GatewayError::SshError(format!("could not bind ephemeral port: {e}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| GatewayError::SshError(e.to_string()))
}
