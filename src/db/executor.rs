//! Shared contract and helpers for the four query executors.

use async_trait::async_trait;

use crate::config::{Connection, Server};
use crate::error::GatewayError;

pub struct ExecuteRequest<'a> {
    pub query: &'a str,
    pub database: Option<&'a str>,
    pub server: Option<&'a str>,
    pub max_result_bytes_override: Option<u64>,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<String, GatewayError>;
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// The hostname to show for `server` in `list_connections`, or in a
/// `ServerNotFound` error's available-list: an SSH-tunneled loopback
/// endpoint is shown by the tunnel's public host rather than `localhost`.
pub fn display_host<'a>(conn: &'a Connection, server: &'a Server) -> &'a str {
    if is_loopback(&server.host) {
        if let Some(ssh) = &conn.ssh {
            return &ssh.host;
        }
    }
    &server.host
}

fn available_hosts(conn: &Connection) -> String {
    conn.servers
        .iter()
        .map(|s| display_host(conn, s).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Select one endpoint from `conn.servers` by hostname. `server` is a
/// hostname-only selector; a value containing `:` is rejected rather than
/// silently split into host/port. When omitted, the first configured server
/// is used. An SSH-tunneled `localhost` entry may also be matched by the
/// tunnel's public host (the same alias `list_connections` displays).
pub fn select_server<'a>(conn: &'a Connection, server: Option<&str>) -> Result<&'a Server, GatewayError> {
    let Some(spec) = server else {
        return conn.servers.first().ok_or_else(|| GatewayError::ServerNotFound {
            connection: conn.name.clone(),
            server: String::new(),
            available: available_hosts(conn),
        });
    };

    if spec.contains(':') {
        return Err(GatewayError::ServerNotFound {
            connection: conn.name.clone(),
            server: spec.to_string(),
            available: available_hosts(conn),
        });
    }

    if let Some(s) = conn.servers.iter().find(|s| s.host == spec) {
        return Ok(s);
    }

    if let Some(ssh) = &conn.ssh {
        if ssh.host == spec {
            if let Some(s) = conn.servers.iter().find(|s| is_loopback(&s.host)) {
                return Ok(s);
            }
        }
    }

    Err(GatewayError::ServerNotFound {
        connection: conn.name.clone(),
        server: spec.to_string(),
        available: available_hosts(conn),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Connection, Engine, Implementation, Server, SshConfig};

    fn conn_with(servers: Vec<Server>, ssh: Option<SshConfig>) -> Connection {
        Connection {
            name: "c1".to_string(),
            engine: Engine::Postgresql,
            implementation: Implementation::Native,
            servers,
            default_database: "app".to_string(),
            allowed_databases: vec!["app".to_string()],
            username: "reader".to_string(),
            password: String::new(),
            ssh,
            query_timeout_s: 120,
            connection_timeout_s: 10,
            max_result_bytes: 0,
            description: String::new(),
        }
    }

    #[test]
    fn omitted_server_picks_first() {
        let conn = conn_with(
            vec![
                Server { host: "a".to_string(), port: 5432 },
                Server { host: "b".to_string(), port: 5432 },
            ],
            None,
        );
        assert_eq!(select_server(&conn, None).unwrap().host, "a");
    }

    #[test]
    fn direct_hostname_match() {
        let conn = conn_with(
            vec![
                Server { host: "a".to_string(), port: 5432 },
                Server { host: "b".to_string(), port: 5432 },
            ],
            None,
        );
        assert_eq!(select_server(&conn, Some("b")).unwrap().host, "b");
    }

    #[test]
    fn rejects_spec_containing_port() {
        let conn = conn_with(vec![Server { host: "a".to_string(), port: 5432 }], None);
        let err = select_server(&conn, Some("a:5432")).unwrap_err();
        assert!(matches!(err, GatewayError::ServerNotFound { .. }));
    }

    #[test]
    fn ssh_alias_resolves_to_loopback_server() {
        let conn = conn_with(
            vec![Server { host: "127.0.0.1".to_string(), port: 5432 }],
            Some(SshConfig {
                host: "bastion".to_string(),
                port: 22,
                user: "ops".to_string(),
                private_key_path: Some("/id_ed25519".to_string()),
                password: None,
                ssh_timeout_s: 5,
            }),
        );
        assert_eq!(select_server(&conn, Some("bastion")).unwrap().host, "127.0.0.1");
    }

    #[test]
    fn unmatched_server_lists_display_hosts() {
        let conn = conn_with(
            vec![Server { host: "127.0.0.1".to_string(), port: 5432 }],
            Some(SshConfig {
                host: "bastion".to_string(),
                port: 22,
                user: "ops".to_string(),
                private_key_path: Some("/id_ed25519".to_string()),
                password: None,
                ssh_timeout_s: 5,
            }),
        );
        let err = select_server(&conn, Some("nope")).unwrap_err();
        match err {
            GatewayError::ServerNotFound { available, .. } => assert_eq!(available, "bastion"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
