//! ClickHouse executor that shells out to `clickhouse-client`.
//!
//! No pre-flight guard runs here: the client's own `--readonly 1` enforces
//! read-only mode at the server, the same way the native ClickHouse
//! executor relies on the `readonly` HTTP setting.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::config::{Connection, Implementation};
use crate::db::executor::{select_server, ExecuteRequest, QueryExecutor};
use crate::db::{clickhouse_effective_port, ClickHouseProtocol};
use crate::error::GatewayError;
use crate::process_util::{kill_process_group, which};
use crate::sql::tsv::TsvAccumulator;
use crate::ssh::inprocess::InProcessTunnel;
use crate::ssh::SshTunnel;

const CLICKHOUSE_CLIENT_BINARY: &str = "clickhouse-client";

pub struct ClickHouseCliExecutor {
    connection: Arc<Connection>,
}

impl ClickHouseCliExecutor {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl QueryExecutor for ClickHouseCliExecutor {
    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<String, GatewayError> {
        let conn = &self.connection;
        let server = select_server(conn, req.server)?;
        let database = conn.resolve_database(req.database)?;
        let (protocol, remote_port) = clickhouse_effective_port(Implementation::Cli, server.port);

        let mut tunnel: Option<InProcessTunnel> = None;
        let (host, port) = match &conn.ssh {
            Some(ssh) => {
                let mut t = InProcessTunnel::new(ssh.clone(), server.host.clone(), remote_port);
                let local_port = t.start().await?;
                tunnel = Some(t);
                ("127.0.0.1".to_string(), local_port)
            }
            None => (server.host.clone(), remote_port),
        };

        let result = run_query(
            conn,
            &database,
            &host,
            port,
            protocol,
            req.query,
            req.max_result_bytes_override,
        )
        .await;

        if let Some(mut t) = tunnel {
            t.stop().await;
        }

        result
    }
}

async fn run_query(
    conn: &Connection,
    database: &str,
    host: &str,
    port: u16,
    protocol: ClickHouseProtocol,
    query: &str,
    max_bytes_override: Option<u64>,
) -> Result<String, GatewayError> {
    if which(CLICKHOUSE_CLIENT_BINARY).is_none() {
        return Err(GatewayError::ToolMissing(
            CLICKHOUSE_CLIENT_BINARY.to_string(),
        ));
    }

    let max_bytes = max_bytes_override.unwrap_or(conn.max_result_bytes);

    let mut command = Command::new(CLICKHOUSE_CLIENT_BINARY);
    command
        .arg("--host")
        .arg(host)
        .arg("--port")
        .arg(port.to_string())
        .arg("--user")
        .arg(&conn.username)
        .arg("--database")
        .arg(database)
        .arg("--readonly")
        .arg("1")
        .arg("--max_execution_time")
        .arg(conn.query_timeout_s.to_string())
        .arg("--connect_timeout")
        .arg(conn.connection_timeout_s.to_string())
        .arg("--format")
        .arg("TabSeparatedWithNames")
        .arg("--query")
        .arg(query);

    if matches!(protocol, ClickHouseProtocol::NativeSecure) {
        command.arg("--secure");
    }
    if !conn.password.is_empty() {
        command.arg("--password").arg(&conn.password);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| {
        GatewayError::ExecutionError(format!("clickhouse-client: failed to start: {e}"))
    })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut acc = TsvAccumulator::new(max_bytes);
    let per_line_budget = Duration::from_secs(conn.query_timeout_s);
    let mut timed_out = false;

    loop {
        match tokio::time::timeout(per_line_budget, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if !acc.try_push(line) {
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(GatewayError::ExecutionError(format!(
                    "clickhouse-client: failed to read output: {e}"
                )));
            }
            Err(_elapsed) => {
                timed_out = true;
                if let Some(pid) = child.id() {
                    kill_process_group(pid as i32, true);
                }
                let _ = child.kill().await;
                break;
            }
        }
    }

    if acc.truncated() && !timed_out {
        // The read loop stopped consuming stdout early; clickhouse-client
        // would otherwise block writing the remaining rows into a full pipe
        // and wait() would never return.
        let _ = child.kill().await;
    }

    let status = child.wait().await;

    if timed_out {
        return Err(GatewayError::QueryTimeout {
            backend: "ClickHouse".to_string(),
            timeout_s: conn.query_timeout_s,
        });
    }

    match status {
        Ok(status) if status.success() || acc.truncated() => Ok(acc.finish()),
        _ => {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            Err(GatewayError::ExecutionError(format!(
                "clickhouse-client: {}",
                stderr.trim()
            )))
        }
    }
}
