//! ClickHouse executor using the HTTP(S) interface via `reqwest`.
//!
//! Rows are requested in `JSONCompactEachRowWithNamesAndTypes` format so the
//! column names, types, and per-row values are each easy to parse without a
//! dedicated ClickHouse client crate; values are then funneled through the
//! same [`TsvAccumulator`] every other executor uses.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::config::{Connection, Implementation};
use crate::db::executor::{select_server, ExecuteRequest, QueryExecutor};
use crate::db::{clickhouse_effective_port, ClickHouseProtocol};
use crate::error::GatewayError;
use crate::sql::tsv::{format_tsv_line, TsvAccumulator};
use crate::ssh::inprocess::InProcessTunnel;
use crate::ssh::spawned::SpawnedSshTunnel;
use crate::ssh::SshTunnel;

pub struct ClickHouseNativeExecutor {
    connection: Arc<Connection>,
}

impl ClickHouseNativeExecutor {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl QueryExecutor for ClickHouseNativeExecutor {
    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<String, GatewayError> {
        let conn = &self.connection;
        let server = select_server(conn, req.server)?;
        let database = conn.resolve_database(req.database)?;
        let (protocol, remote_port) = clickhouse_effective_port(Implementation::Native, server.port);

        let mut inprocess_tunnel: Option<InProcessTunnel> = None;
        let mut spawned_tunnel: Option<SpawnedSshTunnel> = None;
        let (host, port) = match &conn.ssh {
            Some(ssh) => {
                let mut t = InProcessTunnel::new(ssh.clone(), server.host.clone(), remote_port);
                match t.start().await {
                    Ok(local_port) => {
                        inprocess_tunnel = Some(t);
                        ("127.0.0.1".to_string(), local_port)
                    }
                    Err(GatewayError::SshAuth(_)) => {
                        let mut fallback = SpawnedSshTunnel::new(ssh.clone(), server.host.clone(), remote_port);
                        let local_port = fallback.start().await?;
                        spawned_tunnel = Some(fallback);
                        ("127.0.0.1".to_string(), local_port)
                    }
                    Err(e) => return Err(e),
                }
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

        if let Some(mut t) = inprocess_tunnel {
            t.stop().await;
        }
        if let Some(mut t) = spawned_tunnel {
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
    let max_bytes = max_bytes_override.unwrap_or(conn.max_result_bytes);
    let scheme = match protocol {
        ClickHouseProtocol::Http | ClickHouseProtocol::Native => "http",
        ClickHouseProtocol::Https | ClickHouseProtocol::NativeSecure => "https",
    };
    let url = format!("{scheme}://{host}:{port}/");

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(conn.connection_timeout_s))
        .build()
        .map_err(|e| GatewayError::ExecutionError(format!("ClickHouse: {e}")))?;

    let mut request = client
        .post(&url)
        .query(&[
            ("database", database),
            ("readonly", "1"),
            ("max_execution_time", &conn.query_timeout_s.to_string()),
            ("default_format", "JSONCompactEachRowWithNamesAndTypes"),
        ])
        .body(query.to_string());

    if !conn.username.is_empty() {
        request = request.basic_auth(&conn.username, Some(&conn.password));
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify_reqwest_error(conn, e))?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::ExecutionError(format!(
            "ClickHouse: {}",
            body.trim()
        )));
    }

    let byte_stream = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let mut lines = BufReader::new(StreamReader::new(byte_stream)).lines();

    let mut acc = TsvAccumulator::new(max_bytes);
    let mut state = HeaderState::AwaitingNames;
    let per_line_budget = Duration::from_secs(conn.query_timeout_s);

    loop {
        let line = match tokio::time::timeout(per_line_budget, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                return Err(GatewayError::ExecutionError(format!(
                    "ClickHouse: failed to read response: {e}"
                )))
            }
            Err(_elapsed) => {
                return Err(GatewayError::QueryTimeout {
                    backend: "ClickHouse".to_string(),
                    timeout_s: conn.query_timeout_s,
                })
            }
        };

        match state {
            HeaderState::AwaitingNames => {
                let names: Vec<String> = serde_json::from_str(&line).map_err(|e| {
                    GatewayError::ExecutionError(format!("ClickHouse: malformed column header: {e}"))
                })?;
                if !names.is_empty() {
                    acc.push_forced(format_tsv_line(&names));
                }
                state = HeaderState::AwaitingTypes;
            }
            HeaderState::AwaitingTypes => {
                // Positional, untagged types line; nothing to record.
                state = HeaderState::Rows;
            }
            HeaderState::Rows => {
                let values: Vec<serde_json::Value> = serde_json::from_str(&line).map_err(|e| {
                    GatewayError::ExecutionError(format!("ClickHouse: malformed row: {e}"))
                })?;
                let rendered: Vec<String> = values.iter().map(json_value_to_string).collect();
                if !acc.try_push(format_tsv_line(&rendered)) {
                    break;
                }
            }
        }
    }

    Ok(acc.finish())
}

enum HeaderState {
    AwaitingNames,
    AwaitingTypes,
    Rows,
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn classify_reqwest_error(conn: &Connection, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() || e.is_connect() {
        GatewayError::ConnectionTimeout {
            backend: "ClickHouse".to_string(),
            timeout_s: conn.connection_timeout_s,
        }
    } else {
        GatewayError::ExecutionError(format!("ClickHouse: {e}"))
    }
}
