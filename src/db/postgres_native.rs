//! PostgreSQL executor using `sqlx`'s native async driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, ConnectOptions, Connection as SqlxConnection, Executor, Row, TypeInfo};

use crate::config::Connection;
use crate::db::executor::{select_server, ExecuteRequest, QueryExecutor};
use crate::error::GatewayError;
use crate::sql::tsv::{format_tsv_line, TsvAccumulator};
use crate::ssh::inprocess::InProcessTunnel;
use crate::ssh::SshTunnel;

pub struct PostgresNativeExecutor {
    connection: Arc<Connection>,
}

impl PostgresNativeExecutor {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl QueryExecutor for PostgresNativeExecutor {
    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<String, GatewayError> {
        let conn = &self.connection;
        let server = select_server(conn, req.server)?;
        let database = conn.resolve_database(req.database)?;

        let mut tunnel: Option<InProcessTunnel> = None;
        let (host, port) = match &conn.ssh {
            Some(ssh) => {
                let mut t = InProcessTunnel::new(ssh.clone(), server.host.clone(), server.port);
                let local_port = t.start().await?;
                tunnel = Some(t);
                ("127.0.0.1".to_string(), local_port)
            }
            None => (server.host.clone(), server.port),
        };

        let result = run_query(conn, &database, &host, port, req.query, req.max_result_bytes_override).await;

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
    query: &str,
    max_bytes_override: Option<u64>,
) -> Result<String, GatewayError> {
    let max_bytes = max_bytes_override.unwrap_or(conn.max_result_bytes);

    let opts = PgConnectOptions::new()
        .host(host)
        .port(port)
        .username(&conn.username)
        .password(&conn.password)
        .database(database)
        .options([("default_transaction_read_only", "on")]);

    let mut pg = match tokio::time::timeout(
        Duration::from_secs(conn.connection_timeout_s),
        opts.connect(),
    )
    .await
    {
        Ok(Ok(c)) => c,
        Ok(Err(e)) => return Err(GatewayError::ExecutionError(format!("PostgreSQL: {e}"))),
        Err(_) => {
            return Err(GatewayError::ConnectionTimeout {
                backend: "PostgreSQL".to_string(),
                timeout_s: conn.connection_timeout_s,
            })
        }
    };

    pg.execute(sqlx::query(&format!(
        "SET statement_timeout = {}",
        conn.query_timeout_s * 1000
    )))
    .await
    .map_err(|e| GatewayError::ExecutionError(format!("PostgreSQL: {e}")))?;

    let describe = pg
        .describe(query)
        .await
        .map_err(|e| GatewayError::ExecutionError(format!("PostgreSQL: {e}")))?;
    let columns: Vec<String> = describe
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let type_names: Vec<String> = describe
        .columns()
        .iter()
        .map(|c| c.type_info().name().to_string())
        .collect();

    let mut acc = TsvAccumulator::new(max_bytes);
    if !columns.is_empty() {
        acc.push_forced(format_tsv_line(&columns));
    }

    let query_budget = Duration::from_secs(conn.query_timeout_s);
    let mut stream = pg.fetch(query);
    loop {
        let next = match tokio::time::timeout(query_budget, stream.next()).await {
            Ok(Some(Ok(row))) => row,
            Ok(Some(Err(e))) => {
                if is_query_canceled(&e) {
                    return Err(GatewayError::QueryTimeout {
                        backend: "PostgreSQL".to_string(),
                        timeout_s: conn.query_timeout_s,
                    });
                }
                return Err(GatewayError::ExecutionError(format!("PostgreSQL: {e}")));
            }
            Ok(None) => break,
            Err(_elapsed) => {
                return Err(GatewayError::QueryTimeout {
                    backend: "PostgreSQL".to_string(),
                    timeout_s: conn.query_timeout_s,
                })
            }
        };

        let values: Vec<String> = (0..next.len())
            .map(|i| pg_value_to_string(&next, i, &type_names[i]))
            .collect();
        if !acc.try_push(format_tsv_line(&values)) {
            break;
        }
    }
    drop(stream);

    let _ = pg.close().await;
    Ok(acc.finish())
}

fn is_query_canceled(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|code| code == "57014")
        .unwrap_or(false)
}

fn pg_value_to_string(row: &PgRow, idx: usize, type_name: &str) -> String {
    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_rfc3339())
            .unwrap_or_default(),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        _ => match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => v,
            Ok(None) => String::new(),
            Err(_) => "<unsupported type>".to_string(),
        },
    }
}
