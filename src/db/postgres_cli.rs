//! PostgreSQL executor that shells out to the `psql` client.
//!
//! Used for connections configured with `implementation: cli`, and as the
//! only executor path that needs [`crate::sql::guard`]: the query is spliced
//! into a scripted transaction, so a second statement smuggled past the
//! parser could escape the read-only wrapper entirely.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::config::Connection;
use crate::db::executor::{select_server, ExecuteRequest, QueryExecutor};
use crate::error::GatewayError;
use crate::process_util::{kill_process_group, which};
use crate::sql::guard::sanitize_read_only_sql;
use crate::sql::tsv::TsvAccumulator;
use crate::ssh::inprocess::InProcessTunnel;
use crate::ssh::SshTunnel;

const PSQL_BINARY: &str = "psql";

pub struct PostgresCliExecutor {
    connection: Arc<Connection>,
}

impl PostgresCliExecutor {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl QueryExecutor for PostgresCliExecutor {
    async fn execute(&self, req: ExecuteRequest<'_>) -> Result<String, GatewayError> {
        let conn = &self.connection;
        let server = select_server(conn, req.server)?;
        let database = conn.resolve_database(req.database)?;
        let sanitized = sanitize_read_only_sql(req.query)?;

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

        let result = run_query(
            conn,
            &database,
            &host,
            port,
            &sanitized,
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
    sanitized_query: &str,
    max_bytes_override: Option<u64>,
) -> Result<String, GatewayError> {
    if which(PSQL_BINARY).is_none() {
        return Err(GatewayError::ToolMissing(PSQL_BINARY.to_string()));
    }

    let max_bytes = max_bytes_override.unwrap_or(conn.max_result_bytes);
    let script = build_script(conn.query_timeout_s, sanitized_query);

    match run_attempt(conn, database, host, port, &script, max_bytes, true).await? {
        Attempt::Done(output) => Ok(output),
        Attempt::PgoptionsRejected => {
            match run_attempt(conn, database, host, port, &script, max_bytes, false).await? {
                Attempt::Done(output) => Ok(output),
                Attempt::PgoptionsRejected => unreachable!("retry never sets PGOPTIONS"),
            }
        }
    }
}

/// Build the scripted transaction spliced into `psql -c`. `sanitized_query`
/// must already have passed [`sanitize_read_only_sql`].
fn build_script(query_timeout_s: u64, sanitized_query: &str) -> String {
    format!(
        "BEGIN; SET TRANSACTION READ ONLY; SET LOCAL statement_timeout = {}; {}; COMMIT;",
        query_timeout_s * 1000,
        sanitized_query
    )
}

enum Attempt {
    Done(String),
    /// Startup failed specifically because the server rejected the
    /// `PGOPTIONS` session default; caller retries once without it.
    PgoptionsRejected,
}

/// Older PostgreSQL servers (pre-9.6) reject `default_transaction_read_only`
/// as a session-level `GUC` passed via `PGOPTIONS`; transaction-level
/// `SET TRANSACTION READ ONLY` in the script still enforces read-only mode
/// without it.
async fn run_attempt(
    conn: &Connection,
    database: &str,
    host: &str,
    port: u16,
    script: &str,
    max_bytes: u64,
    use_pgoptions: bool,
) -> Result<Attempt, GatewayError> {
    let mut command = Command::new(PSQL_BINARY);
    command
        .arg("--single-transaction")
        .arg("-h")
        .arg(host)
        .arg("-p")
        .arg(port.to_string())
        .arg("-U")
        .arg(&conn.username)
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg("-A")
        .arg("-F")
        .arg("\t")
        .arg(database)
        .arg("-c")
        .arg(script)
        .env("PGPASSWORD", &conn.password)
        .env("PGCONNECT_TIMEOUT", conn.connection_timeout_s.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if use_pgoptions {
        command.env("PGOPTIONS", "-c default_transaction_read_only=on");
    }

    let mut child = command
        .spawn()
        .map_err(|e| GatewayError::ExecutionError(format!("psql: failed to start: {e}")))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut acc = TsvAccumulator::new(max_bytes);
    let per_line_budget = Duration::from_secs(conn.query_timeout_s);
    let mut timed_out = false;

    loop {
        match tokio::time::timeout(per_line_budget, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if is_noise_line(&line) {
                    continue;
                }
                if !acc.try_push(line) {
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(GatewayError::ExecutionError(format!(
                    "psql: failed to read output: {e}"
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
        // The read loop stopped consuming stdout early; psql would otherwise
        // block writing the remaining rows into a full pipe and wait() would
        // never return.
        let _ = child.kill().await;
    }

    let status = child.wait().await;

    if timed_out {
        return Err(GatewayError::QueryTimeout {
            backend: "PostgreSQL".to_string(),
            timeout_s: conn.query_timeout_s,
        });
    }

    match status {
        Ok(status) if status.success() || acc.truncated() => Ok(Attempt::Done(acc.finish())),
        _ => {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            if use_pgoptions && is_pgoptions_rejection(&stderr) {
                return Ok(Attempt::PgoptionsRejected);
            }
            Err(GatewayError::ExecutionError(format!(
                "psql: {}",
                stderr.trim()
            )))
        }
    }
}

/// Whether `psql`'s startup failure looks like the server rejecting the
/// `default_transaction_read_only` GUC carried via `PGOPTIONS`.
fn is_pgoptions_rejection(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("invalid value for parameter")
        || (lower.contains("unrecognized configuration parameter")
            && lower.contains("default_transaction_read_only"))
}

/// psql's unaligned output (`-A`) still prints transaction bookkeeping and
/// the trailing `(N rows)` summary; these never belong in the result body.
fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();
    matches!(trimmed, "BEGIN" | "SET" | "COMMIT" | "ROLLBACK")
        || (trimmed.starts_with('(') && (trimmed.ends_with("row)") || trimmed.ends_with("rows)")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_transaction_noise() {
        assert!(is_noise_line("BEGIN"));
        assert!(is_noise_line("SET"));
        assert!(is_noise_line("COMMIT"));
        assert!(is_noise_line("(3 rows)"));
        assert!(is_noise_line("(1 row)"));
        assert!(!is_noise_line("1\tfoo"));
    }

    #[test]
    fn script_separates_query_from_commit_with_a_semicolon() {
        let script = build_script(30, "SELECT 1");
        assert_eq!(
            script,
            "BEGIN; SET TRANSACTION READ ONLY; SET LOCAL statement_timeout = 30000; SELECT 1; COMMIT;"
        );
    }

    #[test]
    fn recognizes_pgoptions_rejection() {
        assert!(is_pgoptions_rejection(
            "psql: error: connection to server failed: FATAL:  invalid value for parameter \"default_transaction_read_only\": \"on\""
        ));
        assert!(is_pgoptions_rejection(
            "FATAL: unrecognized configuration parameter \"default_transaction_read_only\""
        ));
        assert!(!is_pgoptions_rejection("FATAL: password authentication failed for user \"reader\""));
    }
}
