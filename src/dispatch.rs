//! Tool-dispatch façade: the only two operations exposed over stdio.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{schemars, tool, tool_handler, tool_router, ServerHandler};
use serde::Deserialize;

use crate::config::{Connection, ConnectionRegistry, Engine, Implementation, Server};
use crate::db::clickhouse_cli::ClickHouseCliExecutor;
use crate::db::clickhouse_native::ClickHouseNativeExecutor;
use crate::db::executor::display_host;
use crate::db::postgres_cli::PostgresCliExecutor;
use crate::db::postgres_native::PostgresNativeExecutor;
use crate::db::{clickhouse_effective_port, ExecuteRequest, QueryExecutor};
use crate::error::GatewayError;
use crate::timeout::with_hard_deadline;

#[derive(Clone)]
pub struct GatewayServer {
    registry: Arc<ConnectionRegistry>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunQueryParams {
    #[schemars(description = "Name of the connection to query, as listed by list_connections")]
    pub connection_name: String,

    #[schemars(description = "Read-only SQL query to execute")]
    pub query: String,

    #[schemars(description = "Server host to target when a connection has more than one configured")]
    #[serde(default)]
    pub server: Option<String>,

    #[schemars(
        description = "If set, write the full result to this path instead of returning it inline. The path must not already exist."
    )]
    #[serde(default)]
    pub file_path: Option<String>,
}

impl GatewayServer {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            tool_router: Self::tool_router(),
        }
    }

    fn err(e: GatewayError) -> ErrorData {
        e.to_mcp_error()
    }
}

#[tool_router]
impl GatewayServer {
    #[tool(
        name = "list_connections",
        description = "List every configured connection with its type, servers, default database, and user"
    )]
    async fn list_connections(&self) -> Result<CallToolResult, ErrorData> {
        let mut lines = vec!["name\ttype\tdescription\tservers\tdatabase\tuser".to_string()];
        for conn in self.registry.list() {
            let servers = conn
                .servers
                .iter()
                .map(|s| format!("{}:{}", display_host(conn, s), effective_port(conn, s)))
                .collect::<Vec<_>>()
                .join(",");
            lines.push(format!(
                "{}\t{}\t{}\t{}\t{}\t{}",
                conn.name,
                engine_name(conn.engine),
                conn.description,
                servers,
                conn.default_database,
                conn.username
            ));
        }
        Ok(CallToolResult::success(vec![Content::text(
            lines.join("\n"),
        )]))
    }

    #[tool(
        name = "run_query_read_only",
        description = "Execute a read-only SQL query against a configured connection and return the result as TSV"
    )]
    async fn run_query_read_only(
        &self,
        Parameters(params): Parameters<RunQueryParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let conn = self
            .registry
            .get(&params.connection_name)
            .map_err(Self::err)?
            .clone();
        let conn = Arc::new(conn);

        let max_override = if params.file_path.is_some() {
            Some(0)
        } else {
            None
        };

        let req = ExecuteRequest {
            query: &params.query,
            database: None,
            server: params.server.as_deref(),
            max_result_bytes_override: max_override,
        };

        let executor = build_executor(Arc::clone(&conn));
        let hard_timeout_s = conn.hard_timeout_s();
        let output = with_hard_deadline(hard_timeout_s, executor.execute(req))
            .await
            .map_err(Self::err)?;

        match params.file_path {
            Some(path) => {
                let resolved = write_result_file(&path, &output).map_err(Self::err)?;
                Ok(CallToolResult::success(vec![Content::text(resolved)]))
            }
            None => Ok(CallToolResult::success(vec![Content::text(output)])),
        }
    }
}

#[tool_handler]
impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "ro-sql-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Read-only SQL gateway. Use list_connections to see configured endpoints, \
                 then run_query_read_only to execute a SELECT-only query against one of them."
                    .to_string(),
            ),
        }
    }
}

fn engine_name(engine: Engine) -> &'static str {
    match engine {
        Engine::Postgresql => "postgresql",
        Engine::Clickhouse => "clickhouse",
    }
}

fn effective_port(conn: &Connection, server: &Server) -> u16 {
    match conn.engine {
        Engine::Postgresql => server.port,
        Engine::Clickhouse => clickhouse_effective_port(conn.implementation, server.port).1,
    }
}

fn build_executor(conn: Arc<Connection>) -> Box<dyn QueryExecutor> {
    match (conn.engine, conn.implementation) {
        (Engine::Postgresql, Implementation::Native) => Box::new(PostgresNativeExecutor::new(conn)),
        (Engine::Postgresql, Implementation::Cli) => Box::new(PostgresCliExecutor::new(conn)),
        (Engine::Clickhouse, Implementation::Native) => Box::new(ClickHouseNativeExecutor::new(conn)),
        (Engine::Clickhouse, Implementation::Cli) => Box::new(ClickHouseCliExecutor::new(conn)),
    }
}

/// Write `contents` to `path` atomically (temp file + rename), failing if
/// `path` already exists. Returns the resolved absolute path on success.
fn write_result_file(path: &str, contents: &str) -> Result<String, GatewayError> {
    let path = Path::new(path);
    if path.exists() {
        return Err(GatewayError::FileExists(path.display().to_string()));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| GatewayError::FileWriteError {
                path: path.display().to_string(),
                source: e,
            })?;
        }
    }

    let tmp_path = PathBuf::from(format!("{}.tmp-partial", path.display()));
    std::fs::write(&tmp_path, contents).map_err(|e| GatewayError::FileWriteError {
        path: path.display().to_string(),
        source: e,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| GatewayError::FileWriteError {
        path: path.display().to_string(),
        source: e,
    })?;

    let resolved: PathBuf = path
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default().join(path));
    Ok(resolved.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshConfig;

    fn conn(engine: Engine, implementation: Implementation, ssh: Option<SshConfig>) -> Connection {
        Connection {
            name: "c1".to_string(),
            engine,
            implementation,
            servers: vec![Server {
                host: "127.0.0.1".to_string(),
                port: 9000,
            }],
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
    fn clickhouse_effective_port_remaps_for_display() {
        let c = conn(Engine::Clickhouse, Implementation::Native, None);
        assert_eq!(effective_port(&c, &c.servers[0]), 8123);
    }

    #[test]
    fn postgresql_effective_port_is_passthrough() {
        let mut c = conn(Engine::Postgresql, Implementation::Native, None);
        c.servers[0].port = 5432;
        assert_eq!(effective_port(&c, &c.servers[0]), 5432);
    }

    #[test]
    fn write_result_file_rejects_existing_path() {
        let dir = std::env::temp_dir().join(format!("ro-sql-gateway-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("exists.tsv");
        std::fs::write(&file, "x").unwrap();
        let err = write_result_file(file.to_str().unwrap(), "y").unwrap_err();
        assert!(matches!(err, GatewayError::FileExists(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn write_result_file_creates_parents_and_writes_contents() {
        let dir = std::env::temp_dir().join(format!("ro-sql-gateway-test2-{}", std::process::id()));
        let file = dir.join("nested").join("out.tsv");
        let resolved = write_result_file(file.to_str().unwrap(), "a\tb").unwrap();
        assert!(!resolved.is_empty());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "a\tb");
        std::fs::remove_dir_all(&dir).ok();
    }
}
