//! Validated, immutable connection descriptors.
//!
//! [`Connection::from_raw`] is the single place where a wire-shaped
//! [`super::raw::RawConnection`] turns into something the rest of the
//! gateway can trust without re-checking. Validation failures are returned
//! as plain `String`s; [`super::registry`] is the only place that wraps them
//! with a connection name and aggregates them across a whole config file.

use std::collections::HashMap;

use super::raw::{RawConnection, RawServer, RawSshTunnel};

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_QUERY_TIMEOUT_S: u64 = 120;
const DEFAULT_CONNECTION_TIMEOUT_S: u64 = 10;
const DEFAULT_SSH_TIMEOUT_S: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Postgresql,
    Clickhouse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Implementation {
    Native,
    Cli,
}

#[derive(Debug, Clone)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: Option<String>,
    pub password: Option<String>,
    pub ssh_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub name: String,
    pub engine: Engine,
    pub implementation: Implementation,
    pub servers: Vec<Server>,
    pub default_database: String,
    pub allowed_databases: Vec<String>,
    pub username: String,
    pub password: String,
    pub ssh: Option<SshConfig>,
    pub query_timeout_s: u64,
    pub connection_timeout_s: u64,
    pub max_result_bytes: u64,
    pub description: String,
}

impl Connection {
    pub fn hard_timeout_s(&self) -> u64 {
        let ssh_timeout = self.ssh.as_ref().map(|s| s.ssh_timeout_s).unwrap_or(0);
        ssh_timeout + self.connection_timeout_s + self.query_timeout_s
    }

    pub fn resolve_database(&self, requested: Option<&str>) -> Result<String, crate::error::GatewayError> {
        let candidate = requested.map(str::trim).unwrap_or("");
        if candidate.is_empty() {
            return Ok(self.default_database.clone());
        }
        if !self.allowed_databases.iter().any(|d| d == candidate) {
            return Err(crate::error::GatewayError::DatabaseNotAllowed {
                connection: self.name.clone(),
                database: candidate.to_string(),
                allowed: self.allowed_databases.join(", "),
            });
        }
        Ok(candidate.to_string())
    }

    pub fn from_raw(raw: RawConnection, env: &HashMap<String, String>) -> Result<Connection, String> {
        let name = raw
            .connection_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing required field 'connection_name'".to_string())?
            .to_string();

        let db_type = raw
            .db_type
            .as_deref()
            .ok_or_else(|| "missing required field 'type'".to_string())?;
        let engine = match db_type {
            "postgresql" => Engine::Postgresql,
            "clickhouse" => Engine::Clickhouse,
            other => {
                return Err(format!(
                    "invalid database type: '{other}'. Must be 'postgresql' or 'clickhouse'"
                ))
            }
        };

        let implementation = match raw.implementation.as_deref().unwrap_or("cli") {
            "native" => Implementation::Native,
            "cli" => Implementation::Cli,
            other => {
                return Err(format!(
                    "invalid implementation: '{other}'. Must be 'native' or 'cli'"
                ))
            }
        };

        let raw_servers = raw.servers.filter(|s| !s.is_empty()).ok_or_else(|| {
            "missing required field 'servers' (must be non-empty list)".to_string()
        })?;
        let mut servers = Vec::with_capacity(raw_servers.len());
        for (idx, s) in raw_servers.into_iter().enumerate() {
            servers.push(
                parse_server(s, engine, implementation)
                    .map_err(|e| format!("Server #{}: {e}", idx + 1))?,
            );
        }

        let (default_database, allowed_databases) =
            resolve_databases(raw.db, raw.default_database, raw.allowed_databases, raw.databases)?;

        let username = raw
            .username
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing required field 'username'".to_string())?;

        let password = resolve_password(&name, raw.password, raw.password_env, env)?;

        let ssh = match raw.ssh_tunnel {
            Some(tunnel) => parse_ssh_tunnel(tunnel, &name, env)
                .map_err(|e| format!("SSH tunnel configuration error: {e}"))?,
            None => None,
        };

        Ok(Connection {
            name,
            engine,
            implementation,
            servers,
            default_database,
            allowed_databases,
            username,
            password,
            ssh,
            query_timeout_s: raw.query_timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT_S),
            connection_timeout_s: raw.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_S),
            max_result_bytes: raw.max_result_bytes.unwrap_or(0),
            description: raw.description.unwrap_or_default(),
        })
    }
}

fn parse_server(
    raw: RawServer,
    engine: Engine,
    implementation: Implementation,
) -> Result<Server, String> {
    match raw {
        RawServer::Map { host, port } => {
            let port = port.ok_or_else(|| "missing required field 'port'".to_string())?;
            Ok(Server { host, port })
        }
        RawServer::String(s) => {
            if let Some((host, port_str)) = s.rsplit_once(':') {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| format!("invalid port in server '{s}'"))?;
                Ok(Server {
                    host: host.to_string(),
                    port,
                })
            } else {
                Ok(Server {
                    host: s,
                    port: default_port(engine, implementation),
                })
            }
        }
    }
}

fn default_port(engine: Engine, implementation: Implementation) -> u16 {
    match engine {
        Engine::Postgresql => 5432,
        Engine::Clickhouse => match implementation {
            Implementation::Cli => 9000,
            Implementation::Native => 8123,
        },
    }
}

fn resolve_databases(
    db: Option<String>,
    default_database: Option<String>,
    allowed_databases: Option<Vec<String>>,
    databases: Option<Vec<String>>,
) -> Result<(String, Vec<String>), String> {
    if allowed_databases.is_some() && databases.is_some() {
        return Err("use only one of 'allowed_databases' or 'databases'".to_string());
    }
    let allowed_raw = allowed_databases.or(databases);
    let allowed = match allowed_raw {
        Some(list) => normalize_database_list(list)?,
        None => Vec::new(),
    };

    let db = db.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let explicit_default = default_database
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if let (Some(a), Some(b)) = (db, explicit_default) {
        if a != b {
            return Err("'db' and 'default_database' must match when both are provided".to_string());
        }
    }

    let default = explicit_default
        .or(db)
        .map(str::to_string)
        .or_else(|| allowed.first().cloned());

    let default = match default {
        Some(d) if !d.is_empty() => d,
        _ => {
            return Err("missing required field 'db' or 'default_database'".to_string());
        }
    };

    let allowed = if allowed.is_empty() {
        vec![default.clone()]
    } else if !allowed.contains(&default) {
        return Err("'default_database' must be included in 'allowed_databases'".to_string());
    } else {
        allowed
    };

    Ok((default, allowed))
}

fn normalize_database_list(value: Vec<String>) -> Result<Vec<String>, String> {
    let mut cleaned = Vec::new();
    for item in value {
        let name = item.trim().to_string();
        if name.is_empty() {
            return Err("'allowed_databases' entries must be non-empty strings".to_string());
        }
        if !cleaned.contains(&name) {
            cleaned.push(name);
        }
    }
    if cleaned.is_empty() {
        return Err("'allowed_databases' must contain at least one database name".to_string());
    }
    Ok(cleaned)
}

/// `DB_PASSWORD_<NAME>` / `SSH_PASSWORD_<NAME>` convention: uppercase the
/// connection name and replace `-` with `_`.
fn convention_env_var(prefix: &str, connection_name: &str) -> String {
    let normalized = connection_name.to_uppercase().replace('-', "_");
    format!("{prefix}_{normalized}")
}

fn resolve_password(
    connection_name: &str,
    literal: Option<String>,
    password_env: Option<String>,
    env: &HashMap<String, String>,
) -> Result<String, String> {
    if let Some(var) = password_env {
        return env
            .get(&var)
            .cloned()
            .ok_or_else(|| format!("password environment variable '{var}' not found"));
    }
    if let Some(literal) = literal {
        return Ok(literal);
    }
    let convention_var = convention_env_var("DB_PASSWORD", connection_name);
    Ok(env.get(&convention_var).cloned().unwrap_or_default())
}

fn parse_ssh_tunnel(
    raw: RawSshTunnel,
    connection_name: &str,
    env: &HashMap<String, String>,
) -> Result<Option<SshConfig>, String> {
    if !raw.enabled.unwrap_or(true) {
        return Ok(None);
    }

    let host = raw
        .host
        .ok_or_else(|| "missing required field 'host'".to_string())?;
    let user = raw
        .user
        .ok_or_else(|| "missing required field 'user'".to_string())?;

    let private_key_path = raw
        .private_key
        .or(raw.private_key_path)
        .map(|p| expand_home(&p));

    let mut password = if let Some(var) = raw.password_env {
        Some(
            env.get(&var)
                .cloned()
                .ok_or_else(|| format!("password environment variable '{var}' not found"))?,
        )
    } else {
        raw.password
    };

    if private_key_path.is_none() && password.is_none() {
        let convention_var = convention_env_var("SSH_PASSWORD", connection_name);
        password = env.get(&convention_var).cloned();
    }

    if private_key_path.is_none() && password.as_deref().unwrap_or("").is_empty() {
        return Err(format!(
            "SSH tunnel to {host} requires either 'private_key' or 'password'/'password_env'"
        ));
    }

    let ssh_timeout_s = match raw.ssh_timeout {
        Some(t) if t == 0 => return Err("SSH tunnel timeout must be a positive integer".to_string()),
        Some(t) => t,
        None => DEFAULT_SSH_TIMEOUT_S,
    };

    Ok(Some(SshConfig {
        host,
        port: raw.port.unwrap_or(DEFAULT_SSH_PORT),
        user,
        private_key_path,
        password,
        ssh_timeout_s,
    }))
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::raw::RawConnection;

    fn base_raw() -> RawConnection {
        RawConnection {
            connection_name: Some("pg1".to_string()),
            db_type: Some("postgresql".to_string()),
            implementation: Some("native".to_string()),
            servers: Some(vec![RawServer::String("db.internal".to_string())]),
            db: Some("app".to_string()),
            default_database: None,
            allowed_databases: None,
            databases: None,
            username: Some("reader".to_string()),
            password: Some("secret".to_string()),
            password_env: None,
            ssh_tunnel: None,
            query_timeout: None,
            connection_timeout: None,
            max_result_bytes: None,
            description: None,
        }
    }

    #[test]
    fn minimal_connection_validates() {
        let env = HashMap::new();
        let conn = Connection::from_raw(base_raw(), &env).unwrap();
        assert_eq!(conn.default_database, "app");
        assert_eq!(conn.allowed_databases, vec!["app".to_string()]);
        assert_eq!(conn.servers[0].port, 5432);
        assert_eq!(conn.query_timeout_s, DEFAULT_QUERY_TIMEOUT_S);
        assert_eq!(conn.max_result_bytes, 0);
    }

    #[test]
    fn clickhouse_default_port_depends_on_implementation() {
        let mut raw = base_raw();
        raw.db_type = Some("clickhouse".to_string());
        raw.implementation = Some("cli".to_string());
        let env = HashMap::new();
        let conn = Connection::from_raw(raw, &env).unwrap();
        assert_eq!(conn.servers[0].port, 9000);
    }

    #[test]
    fn default_database_must_be_in_allowlist() {
        let mut raw = base_raw();
        raw.allowed_databases = Some(vec!["other".to_string()]);
        let env = HashMap::new();
        let err = Connection::from_raw(raw, &env).unwrap_err();
        assert!(err.contains("must be included in 'allowed_databases'"));
    }

    #[test]
    fn password_env_missing_fails() {
        let mut raw = base_raw();
        raw.password = None;
        raw.password_env = Some("MISSING_VAR".to_string());
        let env = HashMap::new();
        let err = Connection::from_raw(raw, &env).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn password_convention_env_is_used_when_nothing_explicit() {
        let mut raw = base_raw();
        raw.password = None;
        let mut env = HashMap::new();
        env.insert("DB_PASSWORD_PG1".to_string(), "from-env".to_string());
        let conn = Connection::from_raw(raw, &env).unwrap();
        assert_eq!(conn.password, "from-env");
    }

    #[test]
    fn password_defaults_to_empty_when_nothing_resolves() {
        let mut raw = base_raw();
        raw.password = None;
        let env = HashMap::new();
        let conn = Connection::from_raw(raw, &env).unwrap();
        assert_eq!(conn.password, "");
    }

    #[test]
    fn ssh_tunnel_requires_key_or_password() {
        let mut raw = base_raw();
        raw.ssh_tunnel = Some(RawSshTunnel {
            enabled: None,
            host: Some("bastion".to_string()),
            user: Some("ops".to_string()),
            port: None,
            private_key: None,
            private_key_path: None,
            password: None,
            password_env: None,
            ssh_timeout: None,
        });
        let env = HashMap::new();
        let err = Connection::from_raw(raw, &env).unwrap_err();
        assert!(err.contains("requires either"));
    }

    #[test]
    fn ssh_tunnel_disabled_is_treated_as_absent() {
        let mut raw = base_raw();
        raw.ssh_tunnel = Some(RawSshTunnel {
            enabled: Some(false),
            host: Some("bastion".to_string()),
            user: Some("ops".to_string()),
            port: None,
            private_key: None,
            private_key_path: None,
            password: None,
            password_env: None,
            ssh_timeout: None,
        });
        let env = HashMap::new();
        let conn = Connection::from_raw(raw, &env).unwrap();
        assert!(conn.ssh.is_none());
    }

    #[test]
    fn ssh_password_convention_env_applies_when_no_key() {
        let mut raw = base_raw();
        raw.ssh_tunnel = Some(RawSshTunnel {
            enabled: None,
            host: Some("bastion".to_string()),
            user: Some("ops".to_string()),
            port: None,
            private_key: None,
            private_key_path: None,
            password: None,
            password_env: None,
            ssh_timeout: None,
        });
        let mut env = HashMap::new();
        env.insert("SSH_PASSWORD_PG1".to_string(), "hunter2".to_string());
        let conn = Connection::from_raw(raw, &env).unwrap();
        assert_eq!(conn.ssh.unwrap().password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn resolve_database_rejects_disallowed_name() {
        let env = HashMap::new();
        let conn = Connection::from_raw(base_raw(), &env).unwrap();
        let err = conn.resolve_database(Some("other")).unwrap_err();
        assert!(err.contains("is not allowed"));
    }

    #[test]
    fn resolve_database_defaults_when_absent() {
        let env = HashMap::new();
        let conn = Connection::from_raw(base_raw(), &env).unwrap();
        assert_eq!(conn.resolve_database(None).unwrap(), "app");
    }

    #[test]
    fn hard_timeout_sums_layers() {
        let env = HashMap::new();
        let mut raw = base_raw();
        raw.query_timeout = Some(30);
        raw.connection_timeout = Some(5);
        let conn = Connection::from_raw(raw, &env).unwrap();
        assert_eq!(conn.hard_timeout_s(), 35);
    }
}
