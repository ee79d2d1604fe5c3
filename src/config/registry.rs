//! Loads and validates the full connection list from a YAML file.

use std::collections::HashMap;
use std::path::Path;

use super::connection::Connection;
use super::raw::RawConnection;
use crate::error::GatewayError;

pub struct ConnectionRegistry {
    by_name: HashMap<String, Connection>,
    order: Vec<String>,
}

impl ConnectionRegistry {
    /// Parse and validate every connection record, collecting all errors
    /// before failing so an operator sees every problem in one pass.
    pub fn load(path: &Path, env: &HashMap<String, String>) -> Result<Self, GatewayError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("configuration file not found: {} ({e})", path.display()))
        })?;
        Self::parse(&contents, env)
    }

    pub fn parse(yaml: &str, env: &HashMap<String, String>) -> Result<Self, GatewayError> {
        let raw_configs: Vec<RawConnection> = serde_yaml::from_str(yaml).map_err(|e| {
            GatewayError::Config(format!("configuration file must contain a list of connections: {e}"))
        })?;

        if raw_configs.is_empty() {
            return Err(GatewayError::Config("configuration file is empty".to_string()));
        }

        let mut by_name = HashMap::new();
        let mut order = Vec::new();
        let mut errors = Vec::new();

        for (idx, raw) in raw_configs.into_iter().enumerate() {
            let label = raw
                .connection_name
                .clone()
                .unwrap_or_else(|| format!("#{}", idx + 1));
            match Connection::from_raw(raw, env) {
                Ok(conn) => {
                    if by_name.contains_key(&conn.name) {
                        errors.push(format!("duplicate connection name: '{}'", conn.name));
                    } else {
                        order.push(conn.name.clone());
                        by_name.insert(conn.name.clone(), conn);
                    }
                }
                Err(e) => errors.push(format!("Connection '{label}': {e}")),
            }
        }

        if !errors.is_empty() {
            return Err(GatewayError::Config(errors.join("\n  - ")));
        }

        Ok(ConnectionRegistry { by_name, order })
    }

    pub fn get(&self, name: &str) -> Result<&Connection, GatewayError> {
        self.by_name.get(name).ok_or_else(|| {
            GatewayError::ConnectionNotFound(name.to_string(), self.order.join(", "))
        })
    }

    pub fn list(&self) -> impl Iterator<Item = &Connection> {
        self.order.iter().map(move |name| &self.by_name[name])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml_fixture() -> &'static str {
        r#"
- connection_name: pg1
  type: postgresql
  implementation: native
  servers:
    - host: db.internal
      port: 5432
  db: app
  username: reader
  password: secret
- connection_name: ch1
  type: clickhouse
  implementation: cli
  servers:
    - ch.internal:9000
  default_database: events
  username: reader
  password_env: CH_PASSWORD
"#
    }

    #[test]
    fn loads_multiple_connections() {
        let mut env = HashMap::new();
        env.insert("CH_PASSWORD".to_string(), "hunter2".to_string());
        let registry = ConnectionRegistry::parse(yaml_fixture(), &env).unwrap();
        assert!(registry.get("pg1").is_ok());
        assert!(registry.get("ch1").is_ok());
        assert_eq!(registry.list().count(), 2);
    }

    #[test]
    fn unknown_connection_lists_available_names() {
        let env = HashMap::new();
        let registry = ConnectionRegistry::parse(yaml_fixture(), &env).unwrap();
        let err = registry.get("nope").unwrap_err();
        assert!(err.to_string().contains("pg1"));
        assert!(err.to_string().contains("ch1"));
    }

    #[test]
    fn aggregates_errors_across_records() {
        let yaml = r#"
- connection_name: bad1
  type: oracle
  servers: [a]
  db: x
  username: u
- connection_name: bad2
  type: postgresql
  servers: []
  db: x
  username: u
"#;
        let env = HashMap::new();
        let err = ConnectionRegistry::parse(yaml, &env).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad1"));
        assert!(msg.contains("bad2"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let yaml = r#"
- connection_name: dup
  type: postgresql
  servers: [a]
  db: x
  username: u
- connection_name: dup
  type: postgresql
  servers: [b]
  db: x
  username: u
"#;
        let env = HashMap::new();
        let err = ConnectionRegistry::parse(yaml, &env).unwrap_err();
        assert!(err.to_string().contains("Duplicate".to_lowercase().as_str()) || err.to_string().contains("duplicate"));
    }

    #[test]
    fn empty_file_fails() {
        let env = HashMap::new();
        let err = ConnectionRegistry::parse("[]", &env).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
