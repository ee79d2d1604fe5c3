//! End-to-end config-loading scenarios that don't need a live database.

use std::collections::HashMap;

use ro_sql_gateway::config::{ConnectionRegistry, Engine, Implementation};

fn env_with(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn loads_a_mixed_fleet_from_yaml() {
    let yaml = r#"
- connection_name: pg-primary
  type: postgresql
  implementation: native
  servers:
    - host: db.internal
      port: 5432
  default_database: app
  allowed_databases: [app, app_readonly]
  username: reader
  password_env: PG_PRIMARY_PASSWORD
  query_timeout: 30
- connection_name: ch-analytics
  type: clickhouse
  implementation: cli
  servers:
    - ch.internal:9000
  db: events
  username: reader
  ssh_tunnel:
    host: bastion.internal
    user: ops
    private_key: /keys/bastion_ed25519
"#;
    let env = env_with(&[("PG_PRIMARY_PASSWORD", "hunter2")]);
    let registry = ConnectionRegistry::parse(yaml, &env).expect("registry should load");

    let pg = registry.get("pg-primary").unwrap();
    assert_eq!(pg.engine, Engine::Postgresql);
    assert_eq!(pg.implementation, Implementation::Native);
    assert_eq!(pg.password, "hunter2");
    assert_eq!(pg.query_timeout_s, 30);
    assert!(pg.ssh.is_none());

    let ch = registry.get("ch-analytics").unwrap();
    assert_eq!(ch.engine, Engine::Clickhouse);
    assert_eq!(ch.default_database, "events");
    let ssh = ch.ssh.as_ref().expect("ssh tunnel configured");
    assert_eq!(ssh.host, "bastion.internal");
    assert_eq!(ssh.port, 22);

    assert_eq!(registry.list().count(), 2);
}

#[test]
fn rejects_database_outside_allowlist_at_query_time() {
    let yaml = r#"
- connection_name: pg1
  type: postgresql
  servers: [db.internal:5432]
  default_database: app
  allowed_databases: [app]
  username: reader
"#;
    let env = HashMap::new();
    let registry = ConnectionRegistry::parse(yaml, &env).unwrap();
    let conn = registry.get("pg1").unwrap();
    let err = conn.resolve_database(Some("other_db")).unwrap_err();
    assert!(err.to_string().contains("not allowed"));
}

#[test]
fn whole_file_fails_with_aggregated_errors_when_any_record_is_invalid() {
    let yaml = r#"
- connection_name: good
  type: postgresql
  servers: [db.internal:5432]
  default_database: app
  username: reader
- connection_name: missing-username
  type: postgresql
  servers: [db2.internal:5432]
  default_database: app
"#;
    let env = HashMap::new();
    let err = ConnectionRegistry::parse(yaml, &env).unwrap_err();
    assert!(err.to_string().contains("missing-username"));
    assert!(err.to_string().contains("username"));
}
