//! Wire-shaped structs mirroring the declarative YAML document.
//!
//! These exist only to give `serde_yaml` something to deserialize into; all
//! validation and defaulting happens in [`super::connection`].

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RawConnection {
    pub connection_name: Option<String>,
    #[serde(rename = "type")]
    pub db_type: Option<String>,
    pub implementation: Option<String>,
    pub servers: Option<Vec<RawServer>>,
    pub db: Option<String>,
    pub default_database: Option<String>,
    pub allowed_databases: Option<Vec<String>>,
    pub databases: Option<Vec<String>>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_env: Option<String>,
    pub ssh_tunnel: Option<RawSshTunnel>,
    pub query_timeout: Option<u64>,
    pub connection_timeout: Option<u64>,
    pub max_result_bytes: Option<u64>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawServer {
    String(String),
    Map {
        host: String,
        port: Option<u16>,
    },
}

#[derive(Debug, Deserialize)]
pub struct RawSshTunnel {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub private_key: Option<String>,
    pub private_key_path: Option<String>,
    pub password: Option<String>,
    pub password_env: Option<String>,
    pub ssh_timeout: Option<u64>,
}
