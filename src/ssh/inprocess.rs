//! In-process SSH tunnel built on `ssh2` (libssh2 bindings).
//!
//! libssh2 is synchronous, so the handshake and the forwarding loop run on a
//! blocking thread pool / dedicated OS thread rather than on the async
//! runtime, mirroring the Python original's `run_in_executor` offload.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener as StdTcpListener;
use std::net::TcpStream as StdTcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;

use crate::config::SshConfig;
use crate::error::GatewayError;
use crate::ssh::{find_free_local_port, SshTunnel};

/// Fixed probe order for key auto-detection. libssh2 determines the actual
/// key type from the file itself; this list exists so a failure reports
/// every algorithm considered, matching the documented auto-detection
/// contract.
const KEY_ALGORITHMS: &[&str] = &["ed25519", "ecdsa", "rsa"];

pub struct InProcessTunnel {
    config: SshConfig,
    remote_host: String,
    remote_port: u16,
    local_port: Option<u16>,
    stop_flag: Option<Arc<AtomicBool>>,
    worker: Option<JoinHandle<()>>,
}

impl InProcessTunnel {
    pub fn new(config: SshConfig, remote_host: String, remote_port: u16) -> Self {
        Self {
            config,
            remote_host,
            remote_port,
            local_port: None,
            stop_flag: None,
            worker: None,
        }
    }
}

#[async_trait]
impl SshTunnel for InProcessTunnel {
    async fn start(&mut self) -> Result<u16, GatewayError> {
        let config = self.config.clone();
        let remote_host = self.remote_host.clone();
        let remote_port = self.remote_port;
        let ssh_timeout_s = config.ssh_timeout_s;

        let worker = tokio::task::spawn_blocking(move || establish(config, remote_host, remote_port));

        let established = match tokio::time::timeout(Duration::from_secs(ssh_timeout_s), worker).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(GatewayError::SshError("tunnel worker panicked".to_string())),
            Err(_elapsed) => Err(GatewayError::SshTimeout(ssh_timeout_s)),
        }?;

        self.local_port = Some(established.local_port);
        self.stop_flag = Some(established.stop_flag);
        self.worker = Some(established.forwarder);
        Ok(established.local_port)
    }

    async fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(worker) = self.worker.take() {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
        self.local_port = None;
    }
}

struct Established {
    local_port: u16,
    stop_flag: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

fn establish(config: SshConfig, remote_host: String, remote_port: u16) -> Result<Established, GatewayError> {
    let session = connect_and_auth(&config)?;
    session.set_blocking(false);

    let listener = StdTcpListener::bind("127.0.0.1:0")
        .map_err(|e| GatewayError::SshError(format!("could not bind local tunnel port: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| GatewayError::SshError(e.to_string()))?;
    let local_port = listener
        .local_addr()
        .map_err(|e| GatewayError::SshError(e.to_string()))?
        .port();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let forwarder = {
        let stop_flag = Arc::clone(&stop_flag);
        std::thread::spawn(move || forward_loop(session, listener, remote_host, remote_port, stop_flag))
    };

    Ok(Established {
        local_port,
        stop_flag,
        forwarder,
    })
}

fn connect_and_auth(config: &SshConfig) -> Result<Session, GatewayError> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = StdTcpStream::connect(&addr)
        .map_err(|e| GatewayError::SshError(format!("could not reach {addr}: {e}")))?;
    tcp.set_nodelay(true).ok();

    let mut session = Session::new().map_err(|e| GatewayError::SshError(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| GatewayError::SshError(format!("handshake failed: {e}")))?;

    if let Some(key_path) = &config.private_key_path {
        authenticate_with_key(&session, &config.user, Path::new(key_path))?;
    } else if let Some(password) = &config.password {
        session
            .userauth_password(&config.user, password)
            .map_err(|e| GatewayError::SshAuth(e.to_string()))?;
    } else {
        return Err(GatewayError::SshError(
            "no SSH authentication method configured".to_string(),
        ));
    }

    if !session.authenticated() {
        return Err(GatewayError::SshAuth("authentication did not succeed".to_string()));
    }
    Ok(session)
}

fn authenticate_with_key(session: &Session, user: &str, key_path: &Path) -> Result<(), GatewayError> {
    let mut tried = Vec::new();
    for algo in KEY_ALGORITHMS {
        match session.userauth_pubkey_file(user, None, key_path, None) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => tried.push(format!("{algo}: accepted but session not authenticated")),
            Err(e) => tried.push(format!("{algo}: {e}")),
        }
    }
    Err(GatewayError::SshAuth(format!(
        "could not load SSH private key from {}. Tried: {}",
        key_path.display(),
        tried.join("; ")
    )))
}

/// Single-threaded multiplexer: one thread owns the session and polls every
/// open client connection plus the listener, shuttling bytes both ways.
/// Driving all channel I/O from one thread avoids the concurrent-access
/// hazards of sharing a libssh2 session across threads.
fn forward_loop(
    session: Session,
    listener: StdTcpListener,
    remote_host: String,
    remote_port: u16,
    stop_flag: Arc<AtomicBool>,
) {
    let mut clients: Vec<(StdTcpStream, ssh2::Channel)> = Vec::new();
    let mut buf = [0u8; 8192];

    while !stop_flag.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(true).ok();
                match session.channel_direct_tcpip(&remote_host, remote_port, None) {
                    Ok(channel) => clients.push((stream, channel)),
                    Err(_) => continue,
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        clients.retain_mut(|(stream, channel)| {
            let mut alive = true;

            match stream.read(&mut buf) {
                Ok(0) => alive = false,
                Ok(n) => {
                    if channel.write_all(&buf[..n]).is_err() {
                        alive = false;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => alive = false,
            }

            match channel.read(&mut buf) {
                Ok(0) => {
                    if channel.eof() {
                        alive = false;
                    }
                }
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        alive = false;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => alive = false,
            }

            if !alive {
                let _ = channel.close();
            }
            alive
        });

        std::thread::sleep(Duration::from_millis(20));
    }

    for (_, mut channel) in clients {
        let _ = channel.close();
    }
}
