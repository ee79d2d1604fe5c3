//! Fallback tunnel that shells out to the system `ssh` client instead of
//! speaking the protocol in-process. Used when an in-process tunnel's
//! authentication fails, and by callers that prefer the system client
//! outright.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::config::SshConfig;
use crate::error::GatewayError;
use crate::process_util::{kill_process_group, which};
use crate::ssh::{find_free_local_port, SshTunnel};

pub struct SpawnedSshTunnel {
    config: SshConfig,
    remote_host: String,
    remote_port: u16,
    local_port: Option<u16>,
    child: Option<Child>,
}

impl SpawnedSshTunnel {
    pub fn new(config: SshConfig, remote_host: String, remote_port: u16) -> Self {
        Self {
            config,
            remote_host,
            remote_port,
            local_port: None,
            child: None,
        }
    }
}

#[async_trait]
impl SshTunnel for SpawnedSshTunnel {
    async fn start(&mut self) -> Result<u16, GatewayError> {
        let ssh_timeout_s = self.config.ssh_timeout_s;
        match timeout(Duration::from_secs(ssh_timeout_s), self.start_tunnel()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                self.stop().await;
                Err(GatewayError::SshTimeout(ssh_timeout_s))
            }
        }
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Some(pid) = child.id() {
            kill_process_group(pid as i32, false);
            if timeout(Duration::from_secs(5), child.wait()).await.is_err() {
                kill_process_group(pid as i32, true);
                let _ = child.wait().await;
            }
        }
        self.local_port = None;
    }
}

impl SpawnedSshTunnel {
    async fn start_tunnel(&mut self) -> Result<u16, GatewayError> {
        let local_port = find_free_local_port()?;

        let mut args: Vec<String> = vec![
            "-N".to_string(),
            "-L".to_string(),
            format!("{}:{}:{}", local_port, self.remote_host, self.remote_port),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=60".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-p".to_string(),
            self.config.port.to_string(),
        ];

        let mut program = "ssh".to_string();
        let mut sshpass_password = None;

        if let Some(key_path) = &self.config.private_key_path {
            args.push("-i".to_string());
            args.push(key_path.clone());
        } else if let Some(password) = &self.config.password {
            if which("sshpass").is_none() {
                return Err(GatewayError::ToolMissing(
                    "sshpass (required for password-based SSH authentication)".to_string(),
                ));
            }
            program = "sshpass".to_string();
            sshpass_password = Some(password.clone());
            args.insert(0, "ssh".to_string());
            args.insert(0, "-e".to_string());
            args.push("-o".to_string());
            args.push("PreferredAuthentications=password".to_string());
            args.push("-o".to_string());
            args.push("PubkeyAuthentication=no".to_string());
        }

        args.push(format!("{}@{}", self.config.user, self.config.host));

        if which(&program).is_none() {
            return Err(GatewayError::ToolMissing(program));
        }

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(password) = sshpass_password {
            command.env("SSHPASS", password);
        }
        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| GatewayError::SshError(format!("failed to spawn ssh: {e}")))?;

        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Ok(Some(status)) = child.try_wait() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(GatewayError::SshError(if stderr.trim().is_empty() {
                format!("ssh exited with {status}")
            } else {
                stderr.trim().to_string()
            }));
        }

        self.local_port = Some(local_port);
        self.child = Some(child);
        Ok(local_port)
    }
}
