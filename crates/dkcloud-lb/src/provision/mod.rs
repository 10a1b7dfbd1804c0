//! Remote provisioning over SSH and SFTP
//!
//! A backing instance moves through `Unreachable -> Reachable ->
//! SessionEstablished -> Closed`. [`Provisioner`] drives that lifecycle:
//! it polls until the instance accepts an authenticated connection, runs the
//! fixed provisioning sequence, and delivers configuration files.
//!
//! The transport is behind [`ShellConnector`] / [`ShellSession`] so the
//! engine can be exercised without a real host.

pub mod scripts;
mod ssh;

pub use ssh::{parse_private_key, SshConnector};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dkcloud_common::{Error, ProviderConfig, Result};

use crate::types::BackingInstance;

/// User every session logs in as
pub const REMOTE_USER: &str = "root";

/// How to authenticate a session
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// One-time root password, only valid until host preparation
    Password(String),
    /// Operator private key (OpenSSH or PEM encoded)
    PrivateKey(String),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::PrivateKey(_) => f.write_str("PrivateKey(<redacted>)"),
        }
    }
}

/// Result of a remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the remote shell
    pub exit_status: u32,
    /// Combined stdout and stderr
    pub output: String,
}

impl CommandOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An established session to one instance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShellSession: Send {
    /// Run a command and capture its combined output and exit status
    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Write a file, creating its parent directory if absent
    async fn upload(&mut self, path: &str, contents: &[u8]) -> Result<()>;

    /// Close the session
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions to instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connect and authenticate to `address` (port 22) as [`REMOTE_USER`]
    async fn connect(
        &self,
        hostname: &str,
        address: &str,
        auth: &SshAuth,
    ) -> Result<Box<dyn ShellSession>>;
}

/// Bounds of the readiness poll
#[derive(Clone, Copy, Debug)]
pub struct ReadinessPolicy {
    /// Time between connection attempts
    pub interval: Duration,
    /// Total time allowed before giving up
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Drives provisioning and configuration delivery
#[derive(Clone)]
pub struct Provisioner {
    connector: Arc<dyn ShellConnector>,
    readiness: ReadinessPolicy,
    private_key: String,
    public_key: String,
}

impl Provisioner {
    /// Create a provisioner authenticating with the configured key pair
    pub fn new(connector: Arc<dyn ShellConnector>, config: &ProviderConfig) -> Self {
        Self {
            connector,
            readiness: ReadinessPolicy::default(),
            private_key: config.ssh_private_key().to_string(),
            public_key: config.ssh_public_key().to_string(),
        }
    }

    /// Override the readiness poll bounds
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    fn key_auth(&self) -> SshAuth {
        SshAuth::PrivateKey(self.private_key.clone())
    }

    /// Poll until the instance accepts an authenticated session.
    ///
    /// Fails with `ProvisioningTimeout` once the readiness window is spent.
    /// Errors that no amount of waiting fixes, such as an unusable key, are
    /// returned from the first attempt.
    pub async fn wait_for_ready(
        &self,
        instance: &BackingInstance,
        auth: &SshAuth,
    ) -> Result<Box<dyn ShellSession>> {
        let address = primary_address(instance)?;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.connector.connect(&instance.hostname, address, auth).await {
                Ok(session) => {
                    info!(
                        hostname = %instance.hostname,
                        attempt,
                        elapsed_secs = started.elapsed().as_secs(),
                        "Instance accepts SSH connections"
                    );
                    return Ok(session);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(hostname = %instance.hostname, attempt, error = %e, "Connection failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    if started.elapsed() + self.readiness.interval >= self.readiness.timeout {
                        warn!(hostname = %instance.hostname, attempt, error = %e, "Instance never became reachable");
                        return Err(Error::provisioning_timeout(
                            &instance.hostname,
                            self.readiness.timeout.as_secs(),
                            e.to_string(),
                        ));
                    }
                    debug!(hostname = %instance.hostname, attempt, error = %e, "Instance not reachable yet");
                    tokio::time::sleep(self.readiness.interval).await;
                }
            }
        }
    }

    /// Prepare a fresh instance over its one-time password session
    pub async fn prepare_host(&self, instance: &BackingInstance, root_password: &str) -> Result<()> {
        let mut session = self
            .wait_for_ready(instance, &SshAuth::Password(root_password.to_string()))
            .await?;

        let result = async {
            debug!(hostname = %instance.hostname, path = scripts::APT_AUTO_CONF_PATH, "Uploading file");
            session
                .upload(scripts::APT_AUTO_CONF_PATH, scripts::APT_AUTO_CONF.as_bytes())
                .await?;
            info!(hostname = %instance.hostname, "Upgrading and configuring the operating system");
            run(
                session.as_mut(),
                &instance.hostname,
                &scripts::host_preparation_command(&self.public_key),
            )
            .await
        }
        .await;

        close_quietly(session, &instance.hostname).await;
        result
    }

    /// Install the balancer daemon over a key-authenticated session
    pub async fn install_balancer(&self, instance: &BackingInstance) -> Result<()> {
        // sshd was restarted during preparation, so poll again
        let mut session = self.wait_for_ready(instance, &self.key_auth()).await?;

        let result = async {
            for (path, contents) in scripts::BALANCER_FILES {
                debug!(hostname = %instance.hostname, path, "Uploading file");
                session.upload(path, contents.as_bytes()).await?;
            }
            info!(hostname = %instance.hostname, "Installing load balancer daemon");
            run(session.as_mut(), &instance.hostname, &scripts::install_command()).await
        }
        .await;

        close_quietly(session, &instance.hostname).await;
        result
    }

    /// Upload a configuration and reload the daemon.
    ///
    /// A failed reload leaves the uploaded file in place and reports
    /// `ReloadFailed`.
    pub async fn apply_config(&self, instance: &BackingInstance, config: &str) -> Result<()> {
        let address = primary_address(instance)?;
        let mut session = self
            .connector
            .connect(&instance.hostname, address, &self.key_auth())
            .await?;

        let result = async {
            debug!(hostname = %instance.hostname, path = scripts::HAPROXY_CONFIG_PATH, "Uploading configuration");
            session
                .upload(scripts::HAPROXY_CONFIG_PATH, config.as_bytes())
                .await?;
            let reload = session.exec(scripts::RELOAD_COMMAND).await.map_err(|e| {
                Error::reload_failed(&instance.hostname, e.to_string())
            })?;
            if !reload.success() {
                return Err(Error::reload_failed(
                    &instance.hostname,
                    format!("exit status {}: {}", reload.exit_status, reload.output.trim()),
                ));
            }
            Ok(())
        }
        .await;

        close_quietly(session, &instance.hostname).await;
        result
    }
}

fn primary_address(instance: &BackingInstance) -> Result<&str> {
    instance
        .primary_address()
        .ok_or_else(|| Error::inconsistent_state(&instance.hostname, "no IP addresses"))
}

async fn run(session: &mut dyn ShellSession, hostname: &str, command: &str) -> Result<()> {
    let out = session.exec(command).await?;
    if !out.success() {
        warn!(hostname = %hostname, exit_status = out.exit_status, output = %out.output, "Remote command failed");
        return Err(Error::remote_command(hostname, command, out.exit_status, out.output));
    }
    Ok(())
}

async fn close_quietly(mut session: Box<dyn ShellSession>, hostname: &str) {
    if let Err(e) = session.close().await {
        debug!(hostname = %hostname, error = %e, "Failed to close session");
    }
}
