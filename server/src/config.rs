use crate::error::{ServerError, ServerResult};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;
use zeroize::Zeroizing;

/// End-to-end encrypted media storage server.
#[derive(Parser, Clone, Debug)]
#[command(name = "krin-server", version)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080", env = "KRIN_ADDRESS")]
    pub address: SocketAddr,

    /// Directory holding the master key, metadata and blobs.
    #[arg(long, env = "KRIN_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Passphrase protecting the master key.
    #[arg(long, env = "KRIN_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Read the passphrase from this file.
    #[arg(long, env = "KRIN_PASSPHRASE_FILE", conflicts_with = "passphrase")]
    pub passphrase_file: Option<PathBuf>,

    /// Run this command and use its stdout as the passphrase.
    #[arg(
        long,
        env = "KRIN_PASSPHRASE_CMD",
        conflicts_with_all = ["passphrase", "passphrase_file"]
    )]
    pub passphrase_cmd: Option<String>,

    /// Number of requests served concurrently; more block in FIFO order.
    #[arg(long, default_value_t = 5, env = "KRIN_MAX_CONCURRENT_REQUESTS")]
    pub max_concurrent_requests: usize,

    /// Whether new accounts can register at all.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "KRIN_ALLOW_NEW_ACCOUNTS"
    )]
    pub allow_new_accounts: bool,

    /// Whether new accounts may log in without operator approval.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "KRIN_AUTO_APPROVE_NEW_ACCOUNTS"
    )]
    pub auto_approve_new_accounts: bool,

    /// Default storage quota in bytes for users without an explicit one;
    /// unset means unlimited.
    #[arg(long, env = "KRIN_DEFAULT_QUOTA")]
    pub default_quota: Option<i64>,
}

impl Config {
    /// Resolves the passphrase from whichever source was configured.
    pub fn read_passphrase(&self) -> ServerResult<Zeroizing<String>> {
        resolve_passphrase(
            self.passphrase.as_deref(),
            self.passphrase_file.as_deref(),
            self.passphrase_cmd.as_deref(),
        )
    }
}

pub fn resolve_passphrase(
    passphrase: Option<&str>,
    file: Option<&std::path::Path>,
    cmd: Option<&str>,
) -> ServerResult<Zeroizing<String>> {
    if let Some(p) = passphrase {
        return Ok(Zeroizing::new(p.to_string()));
    }
    if let Some(path) = file {
        let raw = std::fs::read_to_string(path)?;
        return Ok(Zeroizing::new(raw.trim_end().to_string()));
    }
    if let Some(cmd) = cmd {
        let out = Command::new("sh").arg("-c").arg(cmd).output()?;
        if !out.status.success() {
            return Err(ServerError::Denied("passphrase command failed"));
        }
        let raw = String::from_utf8(out.stdout).map_err(|_| ServerError::BadRequest)?;
        return Ok(Zeroizing::new(raw.trim_end().to_string()));
    }
    Err(ServerError::Denied("no passphrase source configured"))
}
