//! Command-line configuration for both binaries.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;

use crate::error::{ProxyError, Result};
use crate::pty::CommandSpec;

/// Share a program's terminal with TLS-authenticated viewers.
#[derive(Debug, Parser)]
#[command(name = "termproxy", version)]
pub struct ServerArgs {
    /// CA certificate that client certificates must chain to
    #[arg(long, env = "TERMPROXY_CA", default_value = "ca.crt")]
    pub ca: PathBuf,

    /// Server certificate
    #[arg(short = 'c', long, env = "TERMPROXY_CERT", default_value = "server.crt")]
    pub cert: PathBuf,

    /// Server private key
    #[arg(short = 'k', long, env = "TERMPROXY_KEY", default_value = "server.key")]
    pub key: PathBuf,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:7000
    pub listen: String,

    /// Program to run
    pub program: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl ServerArgs {
    pub fn command(&self) -> CommandSpec {
        CommandSpec {
            program: self.program.clone(),
            args: self.args.clone(),
        }
    }
}

/// Attach to a termproxy session.
#[derive(Debug, Parser)]
#[command(name = "termproxy-client", version)]
pub struct ClientArgs {
    /// CA certificate
    #[arg(long, env = "TERMPROXY_CA", default_value = "ca.crt")]
    pub ca: PathBuf,

    /// Server certificate to trust
    #[arg(short = 's', long, env = "TERMPROXY_SERVERCERT", default_value = "server.crt")]
    pub servercert: PathBuf,

    /// Client certificate
    #[arg(short = 'c', long, env = "TERMPROXY_CERT", default_value = "client.crt")]
    pub cert: PathBuf,

    /// Client private key
    #[arg(short = 'k', long, env = "TERMPROXY_KEY", default_value = "client.key")]
    pub key: PathBuf,

    /// Name to verify the server certificate against (defaults to the host)
    #[arg(long)]
    pub server_name: Option<String>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Server address as host:port
    pub host: String,
}

impl ClientArgs {
    pub fn server_name(&self) -> String {
        if let Some(name) = &self.server_name {
            return name.clone();
        }
        host_part(&self.host).to_string()
    }
}

fn host_part(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _port)) if !host.contains(':') => host,
        _ => addr,
    }
}

/// Outcome of parsing that should end the process before any work starts.
#[derive(Debug)]
pub enum EarlyExit {
    /// Help or version text; print it and exit 0.
    Info(String),
    Invalid(ProxyError),
}

/// Parse `argv` into `T`. Help and version requests come back as
/// [`EarlyExit::Info`]; everything else that fails is a usage error.
pub fn parse<T, I, S>(argv: I) -> std::result::Result<T, EarlyExit>
where
    T: Parser,
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    T::try_parse_from(argv).map_err(|err| match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EarlyExit::Info(err.to_string()),
        _ => EarlyExit::Invalid(ProxyError::Usage(err.to_string())),
    })
}

impl EarlyExit {
    pub fn into_result(self) -> Result<String> {
        match self {
            EarlyExit::Info(text) => Ok(text),
            EarlyExit::Invalid(err) => Err(err),
        }
    }
}
