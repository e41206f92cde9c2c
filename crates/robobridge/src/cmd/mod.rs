use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use robobridge_message::Category;
use robobridge_peer::{ConnectConfig, HandshakeConfig, OverflowPolicy, DEFAULT_WINDOW};
use robobridge_transport::DEFAULT_LISTEN_ADDR;
use tokio_util::sync::CancellationToken;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod ping;
pub mod send;
pub mod serve;
pub mod stream;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept bridge clients and acknowledge every payload they stream.
    Serve(ServeArgs),
    /// Stream sample payloads for each category until stopped.
    Stream(StreamArgs),
    /// Send one payload and print its acknowledgement.
    Send(SendArgs),
    /// Probe a bridge server and print negotiated metadata.
    Ping(PingArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format).await,
        Command::Stream(args) => stream::run(args, format).await,
        Command::Send(args) => send::run(args, format).await,
        Command::Ping(args) => ping::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Security {
    Insecure,
    Tls,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Overflow {
    Reject,
    Queue,
}

impl From<Overflow> for OverflowPolicy {
    fn from(value: Overflow) -> Self {
        match value {
            Overflow::Reject => OverflowPolicy::Reject,
            Overflow::Queue => OverflowPolicy::Queue,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Bridge server address.
    #[arg(long, default_value = "localhost:50051", env = "ROBOBRIDGE_SERVER")]
    pub server: String,
    /// Transport security.
    #[arg(long, value_enum, default_value = "insecure", env = "ROBOBRIDGE_SECURITY")]
    pub security: Security,
    /// PEM bundle of trusted roots (with --security tls).
    #[arg(long, value_name = "PEM", env = "ROBOBRIDGE_TLS_CA")]
    pub tls_ca: Option<PathBuf>,
    /// Name the server certificate must match (default: host of --server).
    #[arg(long, env = "ROBOBRIDGE_TLS_SERVER_NAME")]
    pub tls_server_name: Option<String>,
    /// Token presented during the handshake.
    #[arg(long, env = "ROBOBRIDGE_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,
    /// Unacknowledged payloads allowed per stream.
    #[arg(long, default_value_t = DEFAULT_WINDOW, env = "ROBOBRIDGE_WINDOW")]
    pub window: u32,
    /// Connect and handshake timeout (e.g. 5s, 500ms).
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub handshake_timeout: Duration,
}

impl ClientArgs {
    pub fn connect_config(&self) -> CliResult<ConnectConfig> {
        #[allow(unused_mut)]
        let mut config = ConnectConfig {
            handshake: HandshakeConfig {
                timeout: self.handshake_timeout,
                window: self.window,
                auth_token: self.auth_token.clone(),
                ..HandshakeConfig::default()
            },
            ..ConnectConfig::default()
        };

        if self.security == Security::Tls {
            #[cfg(feature = "tls")]
            {
                let ca_path = self.tls_ca.clone().ok_or_else(|| {
                    CliError::new(USAGE, "--tls-ca is required with --security tls")
                })?;
                let server_name = self
                    .tls_server_name
                    .clone()
                    .unwrap_or_else(|| host_of(&self.server).to_string());
                config.tls = Some(robobridge_transport::TlsClientConfig {
                    ca_path,
                    server_name,
                });
            }
            #[cfg(not(feature = "tls"))]
            return Err(CliError::new(USAGE, "this build has no tls support"));
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR, env = "ROBOBRIDGE_LISTEN")]
    pub listen: String,
    /// Concurrent connections admitted at once.
    #[arg(
        long,
        default_value_t = 10,
        env = "ROBOBRIDGE_MAX_CONNECTIONS",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_connections: u32,
    /// What to do with connections beyond --max-connections.
    #[arg(long, value_enum, default_value = "reject", env = "ROBOBRIDGE_OVERFLOW")]
    pub overflow: Overflow,
    /// Over-limit connections told `reject` at once; more are closed silently.
    #[arg(
        long,
        default_value_t = 32,
        env = "ROBOBRIDGE_REJECT_BACKLOG",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub reject_backlog: u32,
    /// Categories offered to clients (comma-separated). Default: all.
    #[arg(long, value_delimiter = ',', env = "ROBOBRIDGE_CATEGORIES")]
    pub categories: Option<Vec<Category>>,
    /// Largest window offered to clients.
    #[arg(long, default_value_t = DEFAULT_WINDOW, env = "ROBOBRIDGE_WINDOW")]
    pub window: u32,
    /// Handshake timeout for each new connection.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub handshake_timeout: Duration,
    /// Time a stopping session gets before its connection is force-closed.
    #[arg(long, value_parser = parse_duration, default_value = "5s", env = "ROBOBRIDGE_GRACE")]
    pub grace: Duration,
    /// Time live sessions get to stop once shutdown is requested.
    #[arg(
        long,
        value_parser = parse_duration,
        default_value = "10s",
        env = "ROBOBRIDGE_SHUTDOWN_TIMEOUT"
    )]
    pub shutdown_timeout: Duration,
    /// Transport security.
    #[arg(long, value_enum, default_value = "insecure", env = "ROBOBRIDGE_SECURITY")]
    pub security: Security,
    /// PEM certificate chain (with --security tls).
    #[arg(long, value_name = "PEM", env = "ROBOBRIDGE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,
    /// PEM private key (with --security tls).
    #[arg(long, value_name = "PEM", env = "ROBOBRIDGE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
    /// Print every received payload to stdout.
    #[arg(long)]
    pub print: bool,
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// Categories to stream (comma-separated). Default: all.
    #[arg(long, value_delimiter = ',', env = "ROBOBRIDGE_CATEGORIES")]
    pub categories: Option<Vec<Category>>,
    /// Time between sensor readings.
    #[arg(long, value_parser = parse_duration, default_value = "1000ms")]
    pub sensor_interval: Duration,
    /// Time between pose updates.
    #[arg(long, value_parser = parse_duration, default_value = "100ms")]
    pub pose_interval: Duration,
    /// Time between image frames.
    #[arg(long, value_parser = parse_duration, default_value = "33ms")]
    pub image_interval: Duration,
    /// Stop after this long. Default: run until Ctrl-C or --count.
    #[arg(long, value_parser = parse_duration, env = "ROBOBRIDGE_DURATION")]
    pub duration: Option<Duration>,
    /// Payloads per category; each stream drains and closes after that many.
    #[arg(long)]
    pub count: Option<u64>,
    /// Time the session gets to stop before its connection is force-closed.
    #[arg(long, value_parser = parse_duration, default_value = "5s", env = "ROBOBRIDGE_GRACE")]
    pub grace: Duration,
    /// How long a finished stream waits for outstanding acknowledgements.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub drain_timeout: Duration,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// Category stream to send on.
    #[arg(long, short = 'c', default_value = "sensor")]
    pub category: Category,
    /// Payload as the category's JSON message object. Default: a sample.
    #[arg(long, conflicts_with = "file")]
    pub json: Option<String>,
    /// Read the JSON payload from a file.
    #[arg(long, conflicts_with = "json")]
    pub file: Option<PathBuf>,
    /// Maximum time to wait for the acknowledgement (e.g. 5s, 500ms).
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub wait_timeout: Duration,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// Number of pings.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub count: u32,
    /// Time to wait for each pong.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub timeout: Duration,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `150ms`, `2s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration value: {input}"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Host part of `host:port`, without IPv6 brackets.
pub fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Token cancelled on the first Ctrl-C.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received; shutting down"),
            Err(err) => tracing::warn!(error = %err, "signal handler unavailable; stop with Ctrl-C disabled"),
        }
        trigger.cancel();
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn host_of_strips_port_and_brackets() {
        assert_eq!(host_of("localhost:50051"), "localhost");
        assert_eq!(host_of("[::1]:50051"), "::1");
        assert_eq!(host_of("bridge.local"), "bridge.local");
    }

    fn client(security: Security) -> ClientArgs {
        ClientArgs {
            server: "robot.local:50051".to_string(),
            security,
            tls_ca: None,
            tls_server_name: None,
            auth_token: Some("secret".to_string()),
            window: 8,
            handshake_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn client_args_build_connect_config() {
        let config = client(Security::Insecure).connect_config().unwrap();
        assert_eq!(config.handshake.window, 8);
        assert_eq!(config.handshake.timeout, Duration::from_secs(2));
        assert_eq!(config.handshake.auth_token.as_deref(), Some("secret"));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn tls_requires_a_ca_bundle() {
        let err = client(Security::Tls).connect_config().unwrap_err();
        assert_eq!(err.code, USAGE);

        let mut args = client(Security::Tls);
        args.tls_ca = Some(PathBuf::from("/etc/robobridge/ca.pem"));
        let config = args.connect_config().unwrap();
        let tls = config.tls.expect("tls should be configured");
        assert_eq!(tls.server_name, "robot.local");
    }
}
