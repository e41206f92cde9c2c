use std::sync::Arc;

use robobridge_message::Category;
use robobridge_peer::{
    BridgeListener, BroadcastProcessor, HandlerRegistry, HandshakeConfig, ListenerConfig,
    SessionConfig,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cmd::{shutdown_on_ctrl_c, Security, ServeArgs};
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_listener_summary, print_payload, OutputFormat};

/// Payloads buffered for the `--print` writer before it starts skipping.
const PRINT_BUFFER: usize = 1024;

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = listener_config(&args)?;
    let listener = BridgeListener::bind(config)
        .await
        .map_err(|err| peer_error("bind failed", err))?;
    info!(
        addr = %listener.local_addr(),
        secure = listener.is_secure(),
        max_connections = args.max_connections,
        overflow = ?args.overflow,
        "bridge server listening; press Ctrl-C to stop"
    );

    let registry = if args.print {
        let broadcast = Arc::new(BroadcastProcessor::new(PRINT_BUFFER));
        let mut rx = broadcast.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => print_payload(&frame, format),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "payload printer fell behind")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        HandlerRegistry::new(broadcast)
    } else {
        HandlerRegistry::default()
    };

    let summary = listener
        .serve(registry, shutdown_on_ctrl_c())
        .await
        .map_err(|err| peer_error("serve failed", err))?;
    print_listener_summary(&summary, format);
    Ok(SUCCESS)
}

fn listener_config(args: &ServeArgs) -> CliResult<ListenerConfig> {
    let max_connections = usize::try_from(args.max_connections)
        .map_err(|_| CliError::new(USAGE, "--max-connections is too large"))?;
    let max_pending_rejects = usize::try_from(args.reject_backlog)
        .map_err(|_| CliError::new(USAGE, "--reject-backlog is too large"))?;

    #[allow(unused_mut)]
    let mut config = ListenerConfig {
        addr: args.listen.clone(),
        max_connections,
        overflow: args.overflow.into(),
        categories: args
            .categories
            .clone()
            .unwrap_or_else(|| Category::ALL.to_vec()),
        handshake: HandshakeConfig {
            timeout: args.handshake_timeout,
            window: args.window,
            ..HandshakeConfig::default()
        },
        session: SessionConfig {
            grace: args.grace,
            ..SessionConfig::default()
        },
        shutdown_timeout: args.shutdown_timeout,
        max_pending_rejects,
        ..ListenerConfig::default()
    };

    if args.security == Security::Tls {
        #[cfg(feature = "tls")]
        {
            let (Some(cert_path), Some(key_path)) = (args.tls_cert.clone(), args.tls_key.clone())
            else {
                return Err(CliError::new(
                    USAGE,
                    "--tls-cert and --tls-key are required with --security tls",
                ));
            };
            config.tls = Some(robobridge_transport::TlsServerConfig {
                cert_path,
                key_path,
            });
        }
        #[cfg(not(feature = "tls"))]
        return Err(CliError::new(USAGE, "this build has no tls support"));
    }

    Ok(config)
}
