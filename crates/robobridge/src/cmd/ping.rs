use robobridge_message::Category;
use robobridge_peer::connect_with_config;

use crate::cmd::PingArgs;
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_ping, OutputFormat, PingReport};

pub async fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = args.client.connect_config()?;
    config.stream.ping_timeout = args.timeout;

    let connection = connect_with_config(&args.client.server, &Category::ALL, &config)
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let mut rtts = Vec::with_capacity(args.count as usize);
    for _ in 0..args.count {
        let rtt = connection
            .ping()
            .await
            .map_err(|err| peer_error("ping failed", err))?;
        rtts.push(rtt);
    }

    print_ping(
        &PingReport {
            connection_id: connection.id(),
            transport: connection.transport(),
            secure: connection.is_secure(),
            categories: connection.categories(),
            window: connection.window(),
            protocol_version: &connection.handshake().protocol_version,
            rtts: &rtts,
        },
        format,
    );
    connection.close("ping complete").await;
    Ok(SUCCESS)
}
