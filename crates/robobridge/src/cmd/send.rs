use robobridge_message::{now_millis, PayloadFrame};
use robobridge_peer::connect_with_config;
use tracing::debug;

use crate::cmd::SendArgs;
use crate::exit::{io_error, peer_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_ack, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let frame = resolve_payload(&args)?;
    let config = args.client.connect_config()?;
    let connection = connect_with_config(&args.client.server, &[args.category], &config)
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let mut stream = connection
        .open_stream(args.category)
        .await
        .map_err(|err| peer_error("open stream failed", err))?;
    stream
        .send(&frame)
        .await
        .map_err(|err| peer_error("send failed", err))?;
    debug!(stream_id = stream.id(), summary = %frame.summary(), "payload sent");

    let ack = tokio::time::timeout(args.wait_timeout, stream.receive())
        .await
        .map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("no acknowledgement within {:?}", args.wait_timeout),
            )
        })?
        .map_err(|err| peer_error("receive failed", err))?
        .ok_or_else(|| CliError::new(FAILURE, "stream ended before the acknowledgement"))?;

    print_ack(args.category, &ack, connection.id(), format);

    if let Err(err) = stream.close().await {
        debug!(error = %err, "stream close after ack failed");
    }
    connection.close("send complete").await;

    Ok(if ack.success { SUCCESS } else { FAILURE })
}

/// The payload from `--json`, `--file`, or the category's sample.
fn resolve_payload(args: &SendArgs) -> CliResult<PayloadFrame> {
    let bytes = if let Some(json) = &args.json {
        json.as_bytes().to_vec()
    } else if let Some(path) = &args.file {
        std::fs::read(path).map_err(|err| io_error(&format!("read {}", path.display()), err))?
    } else {
        return Ok(PayloadFrame::sample(args.category, now_millis()));
    };

    PayloadFrame::decode(args.category, &bytes).map_err(|err| {
        CliError::new(
            DATA_INVALID,
            format!("payload is not a valid {} message: {err}", args.category),
        )
    })
}
