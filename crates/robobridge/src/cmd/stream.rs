use robobridge_message::Category;
use robobridge_peer::{
    connect_with_config, BridgeSession, CadenceConfig, FrameSource, SampleSource, SessionConfig,
    UnitReport,
};
use tracing::{info, warn};

use crate::cmd::{shutdown_on_ctrl_c, StreamArgs};
use crate::exit::{peer_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_session_summary, OutputFormat};

pub async fn run(args: StreamArgs, format: OutputFormat) -> CliResult<i32> {
    let categories = args
        .categories
        .clone()
        .unwrap_or_else(|| Category::ALL.to_vec());
    let config = args.client.connect_config()?;
    let connection = connect_with_config(&args.client.server, &categories, &config)
        .await
        .map_err(|err| peer_error("connect failed", err))?;
    info!(
        connection_id = connection.id(),
        transport = connection.transport(),
        categories = ?connection.categories(),
        window = connection.window(),
        "connected to bridge server"
    );

    let session = BridgeSession::new(connection, session_config(&args));
    session
        .start_producers(sources(&categories, args.count))
        .await
        .map_err(|err| peer_error("session start failed", err))?;

    let shutdown = shutdown_on_ctrl_c();
    let deadline = async {
        match args.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = deadline => info!("run duration elapsed"),
        _ = session.wait_idle() => info!("all producers finished"),
    }

    let summary = session.stop().await;
    print_session_summary(&summary, format);

    let failures = summary
        .units
        .iter()
        .filter(|unit| unit.is_failure())
        .collect::<Vec<&UnitReport>>();
    if failures.is_empty() {
        return Ok(SUCCESS);
    }
    for unit in failures {
        warn!(category = %unit.category, result = ?unit.result, "category stream failed");
    }
    Ok(FAILURE)
}

fn session_config(args: &StreamArgs) -> SessionConfig {
    SessionConfig {
        grace: args.grace,
        cadence: CadenceConfig {
            sensor: args.sensor_interval,
            pose: args.pose_interval,
            image: args.image_interval,
        },
        drain_timeout: args.drain_timeout,
    }
}

fn sources(categories: &[Category], count: Option<u64>) -> Vec<Box<dyn FrameSource>> {
    categories
        .iter()
        .map(|&category| {
            let source = SampleSource::new(category);
            let source = match count {
                Some(limit) => source.with_limit(limit),
                None => source,
            };
            Box::new(source) as Box<dyn FrameSource>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limited_sources_stop_after_count() {
        let mut sources = sources(&[Category::Sensor, Category::Image], Some(2));
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].category(), Category::Image);

        let image = &mut sources[1];
        assert!(image.next_frame().await.is_some());
        assert!(image.next_frame().await.is_some());
        assert!(image.next_frame().await.is_none());
    }
}
