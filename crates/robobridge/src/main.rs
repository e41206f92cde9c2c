mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "robobridge",
    version,
    about = "Bidirectional multi-stream bridge for robot sensor, pose and image data"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "text",
        global = true,
        env = "ROBOBRIDGE_LOG_FORMAT"
    )]
    log_format: LogFormat,

    /// Minimum log level (stderr). Default: RUST_LOG, then info.
    #[arg(long, value_name = "LEVEL", global = true, env = "ROBOBRIDGE_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            std::process::exit(exit::INTERNAL);
        }
    };
    let result = runtime.block_on(cmd::run(cli.command, format));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use robobridge_message::Category;

    use super::*;

    #[test]
    fn parses_stream_subcommand() {
        let cli = Cli::try_parse_from([
            "robobridge",
            "stream",
            "--server",
            "robot.local:50051",
            "--categories",
            "sensor,image",
            "--pose-interval",
            "50ms",
            "--count",
            "5",
        ])
        .expect("stream args should parse");

        let Command::Stream(args) = cli.command else {
            panic!("expected stream command");
        };
        assert_eq!(args.client.server, "robot.local:50051");
        assert_eq!(args.categories, Some(vec![Category::Sensor, Category::Image]));
        assert_eq!(args.pose_interval, std::time::Duration::from_millis(50));
        assert_eq!(args.count, Some(5));
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "robobridge",
            "send",
            "--json",
            "{\"x\":1}",
            "--file",
            "payload.json",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn rejects_unknown_category() {
        let err = Cli::try_parse_from(["robobridge", "send", "--category", "lidar"])
            .expect_err("unknown category should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn send_accepts_operation_names() {
        let cli = Cli::try_parse_from(["robobridge", "send", "-c", "StreamRobotPose"])
            .expect("operation name should parse");
        let Command::Send(args) = cli.command else {
            panic!("expected send command");
        };
        assert_eq!(args.category, Category::Pose);
    }

    #[test]
    fn parses_serve_subcommand() {
        let cli = Cli::try_parse_from([
            "robobridge",
            "serve",
            "--listen",
            "127.0.0.1:0",
            "--max-connections",
            "2",
            "--overflow",
            "queue",
            "--print",
        ])
        .expect("serve args should parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.max_connections, 2);
        assert_eq!(args.overflow, cmd::Overflow::Queue);
        assert!(args.print);
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let err = Cli::try_parse_from(["robobridge", "serve", "--max-connections", "0"])
            .expect_err("zero connections should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
