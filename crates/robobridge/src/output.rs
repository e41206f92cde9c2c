use std::io::IsTerminal;
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use robobridge_message::{AckFrame, Category, PayloadFrame};
use robobridge_peer::{ListenerSummary, SessionSummary, UnitReport, UnitResult};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

#[derive(Serialize)]
struct AckOutput<'a> {
    kind: &'static str,
    category: Category,
    operation: &'static str,
    success: bool,
    message: &'a str,
    connection_id: &'a str,
}

pub fn print_ack(category: Category, ack: &AckFrame, connection_id: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&AckOutput {
            kind: "ack",
            category,
            operation: category.operation(),
            success: ack.success,
            message: &ack.message,
            connection_id,
        }),
        OutputFormat::Table => {
            let mut out = table(vec!["CATEGORY", "SUCCESS", "MESSAGE", "CONNECTION"]);
            out.add_row(vec![
                category.to_string(),
                ack.success.to_string(),
                ack.message.clone(),
                connection_id.to_string(),
            ]);
            println!("{out}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} ack success={} message={:?} connection={}",
                category.operation(),
                ack.success,
                ack.message,
                connection_id
            );
        }
    }
}

#[derive(Serialize)]
struct PayloadOutput<'a> {
    kind: &'static str,
    category: Category,
    timestamp: i64,
    summary: String,
    payload: &'a PayloadFrame,
}

/// One line per received payload, for `serve --print`.
pub fn print_payload(frame: &PayloadFrame, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&PayloadOutput {
            kind: "payload",
            category: frame.category(),
            timestamp: frame.timestamp(),
            summary: frame.summary(),
            payload: frame,
        }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "{} ts={} {}",
                frame.category(),
                frame.timestamp(),
                frame.summary()
            );
        }
    }
}

#[derive(Serialize)]
struct PingOutput<'a> {
    kind: &'static str,
    connection_id: &'a str,
    transport: &'a str,
    secure: bool,
    categories: &'a [Category],
    window: usize,
    protocol_version: &'a str,
    rtt_ms: Vec<f64>,
}

pub struct PingReport<'a> {
    pub connection_id: &'a str,
    pub transport: &'a str,
    pub secure: bool,
    pub categories: &'a [Category],
    pub window: usize,
    pub protocol_version: &'a str,
    pub rtts: &'a [Duration],
}

pub fn print_ping(report: &PingReport<'_>, format: OutputFormat) {
    let rtt_ms: Vec<f64> = report
        .rtts
        .iter()
        .map(|rtt| rtt.as_secs_f64() * 1000.0)
        .collect();
    let categories = report
        .categories
        .iter()
        .map(Category::to_string)
        .collect::<Vec<_>>()
        .join(",");

    match format {
        OutputFormat::Json => print_json(&PingOutput {
            kind: "ping",
            connection_id: report.connection_id,
            transport: report.transport,
            secure: report.secure,
            categories: report.categories,
            window: report.window,
            protocol_version: report.protocol_version,
            rtt_ms,
        }),
        OutputFormat::Table => {
            let mut out = table(vec!["FIELD", "VALUE"]);
            out.add_row(vec!["connection".to_string(), report.connection_id.to_string()]);
            out.add_row(vec!["transport".to_string(), report.transport.to_string()]);
            out.add_row(vec!["secure".to_string(), report.secure.to_string()]);
            out.add_row(vec!["categories".to_string(), categories]);
            out.add_row(vec!["window".to_string(), report.window.to_string()]);
            out.add_row(vec!["protocol".to_string(), report.protocol_version.to_string()]);
            for (seq, rtt) in rtt_ms.iter().enumerate() {
                out.add_row(vec![format!("rtt #{}", seq + 1), format!("{rtt:.3} ms")]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            println!(
                "connection={} transport={} secure={} categories={} window={} protocol={}",
                report.connection_id,
                report.transport,
                report.secure,
                categories,
                report.window,
                report.protocol_version
            );
            for (seq, rtt) in rtt_ms.iter().enumerate() {
                println!("ping seq={} rtt={rtt:.3}ms", seq + 1);
            }
        }
    }
}

#[derive(Serialize)]
struct SessionOutput<'a> {
    kind: &'static str,
    #[serde(flatten)]
    summary: &'a SessionSummary,
}

pub fn print_session_summary(summary: &SessionSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&SessionOutput {
            kind: "session_summary",
            summary,
        }),
        OutputFormat::Table => {
            let mut out = table(vec!["CATEGORY", "STREAM", "RESULT", "SENT", "ACKED", "DETAIL"]);
            for unit in &summary.units {
                out.add_row(unit_row(unit));
            }
            println!("{out}");
            println!(
                "connection={} forced={} elapsed={}ms",
                summary.connection_id, summary.forced, summary.elapsed_ms
            );
        }
        OutputFormat::Pretty => {
            println!(
                "session connection={} role={} forced={} elapsed={}ms",
                summary.connection_id, summary.role, summary.forced, summary.elapsed_ms
            );
            for unit in &summary.units {
                println!("  {}", unit_row(unit).join(" "));
            }
        }
    }
}

fn unit_row(unit: &UnitReport) -> Vec<String> {
    let stream = unit
        .stream_id
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    let (result, sent, acked, detail) = match &unit.result {
        UnitResult::Producer(report) => (
            "producer",
            report.sent.to_string(),
            report.acked.to_string(),
            format!("{:?}", report.outcome),
        ),
        UnitResult::Handler(report) => (
            "handler",
            report.received.to_string(),
            report.acked.to_string(),
            format!("{:?}", report.outcome),
        ),
        UnitResult::Failed { error } => ("failed", "-".into(), "-".into(), error.clone()),
        UnitResult::LaunchFailed { error } => {
            ("launch_failed", "-".into(), "-".into(), error.clone())
        }
        UnitResult::Panicked { error } => ("panicked", "-".into(), "-".into(), error.clone()),
        UnitResult::Detached => ("detached", "-".into(), "-".into(), String::new()),
    };
    vec![
        unit.category.to_string(),
        stream,
        result.to_string(),
        sent,
        acked,
        detail,
    ]
}

#[derive(Serialize)]
struct ListenerOutput<'a> {
    kind: &'static str,
    #[serde(flatten)]
    summary: &'a ListenerSummary,
}

pub fn print_listener_summary(summary: &ListenerSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListenerOutput {
            kind: "listener_summary",
            summary,
        }),
        OutputFormat::Table => {
            let mut out = table(vec![
                "ACCEPTED",
                "REJECTED",
                "DROPPED",
                "COMPLETED", "HANDSHAKE FAILED",
                "ABANDONED",
            ]);
            out.add_row(vec![
                summary.accepted.to_string(),
                summary.rejected.to_string(),
                summary.dropped.to_string(),
                summary.completed.to_string(),
                summary.failed_handshakes.to_string(),
                summary.abandoned.to_string(),
            ]);
            println!("{out}");
        }
        OutputFormat::Pretty => {
            println!(
                "listener accepted={} rejected={} dropped={} completed={} failed_handshakes={} abandoned={}",
                summary.accepted,
                summary.rejected,
                summary.dropped,
                summary.completed,
                summary.failed_handshakes,
                summary.abandoned
            );
        }
    }
}
