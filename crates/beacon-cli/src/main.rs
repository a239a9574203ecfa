//! Command-line tools for the analytics schema contract.

#![deny(unsafe_code)]

use beacon_core::clock::{Clock, SystemClock};
use beacon_core::envelope::{BaseContext, EventEnvelope, PageInfo};
use beacon_core::schema::{SchemaRegistry, ValidationError};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use tracker::{Tracker, TrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "beacon", about = "Validate and send analytics events")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the event names a schema contract defines
    Events {
        #[arg(short, long)]
        schema: PathBuf,
    },
    /// Validate a JSONL file of events without sending anything
    Validate {
        #[arg(short, long)]
        schema: PathBuf,
        #[arg(short, long)]
        events: PathBuf,
        #[arg(long, default_value = "app://localhost/")]
        page_url: String,
    },
    /// Track a JSONL file of events and deliver them to the configured endpoint
    Send {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        events: PathBuf,
        #[arg(long, default_value_t = 5_000)]
        grace_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Events { schema } => cmd_events(&schema)?,
        Command::Validate { schema, events, page_url } => cmd_validate(&schema, &events, &page_url)?,
        Command::Send { config, events, grace_ms } => {
            telemetry::init_json_logging();
            #[cfg(feature = "otel")]
            telemetry::metrics::ensure_metrics_provider();
            let summary =
                cmd_send(config.as_deref(), &events, Duration::from_millis(grace_ms)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

/// Split a JSONL line into its event name and the remaining properties.
fn parse_line(raw: &str) -> Result<(String, Map<String, Value>), String> {
    let mut obj = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(m)) => m,
        Ok(_) => return Err("line is not a JSON object".into()),
        Err(e) => return Err(format!("invalid JSON: {e}")),
    };
    match obj.remove("event") {
        Some(Value::String(name)) => Ok((name, obj)),
        _ => Err("missing string field `event`".into()),
    }
}

/// Non-blank lines with their 1-based line numbers.
fn read_lines(path: &Path) -> Result<Vec<(usize, String)>, std::io::Error> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            out.push((idx + 1, line));
        }
    }
    Ok(out)
}

fn cmd_events(schema: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let registry = SchemaRegistry::from_path(schema)?;
    for name in registry.event_names() {
        println!("{name}");
    }
    Ok(())
}

/// Compose each line the way the tracker would and validate it.
fn validate_lines(
    registry: &SchemaRegistry,
    lines: &[(usize, String)],
    page_url: &str,
    clock: &dyn Clock,
) -> Vec<Value> {
    lines
        .iter()
        .map(|(no, raw)| {
            let (event, properties) = match parse_line(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return json!({ "line": no, "event": Value::Null, "valid": false, "errors": [e] })
                }
            };
            let base = BaseContext {
                event: event.clone(),
                user_id: None,
                anonymous_id: identity::SERVER_ANONYMOUS_ID.to_owned(),
                session_id: identity::SERVER_SESSION_ID.to_owned(),
                page: PageInfo::from_url(page_url),
                timestamp: clock.now_iso(),
            };
            let (envelope, _) = EventEnvelope::compose(base, properties);
            let errors = match registry.validate(&event, envelope.as_value()) {
                Ok(()) => Vec::new(),
                Err(ValidationError::UnknownEvent(_)) => vec!["unknown event".to_owned()],
                Err(ValidationError::Invalid { errors, .. }) => errors,
            };
            json!({ "line": no, "event": event, "valid": errors.is_empty(), "errors": errors })
        })
        .collect()
}

fn cmd_validate(
    schema: &Path,
    events: &Path,
    page_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = SchemaRegistry::from_path(schema)?;
    let lines = read_lines(events)?;
    let results = validate_lines(&registry, &lines, page_url, &SystemClock);
    let mut failed = 0usize;
    for r in &results {
        if r.get("valid") != Some(&Value::Bool(true)) {
            failed += 1;
        }
        println!("{}", serde_json::to_string(r)?);
    }
    if failed > 0 {
        return Err(format!("{failed} of {} events failed validation", results.len()).into());
    }
    Ok(())
}

async fn cmd_send(
    config: Option<&Path>,
    events: &Path,
    grace: Duration,
) -> Result<Value, Box<dyn std::error::Error>> {
    let cfg = TrackerConfig::load(config)?;
    let tracker = Tracker::from_config(&cfg)?;
    let mut skipped = 0u64;
    for (no, raw) in read_lines(events)? {
        match parse_line(&raw) {
            Ok((event, properties)) => tracker.track_event(&event, Value::Object(properties)),
            Err(e) => {
                skipped += 1;
                warn!(line = no, error = %e, "skipping unparseable line");
            }
        }
    }
    let unsent = tracker.shutdown(grace).await;
    let m = tracker.metrics().snapshot();
    Ok(json!({
        "accepted": m.accepted,
        "invalid": m.invalid,
        "unknown": m.unknown,
        "skipped": skipped,
        "sent": m.sent,
        "batches_sent": m.batches_sent,
        "send_failures": m.send_failures,
        "unsent": unsent,
    }))
}
