//! Tracing setup and an in-memory event layer.
//!
//! `init_tracing` honours `RUST_LOG` when set, otherwise `ADMISSION_LOG`
//! (debug/info/warn/error, default info). `LOG_FORMAT=json` switches stderr
//! output to JSON and `ADMISSION_LOG_FILE` adds a plain-text file sink.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var("ADMISSION_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("admission={level},admissiond={level}"))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let file_layer = std::env::var("ADMISSION_LOG_FILE").ok().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("admission: cannot open log file {path}: {e}");
                None
            }
        }
    });

    let json_layer = use_json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!use_json).then(|| fmt::layer().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();
}

/// Layer that forwards each event as `LEVEL [target] message` to a channel.
pub struct EventAccumulator {
    tx: mpsc::UnboundedSender<String>,
}

impl EventAccumulator {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for EventAccumulator
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if self.tx.is_closed() {
            return;
        }

        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.send(format!(
            "{} [{}] {}",
            metadata.level(),
            metadata.target(),
            visitor.message
        ));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

/// Take every event accumulated so far.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}
