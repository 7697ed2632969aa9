//! Tracing layer that forwards engine events to a channel.
//!
//! Lets a host (a CLI progress bar, a notebook bridge, a test) follow
//! refreshes, retries, fallbacks and cache decisions without parsing logs.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Target prefix shared by every engine event.
pub const ENGINE_TARGET: &str = "tabula";

/// One engine event, as sent to the channel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExtractionEvent {
    /// Event target (e.g. "tabula::fetcher")
    pub target: String,
    /// Log level (INFO, DEBUG, WARN, ERROR)
    pub level: String,
    pub message: String,
    /// Structured fields from the event (offset, environment, attempt...)
    pub fields: HashMap<String, Value>,
    pub timestamp: String,
}

impl ExtractionEvent {
    /// Last path segment of the target ("fetcher", "cache", ...).
    pub fn component(&self) -> &str {
        self.target.rsplit("::").next().unwrap_or(&self.target)
    }
}

/// Sends every `tabula*` event to an unbounded channel.
pub struct ExtractionEventLayer {
    sender: mpsc::UnboundedSender<ExtractionEvent>,
}

impl ExtractionEventLayer {
    pub fn new(sender: mpsc::UnboundedSender<ExtractionEvent>) -> Self {
        Self { sender }
    }

    /// A layer plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExtractionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl<S> Layer<S> for ExtractionEventLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if !target.starts_with(ENGINE_TARGET) {
            return;
        }

        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));

        let message = fields
            .remove("message")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let extraction_event = ExtractionEvent {
            target: target.to_string(),
            level: event.metadata().level().to_string(),
            message,
            fields,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        // Receiver gone: nobody is listening, drop the event.
        let _ = self.sender.send(extraction_event);
    }
}

/// Collects event fields into a map.
struct FieldVisitor<'a>(&'a mut HashMap<String, Value>);

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(
            field.name().to_string(),
            serde_json::json!(format!("{:?}", value)),
        );
    }
}
