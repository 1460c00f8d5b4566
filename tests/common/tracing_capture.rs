//! Tracing capture for tests that assert on operator-visible log output.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{dispatcher, Dispatch, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::prelude::*;

/// One emitted tracing event, flattened for assertions.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl LogRecord {
    /// Field value with the `Debug` quoting stripped.
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(|v| v.trim_matches('"').to_string())
    }
}

struct RecordFields<'a> {
    fields: &'a mut BTreeMap<String, String>,
}

impl Visit for RecordFields<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields.insert(field.name().to_string(), format!("{value:?}"));
    }
}

struct CaptureLayer {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut fields = BTreeMap::new();
        event.record(&mut RecordFields { fields: &mut fields });
        let meta = event.metadata();
        self.records.lock().unwrap().push(LogRecord {
            level: *meta.level(),
            target: meta.target().to_string(),
            message: fields.get("message").cloned().unwrap_or_default(),
            fields,
        });
    }
}

/// Recorded log events plus the guard keeping the capture subscriber
/// installed. Tests run on the current-thread runtime, so the thread default
/// set here also covers the dispatcher tasks.
pub struct LogCapture {
    records: Arc<Mutex<Vec<LogRecord>>>,
    _guard: dispatcher::DefaultGuard,
}

impl LogCapture {
    /// Start capturing every event at any level. Keep the returned handle
    /// alive for the duration of the test; dropping it uninstalls the
    /// subscriber.
    pub fn install() -> Self {
        let records = Arc::new(Mutex::new(Vec::new()));
        let collector = tracing_subscriber::registry()
            .with(CaptureLayer { records: records.clone() })
            .with(LevelFilter::TRACE);
        let guard = dispatcher::set_default(&Dispatch::new(collector));
        Self { records, _guard: guard }
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    /// First record at `level` whose message contains `needle`.
    pub fn find(&self, level: Level, needle: &str) -> Option<LogRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.level == level && r.message.contains(needle))
            .cloned()
    }
}
