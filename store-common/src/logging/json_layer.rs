use std::fmt;
use std::io::{self, Write};

use chrono::{Local, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One JSON log line. Event fields (`symbol`, `stage`, `error`, ...) are
/// flattened next to the fixed keys.
#[derive(Debug, Serialize)]
pub struct LogRecord<'a> {
    pub ts: String,
    pub level: &'a str,
    pub target: &'a str,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

pub(crate) struct JsonLines {
    service: Option<String>,
    location: bool,
    utc: bool,
}

impl JsonLines {
    pub(crate) fn new(service: Option<String>, location: bool, utc: bool) -> Self {
        Self {
            service,
            location,
            utc,
        }
    }

    fn timestamp(&self) -> String {
        if self.utc {
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        } else {
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
        }
    }
}

impl<S: Subscriber> Layer<S> for JsonLines {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut fields = Fields::default();
        event.record(&mut fields);

        let record = LogRecord {
            ts: self.timestamp(),
            level: meta.level().as_str(),
            target: meta.target(),
            msg: fields.message.unwrap_or_default(),
            service: self.service.as_deref(),
            at: self
                .location
                .then(|| meta.file().zip(meta.line()))
                .flatten()
                .map(|(file, line)| format!("{}:{}", file, line)),
            fields: fields.values,
        };

        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(io::stdout().lock(), "{}", line);
        }
    }
}

#[derive(Default)]
struct Fields {
    message: Option<String>,
    values: Map<String, Value>,
}

impl Fields {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.values.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_flattens_fields() {
        let mut fields = Map::new();
        fields.insert("symbol".into(), json!("AAPL"));
        fields.insert("rows".into(), json!(390));
        let record = LogRecord {
            ts: "2024-01-05T00:00:00.000Z".into(),
            level: "WARN",
            target: "store_manager::backfill",
            msg: "Failed to backfill".into(),
            service: None,
            at: None,
            fields,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["symbol"], "AAPL");
        assert_eq!(value["rows"], 390);
        assert_eq!(value["msg"], "Failed to backfill");
        assert!(value.get("service").is_none());
        assert!(value.get("at").is_none());
    }

    #[test]
    fn test_utc_timestamp_shape() {
        let layer = JsonLines::new(Some("store-manager".into()), false, true);
        assert!(layer.timestamp().ends_with('Z'));
    }
}
