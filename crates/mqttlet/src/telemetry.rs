//! Bus log forwarding.
//!
//! [`BusLogLayer`] captures tracing events and ships them as [`LogRecord`]s over a
//! channel to the controller, which publishes them on
//! `{namespace}/log/{service}/{instance}/{level}` while the publisher is connected.
//! Worker stderr and this module's own events are never forwarded.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::subscriptions::namespaced;

/// Target under which worker stderr lines are logged. Console only.
pub const WORKER_STDERR_TARGET: &str = "mqttlet::worker::stderr";

/// Target of this module's own events. Never forwarded.
pub const TELEMETRY_TARGET: &str = module_path!();

/// Default level for bus forwarding when nothing is configured.
pub const DEFAULT_BUS_LEVEL: LevelFilter = LevelFilter::ERROR;

/// Parse a level name, accepting syslog names alongside tracing's.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    let level = match name.trim().to_ascii_lowercase().as_str() {
        "off" | "none" => LevelFilter::OFF,
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" | "notice" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" | "err" | "critical" | "crit" | "alert" | "emergency" | "emerg" => {
            LevelFilter::ERROR
        }
        _ => return None,
    };
    Some(level)
}

/// Syslog-style name used in bus topics and payloads.
pub fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::TRACE | Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warning",
        Level::ERROR => "error",
    }
}

/// One captured log event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

pub struct BusLogLayer {
    tx: mpsc::UnboundedSender<LogRecord>,
}

/// Create the layer and the receiving end the controller drains.
pub fn bus_log_layer() -> (BusLogLayer, mpsc::UnboundedReceiver<LogRecord>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BusLogLayer { tx }, rx)
}

impl BusLogLayer {
    fn forwards(target: &str) -> bool {
        target != WORKER_STDERR_TARGET && target != TELEMETRY_TARGET
    }
}

impl<S> Layer<S> for BusLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !Self::forwards(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        // Receiver gone means the controller has stopped; nothing left to publish to.
        let _ = self.tx.send(LogRecord {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
            created_at: Utc::now(),
        });
    }
}

/// Collects the message plus any structured fields as `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        format!("{} {}", self.message, self.fields.join(" "))
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        // `message` arrives as fmt::Arguments, whose Debug output is the unquoted text.
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

/// Formats [`LogRecord`]s for publication.
#[derive(Debug, Clone)]
pub struct BusLogFormat {
    pub namespace: String,
    pub service_name: String,
    pub service_uuid: String,
    pub service_host: String,
}

impl BusLogFormat {
    pub fn topic(&self, level: &Level) -> String {
        let suffix = format!(
            "log/{}/{}/{}",
            self.service_name,
            self.service_uuid,
            level_name(level)
        );
        namespaced(&self.namespace, &suffix)
    }

    /// Topic and JSON body for one record.
    pub fn render(&self, record: &LogRecord) -> (String, String) {
        let topic = self.topic(&record.level);
        let body = serde_json::json!({
            "topic": topic,
            "service_name": self.service_name,
            "service_uuid": self.service_uuid,
            "service_host": self.service_host,
            "created_at": record.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "payload": {
                "log_entry": {
                    "log_message": record.message,
                    "log_level": level_name(&record.level),
                }
            }
        });
        (topic, body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::NULL_NAMESPACE;
    use chrono::TimeZone;
    use tracing_subscriber::layer::SubscriberExt;

    fn format() -> BusLogFormat {
        BusLogFormat {
            namespace: "default".to_string(),
            service_name: "echo".to_string(),
            service_uuid: "1234".to_string(),
            service_host: "c0ffee".to_string(),
        }
    }

    #[test]
    fn syslog_levels_map_onto_tracing() {
        assert_eq!(parse_level("notice"), Some(LevelFilter::INFO));
        assert_eq!(parse_level("WARNING"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("critical"), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("emergency"), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("debug"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn topic_includes_identity_and_level() {
        assert_eq!(format().topic(&Level::WARN), "default/log/echo/1234/warning");

        let unprefixed = BusLogFormat {
            namespace: NULL_NAMESPACE.to_string(),
            ..format()
        };
        assert_eq!(unprefixed.topic(&Level::ERROR), "log/echo/1234/error");
    }

    #[test]
    fn rendered_payload() {
        let record = LogRecord {
            level: Level::ERROR,
            target: "mqttlet::controller".to_string(),
            message: "worker exited".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        };
        let (topic, body) = format().render(&record);
        assert_eq!(topic, "default/log/echo/1234/error");
        insta::assert_snapshot!(body, @r#"{"topic":"default/log/echo/1234/error","service_name":"echo","service_uuid":"1234","service_host":"c0ffee","created_at":"2024-05-01T12:30:00.000Z","payload":{"log_entry":{"log_message":"worker exited","log_level":"error"}}}"#);
    }

    #[test]
    fn layer_forwards_events_with_fields() {
        let (layer, mut rx) = bus_log_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "mqttlet::router", code = 3, "worker exited");
        });

        let record = rx.try_recv().unwrap();
        assert_eq!(record.level, Level::ERROR);
        assert_eq!(record.target, "mqttlet::router");
        assert_eq!(record.message, "worker exited code=3");
    }

    #[test]
    fn layer_skips_worker_stderr_and_itself() {
        let (layer, mut rx) = bus_log_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "mqttlet::worker::stderr", "Traceback");
            tracing::error!(target: "mqttlet::telemetry", "publish failed");
            tracing::error!(target: "mqttlet::telemetry_extra", "not ours");
        });

        assert_eq!(rx.try_recv().unwrap().target, "mqttlet::telemetry_extra");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn level_filter_applies_per_layer() {
        let (layer, mut rx) = bus_log_layer();
        let subscriber = tracing_subscriber::registry().with(layer.with_filter(LevelFilter::WARN));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "mqttlet::router", "chatty");
            tracing::warn!(target: "mqttlet::router", "worth sending");
        });

        assert_eq!(rx.try_recv().unwrap().message, "worth sending");
        assert!(rx.try_recv().is_err());
    }
}
