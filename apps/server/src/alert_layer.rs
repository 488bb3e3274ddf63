//! Tracing layer that forwards ERROR events to an operator chat.
//!
//! At most one alert per [`MIN_INTERVAL`]; identical messages are suppressed
//! for [`DEDUP_WINDOW`]. Sends are spawned so logging never waits on HTTP.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::notify::escape_html;
use crate::telegram::TelegramApi;

const MIN_INTERVAL: Duration = Duration::from_secs(10);
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

pub struct AlertLayer {
    api: TelegramApi,
    chat_id: String,
    gate: Mutex<Gate>,
}

/// Rate limit and dedup bookkeeping.
struct Gate {
    last_sent: Option<Instant>,
    recent: Vec<(u64, Instant)>,
}

impl Gate {
    fn admit(&mut self, hash: u64, now: Instant) -> bool {
        self.recent.retain(|(_, at)| now.duration_since(*at) < DEDUP_WINDOW);

        let duplicate = self.recent.iter().any(|(h, _)| *h == hash);
        let too_soon = self
            .last_sent
            .is_some_and(|last| now.duration_since(last) < MIN_INTERVAL);
        if duplicate || too_soon {
            return false;
        }

        self.last_sent = Some(now);
        self.recent.push((hash, now));
        true
    }
}

impl AlertLayer {
    pub fn new(api: TelegramApi, chat_id: String) -> Self {
        Self {
            api,
            chat_id,
            gate: Mutex::new(Gate {
                last_sent: None,
                recent: Vec::new(),
            }),
        }
    }

    fn should_send(&self, message: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        message.hash(&mut hasher);
        let hash = hasher.finish();

        match self.gate.lock() {
            Ok(mut gate) => gate.admit(hash, Instant::now()),
            Err(_) => false,
        }
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message();

        if !self.should_send(&message) {
            return;
        }
        // Outside a runtime (e.g. during shutdown) there is nothing to send with.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let meta = event.metadata();
        let location = format!(
            "{} ({}:{})",
            meta.target(),
            meta.file().unwrap_or("?"),
            meta.line().map(|l| l.to_string()).unwrap_or_else(|| "?".into())
        );
        let text = format!(
            "🚨 <b>Server Error</b>\n━━━━━━━━━━━━━━━\n<code>{}</code>\n━━━━━━━━━━━━━━━\n📍 {}\n🕐 {}",
            escape_html(&message),
            escape_html(&location),
            chrono::Utc::now().format("%H:%M:%S UTC")
        );

        let api = self.api.clone();
        let chat_id = self.chat_id.clone();
        handle.spawn(async move {
            let _ = api.send_message(&chat_id, &text, &[]).await;
        });
    }
}

/// Collects the `message` field plus structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn message(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let extras = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        if self.message.is_empty() {
            extras
        } else {
            format!("{} ({extras})", self.message)
        }
    }

    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> Gate {
        Gate {
            last_sent: None,
            recent: Vec::new(),
        }
    }

    #[test]
    fn test_first_alert_passes_then_rate_limited() {
        let mut g = gate();
        let now = Instant::now();
        assert!(g.admit(1, now));
        assert!(!g.admit(2, now + Duration::from_secs(1)));
        assert!(g.admit(2, now + MIN_INTERVAL));
    }

    #[test]
    fn test_duplicates_suppressed_until_window_passes() {
        let mut g = gate();
        let now = Instant::now();
        assert!(g.admit(1, now));
        assert!(!g.admit(1, now + MIN_INTERVAL));
        assert!(g.admit(1, now + DEDUP_WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn test_layer_dedups_by_message() {
        let layer = AlertLayer::new(TelegramApi::new("1:x"), "42".into());
        assert!(layer.should_send("db down"));
        assert!(!layer.should_send("db down"));
    }

    #[test]
    fn test_message_with_fields() {
        let v = MessageVisitor {
            message: "transition failed".into(),
            fields: vec![("appointment_id".into(), "7".into())],
        };
        assert_eq!(v.message(), "transition failed (appointment_id=7)");

        let only_fields = MessageVisitor {
            message: String::new(),
            fields: vec![("error".into(), "timeout".into())],
        };
        assert_eq!(only_fields.message(), "error=timeout");
    }
}
