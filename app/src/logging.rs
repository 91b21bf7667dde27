//! Tracing setup for both processes.
//!
//! The controller logs to stderr. The worker runs detached from any terminal,
//! so [`ForwardLayer`] ships its events to the controller as LOG messages,
//! where [`relay`] re-emits them under the `worker` target.

use std::cell::Cell;
use std::fmt::{Debug, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::channel::Publisher;
use crate::message::{LogRecord, Message};

/// Events from the channel itself are never forwarded; a failing channel
/// would otherwise report its failures through itself.
const CHANNEL_TARGET: &str = "fabric_app::channel";

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install a stderr subscriber honouring `RUST_LOG`. A no-op if a global
/// subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter())
        .try_init();
}

/// Install a subscriber that forwards every event over `publisher`.
pub fn init_worker_tracing(publisher: Arc<Publisher>) {
    let _ = tracing_subscriber::registry()
        .with(ForwardLayer::new(publisher))
        .with(env_filter())
        .try_init();
}

pub struct ForwardLayer {
    publisher: Arc<Publisher>,
}

impl ForwardLayer {
    #[must_use]
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }
}

impl<S: tracing::Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(CHANNEL_TARGET) {
            return;
        }
        FORWARDING.with(|busy| {
            if busy.replace(true) {
                return;
            }
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            self.publisher.publish(&Message::Log(LogRecord {
                level: metadata.level().to_string(),
                target: metadata.target().to_string(),
                message: visitor.text,
            }));
            busy.set(false);
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    text: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.text.push_str(value);
        } else {
            let _ = write!(self.text, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            let _ = write!(self.text, "{value:?}");
        } else {
            let _ = write!(self.text, " {}={value:?}", field.name());
        }
    }
}

/// Re-emit a forwarded worker event locally.
pub fn relay(record: &LogRecord) {
    let level = record.level.parse::<Level>().unwrap_or(Level::INFO);
    let origin = record.target.as_str();
    let message = record.message.as_str();
    match level {
        Level::ERROR => tracing::error!(target: "worker", origin, "Worker-log: {message}"),
        Level::WARN => tracing::warn!(target: "worker", origin, "Worker-log: {message}"),
        Level::INFO => tracing::info!(target: "worker", origin, "Worker-log: {message}"),
        Level::DEBUG => tracing::debug!(target: "worker", origin, "Worker-log: {message}"),
        _ => tracing::trace!(target: "worker", origin, "Worker-log: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::{Handler, Subscriber};

    #[tokio::test(flavor = "multi_thread")]
    async fn events_are_forwarded_as_log_messages() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |message: Message| {
            if let Message::Log(record) = message {
                sink.lock().unwrap().push(record);
            }
        });
        let subscriber = Subscriber::bind("127.0.0.1", handler).await.unwrap();
        let publisher = Arc::new(Publisher::connect(subscriber.addr()).await.unwrap());

        let dispatch = tracing_subscriber::registry().with(ForwardLayer::new(publisher));
        tracing::subscriber::with_default(dispatch, || {
            tracing::warn!(qid = "q1", "disk almost full");
        });

        for _ in 0..200 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, "WARN");
        assert_eq!(seen[0].message, "disk almost full qid=q1");
    }
}
