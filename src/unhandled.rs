//! Process-wide sink for errors raised inside handlers.
//!
//! Event handlers, observers and deferred handlers never propagate their
//! errors into the emitting entity. They end up here instead: logged, then
//! passed to the installed sink if there is one. A graph may install its own
//! sink with [`Graph::on_unhandled_error`](crate::Graph::on_unhandled_error),
//! which takes precedence over this one.

use parking_lot::RwLock;

use crate::Error;

type Sink = Box<dyn Fn(&Error) + Send + Sync>;

static SINK: RwLock<Option<Sink>> = parking_lot::const_rwlock(None);

/// Install the process-wide handler, replacing any previous one.
pub fn set_unhandled_error_handler(handler: impl Fn(&Error) + Send + Sync + 'static) {
    *SINK.write() = Some(Box::new(handler));
}

/// Remove the process-wide handler. Errors are still logged.
pub fn clear_unhandled_error_handler() {
    *SINK.write() = None;
}

/// Log an error and hand it to the process-wide handler.
pub fn report_unhandled(err: &Error) {
    tracing::error!(error = %err, "unhandled error in handler");
    if let Some(sink) = SINK.read().as_ref() {
        sink(err);
    }
}
