//! Sink for failures that are recovered from internally instead of being returned to the host.
use crate::Error;

/// Receives errors that did not change what the host observes: failed fetches, rejected payloads,
/// bad deltas and storage failures.
pub trait ErrorReporter {
    fn report(&self, operation: &'static str, error: &Error);
}

/// Reports errors through the `log` crate.
pub struct LogErrorReporter;
impl ErrorReporter for LogErrorReporter {
    fn report(&self, operation: &'static str, error: &Error) {
        log::warn!(target: "statsig", operation = operation; "{error}");
    }
}

impl<T: Fn(&'static str, &Error)> ErrorReporter for T {
    fn report(&self, operation: &'static str, error: &Error) {
        self(operation, error);
    }
}

/// A reporter that remembers the operations it was called for.
#[cfg(test)]
pub(crate) fn recording_reporter() -> (
    std::sync::Arc<dyn ErrorReporter + Send + Sync>,
    std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>,
) {
    use std::sync::{Arc, Mutex};

    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let reporter: Arc<dyn ErrorReporter + Send + Sync> =
        Arc::new(move |operation: &'static str, _error: &Error| {
            sink.lock().unwrap().push(operation);
        });
    (reporter, reported)
}
