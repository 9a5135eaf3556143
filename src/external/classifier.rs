//! `ErrorClassifier`: maps a raw failure from a tool call or sandbox run
//! onto the five-kind taxonomy (spec.md §7). Concrete tools raise whatever
//! error shape they like; this is the seam that turns it into an
//! `EngineError` the rest of the engine can act on.

use crate::error::{EngineError, ErrorKind};

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &anyhow::Error) -> EngineError;
}

/// Classifies by matching on an HTTP-style status code embedded in the
/// error chain, falling back to `Internal` for anything unrecognized.
/// Good enough for tools that wrap HTTP clients (Gmail, Drive, billing);
/// tools with their own error taxonomy should bring their own classifier.
#[derive(Default)]
pub struct HttpStatusClassifier;

impl ErrorClassifier for HttpStatusClassifier {
    fn classify(&self, error: &anyhow::Error) -> EngineError {
        let message = error.to_string();
        let kind = if message.contains("401") {
            ErrorKind::Auth
        } else if message.contains("403") {
            ErrorKind::Permission
        } else if message.contains("402") {
            ErrorKind::PaymentRequired
        } else if message.contains("timeout")
            || message.contains("connection reset")
            || message.starts_with("5")
            || message.contains(" 5")
        {
            ErrorKind::Network
        } else {
            ErrorKind::Internal
        };
        EngineError::new(kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_status_code_substring() {
        let classifier = HttpStatusClassifier;
        assert_eq!(
            classifier.classify(&anyhow::anyhow!("401 unauthorized")).kind,
            ErrorKind::Auth
        );
        assert_eq!(
            classifier.classify(&anyhow::anyhow!("403 forbidden")).kind,
            ErrorKind::Permission
        );
        assert_eq!(
            classifier.classify(&anyhow::anyhow!("request timeout")).kind,
            ErrorKind::Network
        );
        assert_eq!(
            classifier.classify(&anyhow::anyhow!("unexpected nil pointer")).kind,
            ErrorKind::Internal
        );
    }
}
