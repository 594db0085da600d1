//! Failure classification
//!
//! An ordered rule list, evaluated top to bottom. The first matching rule
//! decides the kind; the last rule always matches and yields
//! [`ErrorKind::Unclassified`], so every failure gets a kind.

use crate::error::ErrorKind;
use crate::operation::OperationError;

type Predicate = Box<dyn Fn(&OperationError) -> bool + Send + Sync>;

struct Rule {
    name: &'static str,
    matches: Predicate,
    kind: ErrorKind,
}

/// Maps operation failures onto [`ErrorKind`].
pub struct ErrorClassifier {
    rules: Vec<Rule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn message_contains(err: &OperationError, needles: &[&str]) -> bool {
    match err {
        OperationError::Other(message) => {
            let message = message.to_lowercase();
            needles.iter().any(|needle| message.contains(needle))
        }
        _ => false,
    }
}

impl ErrorClassifier {
    /// The standard rule list: tagged variants first, then message matchers.
    pub fn new() -> Self {
        Self::empty()
            .rule("tagged-validation", ErrorKind::Validation, |e| {
                matches!(e, OperationError::Validation(_))
            })
            .rule("tagged-conflict", ErrorKind::DataConflict, |e| {
                matches!(e, OperationError::Conflict(_))
            })
            .rule("tagged-not-found", ErrorKind::NotFound, |e| {
                matches!(e, OperationError::NotFound(_))
            })
            .rule("tagged-exhausted", ErrorKind::ResourceExhausted, |e| {
                matches!(e, OperationError::ResourceExhausted(_))
            })
            .rule("message-validation", ErrorKind::Validation, |e| {
                message_contains(e, &["invalid", "validation", "malformed"])
            })
            // Ahead of conflict: "not found at version 3" is a missing row
            .rule("message-not-found", ErrorKind::NotFound, |e| {
                message_contains(e, &["not found", "no such"])
            })
            .rule("message-conflict", ErrorKind::DataConflict, |e| {
                message_contains(e, &["duplicate", "already exists", "version", "constraint"])
            })
            .rule("message-exhausted", ErrorKind::ResourceExhausted, |e| {
                message_contains(e, &["timeout", "timed out", "pool", "too many", "rate limit"])
            })
    }

    /// A classifier holding only the terminal rule.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule ahead of the terminal one.
    pub fn rule<F>(mut self, name: &'static str, kind: ErrorKind, matches: F) -> Self
    where
        F: Fn(&OperationError) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            name,
            matches: Box::new(matches),
            kind,
        });
        self
    }

    /// Kind and the name of the rule that decided it.
    pub fn explain(&self, err: &OperationError) -> (ErrorKind, &'static str) {
        self.rules
            .iter()
            .find(|rule| (rule.matches)(err))
            .map(|rule| (rule.kind, rule.name))
            .unwrap_or((ErrorKind::Unclassified, "default"))
    }

    pub fn classify(&self, err: &OperationError) -> ErrorKind {
        self.explain(err).0
    }
}
