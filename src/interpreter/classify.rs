//! Failure classification.
//!
//! Every step failure is categorised into one [`FailureKind`]. Typed
//! [`DriverError`] variants map directly; untyped backend messages are
//! matched against known patterns. Classification never guesses: a
//! message matching nothing lands in [`FailureKind::Unknown`].

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::driver::DriverError;

/// Failure categories carried on failed steps and in report histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ElementNotFound,
    ImageNotMatched,
    TextNotFound,
    AssertionFailed,
    AppCrash,
    AppNotRunning,
    SessionError,
    ConnectionError,
    NetworkError,
    PermissionDenied,
    ResourceExhausted,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ElementNotFound => "element_not_found",
            FailureKind::ImageNotMatched => "image_not_matched",
            FailureKind::TextNotFound => "text_not_found",
            FailureKind::AssertionFailed => "assertion_failed",
            FailureKind::AppCrash => "app_crash",
            FailureKind::AppNotRunning => "app_not_running",
            FailureKind::SessionError => "session_error",
            FailureKind::ConnectionError => "connection_error",
            FailureKind::NetworkError => "network_error",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::Unknown => "unknown",
        }
    }
}

/// Classifies a typed driver error.
pub fn classify(error: &DriverError) -> FailureKind {
    match error {
        DriverError::Timeout(_) => FailureKind::Timeout,
        DriverError::ElementNotFound(_) => FailureKind::ElementNotFound,
        DriverError::ImageNotMatched { .. } => FailureKind::ImageNotMatched,
        DriverError::TextNotFound(_) => FailureKind::TextNotFound,
        DriverError::AppCrash(_) => FailureKind::AppCrash,
        DriverError::AppNotRunning(_) => FailureKind::AppNotRunning,
        DriverError::Session(_) | DriverError::Refused(_) => FailureKind::SessionError,
        DriverError::Connection(_) => FailureKind::ConnectionError,
        DriverError::Network(_) => FailureKind::NetworkError,
        DriverError::PermissionDenied(_) => FailureKind::PermissionDenied,
        DriverError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
        DriverError::Other(message) => classify_message(message),
    }
}

/// Classifies a free-form backend message by pattern.
pub fn classify_message(message: &str) -> FailureKind {
    static PATTERNS: OnceLock<Vec<(Regex, FailureKind)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"(?i)\btime[d]? ?out\b|\bdeadline exceeded\b", FailureKind::Timeout),
            (
                r"(?i)no such element|element.{0,20}not found|could not locate",
                FailureKind::ElementNotFound,
            ),
            (r"(?i)template.{0,20}not matched|no match found", FailureKind::ImageNotMatched),
            (r"(?i)text.{0,20}not (found|present)", FailureKind::TextNotFound),
            (
                r"(?i)\bcrash(ed)?\b|fatal exception|\banr\b|application not responding",
                FailureKind::AppCrash,
            ),
            (
                r"(?i)(app|process|activity).{0,20}not running|process .{0,40}died",
                FailureKind::AppNotRunning,
            ),
            (
                r"(?i)connection (refused|reset|closed)|econnrefused|broken pipe|socket",
                FailureKind::ConnectionError,
            ),
            (
                r"(?i)\bnetwork\b|\bdns\b|host unreachable|no route to host",
                FailureKind::NetworkError,
            ),
            (
                r"(?i)permission denied|not permitted|unauthorized|securityexception",
                FailureKind::PermissionDenied,
            ),
            (
                r"(?i)out of (memory|space)|resource exhausted|too many open files|no space left",
                FailureKind::ResourceExhausted,
            ),
            (r"(?i)\bsession\b.{0,30}(invalid|expired|terminated|error)", FailureKind::SessionError),
        ]
        .into_iter()
        .map(|(pattern, kind)| (Regex::new(pattern).expect("static pattern"), kind))
        .collect()
    });

    for (pattern, kind) in patterns {
        if pattern.is_match(message) {
            return *kind;
        }
    }
    FailureKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_variants_map_directly() {
        assert_eq!(
            classify(&DriverError::Timeout("30s".into())),
            FailureKind::Timeout
        );
        assert_eq!(
            classify(&DriverError::ElementNotFound("btn".into())),
            FailureKind::ElementNotFound
        );
        assert_eq!(
            classify(&DriverError::ImageNotMatched { confidence: 0.4 }),
            FailureKind::ImageNotMatched
        );
        assert_eq!(
            classify(&DriverError::Refused("busy".into())),
            FailureKind::SessionError
        );
    }

    #[test]
    fn messages_match_known_patterns() {
        assert_eq!(
            classify_message("java.net.SocketException: Connection reset"),
            FailureKind::ConnectionError
        );
        assert_eq!(
            classify_message("FATAL EXCEPTION: main"),
            FailureKind::AppCrash
        );
        assert_eq!(
            classify_message("uiautomator: timed out waiting for idle"),
            FailureKind::Timeout
        );
        assert_eq!(
            classify_message("NoSuchElement: no such element with id login"),
            FailureKind::ElementNotFound
        );
        assert_eq!(
            classify_message("java.lang.SecurityException: denied"),
            FailureKind::PermissionDenied
        );
        assert_eq!(
            classify_message("No space left on device"),
            FailureKind::ResourceExhausted
        );
    }

    #[test]
    fn unmatched_message_is_unknown() {
        assert_eq!(classify_message("weird backend hiccup"), FailureKind::Unknown);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::ElementNotFound).unwrap();
        assert_eq!(json, "\"element_not_found\"");
    }
}
