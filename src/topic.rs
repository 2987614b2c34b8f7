use std::fmt::Display;
use std::sync::Arc;

use crate::correlation::CorrelationId;

/// Fixed topic names, one per logical operation plus the telemetry broadcast topic.
pub mod topics {
    pub const LOGIN_SIGNUP: &str = "login.signup";
    pub const LOGIN_CHECK_ACTIVATE: &str = "login.check-activate";
    pub const LOGIN_ACTIVATE: &str = "login.activate";
    pub const LOGIN_SIGNIN: &str = "login.signin";
    pub const LOGIN_ME: &str = "login.me";
    pub const LOGIN_LOGOUT: &str = "login.logout";

    /// Broadcast topic carrying system metrics snapshots.
    pub const METRICS: &str = "metrics";

    /// Broadcast topic relayed to streaming gateway clients.
    pub const STREAMING: &str = "streaming";
}

/// A named channel on the broker.
///
/// Depending on how it is used a topic is either a work queue (requests, each delivered to one
/// handler) or a pub/sub destination (replies and telemetry, delivered to every subscriber).
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Topic(Arc<str>);

impl Topic {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The ephemeral reply topic for a single in-flight request.
    pub fn reply(correlation_id: &CorrelationId) -> Self {
        Self(correlation_id.to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<&Topic> for Topic {
    fn from(topic: &Topic) -> Self {
        topic.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_topic_is_correlation_string() {
        let id = CorrelationId::generate();
        assert_eq!(Topic::reply(&id).as_str(), id.to_string());
    }

    #[test]
    fn test_conversions_agree() {
        let a = Topic::from(topics::LOGIN_SIGNIN);
        let b = Topic::from(topics::LOGIN_SIGNIN.to_string());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "login.signin");
    }
}
