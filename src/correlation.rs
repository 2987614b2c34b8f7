use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Size in bytes of a [`CorrelationId`] on the wire.
pub const CORRELATION_ID_LEN: usize = 16;

/// Identifier linking one request to its reply.
///
/// The display form is the canonical UUID string and doubles as the name of the ephemeral reply
/// topic for the request, as well as the `correlation_id` field on every log line emitted while
/// the request is serviced. The wire form is the 16 raw bytes.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; CORRELATION_ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_parses_back() {
        let id = CorrelationId::generate();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_wire_bytes_match_uuid() {
        let id = CorrelationId::generate();
        let restored = CorrelationId::from_bytes(*id.as_bytes());
        assert_eq!(restored, id);
        assert_eq!(id.as_bytes(), id.as_uuid().as_bytes());
    }

    #[test]
    fn test_invalid_string_rejected() {
        assert!("not-a-uuid".parse::<CorrelationId>().is_err());
    }
}
