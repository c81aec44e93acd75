use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const ORDER_PREFIX: &str = "order:";
const USER_PREFIX: &str = "user:";

/// A fan-out target on the relay.
///
/// Rooms travel on the wire as prefixed strings (`order:<id>`, `user:<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoomId {
    Order(String),
    User(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    #[error("room id must start with 'order:' or 'user:', got '{0}'")]
    UnknownPrefix(String),
    #[error("room id '{0}' has an empty identifier")]
    EmptyIdentifier(String),
}

impl RoomId {
    pub fn order(order_id: impl Into<String>) -> Self {
        Self::Order(order_id.into())
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User(user_id.into())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Order(id) => write!(f, "{ORDER_PREFIX}{id}"),
            Self::User(id) => write!(f, "{USER_PREFIX}{id}"),
        }
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, build): (&str, fn(String) -> RoomId) =
            if let Some(id) = s.strip_prefix(ORDER_PREFIX) {
                (id, RoomId::Order)
            } else if let Some(id) = s.strip_prefix(USER_PREFIX) {
                (id, RoomId::User)
            } else {
                return Err(RoomIdError::UnknownPrefix(s.to_string()));
            };

        let id = id.trim();
        if id.is_empty() {
            return Err(RoomIdError::EmptyIdentifier(s.to_string()));
        }
        Ok(build(id.to_string()))
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> Self {
        room.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_rooms() {
        assert_eq!("order:123".parse::<RoomId>(), Ok(RoomId::order("123")));
        assert_eq!("user:u-1".parse::<RoomId>(), Ok(RoomId::user("u-1")));
    }

    #[test]
    fn rejects_unknown_prefix_and_empty_id() {
        assert!(matches!(
            "restaurant:9".parse::<RoomId>(),
            Err(RoomIdError::UnknownPrefix(_))
        ));
        assert!(matches!(
            "order:  ".parse::<RoomId>(),
            Err(RoomIdError::EmptyIdentifier(_))
        ));
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&RoomId::order("abc")).unwrap();
        assert_eq!(json, "\"order:abc\"");
        let back: RoomId = serde_json::from_str("\"user:xyz\"").unwrap();
        assert_eq!(back, RoomId::user("xyz"));
        assert!(serde_json::from_str::<RoomId>("\"lobby\"").is_err());
    }
}
