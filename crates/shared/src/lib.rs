pub mod domain;
pub mod error;
pub mod protocol;

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::domain::{ConversationKey, GroupId, UserId};

    #[test]
    fn direct_and_group_keys_never_collide() {
        let direct = ConversationKey::Direct(UserId(42));
        let group = ConversationKey::Group(GroupId(42));
        assert_ne!(direct, group);
        assert_eq!(direct.to_string(), "42");
        assert_eq!(group.to_string(), "group:42");
    }

    #[test]
    fn conversation_key_round_trips_through_text_form() {
        assert_eq!(
            ConversationKey::from_str("group:7").expect("group key"),
            ConversationKey::Group(GroupId(7))
        );
        assert_eq!(
            ConversationKey::from_str(" 13 ").expect("direct key"),
            ConversationKey::Direct(UserId(13))
        );
        assert!(ConversationKey::from_str("group:").is_err());
        assert!(ConversationKey::from_str("alice").is_err());
    }

    #[test]
    fn conversation_key_serializes_as_string() {
        let raw = serde_json::to_string(&ConversationKey::Group(GroupId(2))).expect("json");
        assert_eq!(raw, "\"group:2\"");
        let parsed: ConversationKey = serde_json::from_str("\"9\"").expect("parse");
        assert_eq!(parsed, ConversationKey::Direct(UserId(9)));
    }
}
