use super::*;
use shared::domain::GroupId;

const WINDOW: Duration = Duration::from_secs(3);

fn key() -> ConversationKey {
    ConversationKey::Group(GroupId(1))
}

fn user_ids(signals: &[TypingSignal]) -> Vec<i64> {
    signals.iter().map(|s| s.user_id.0).collect()
}

#[test]
fn typer_expires_without_refresh() {
    let mut typing = TypingAggregator::new(WINDOW, UserId(1));
    let start = Instant::now();
    assert!(typing.set_typing(key(), UserId(7), "gus", true, start));

    assert_eq!(user_ids(&typing.current_typers(key(), start + Duration::from_secs(1))), vec![7]);
    assert!(typing
        .current_typers(key(), start + WINDOW + Duration::from_millis(1))
        .is_empty());
}

#[test]
fn refresh_extends_liveness_window() {
    let mut typing = TypingAggregator::new(WINDOW, UserId(1));
    let start = Instant::now();
    typing.set_typing(key(), UserId(7), "gus", true, start);
    assert!(!typing.set_typing(key(), UserId(7), "gus", true, start + Duration::from_secs(2)));

    let later = start + Duration::from_secs(4);
    assert_eq!(user_ids(&typing.current_typers(key(), later)), vec![7]);
}

#[test]
fn explicit_stop_removes_immediately() {
    let mut typing = TypingAggregator::new(WINDOW, UserId(1));
    let now = Instant::now();
    typing.set_typing(key(), UserId(7), "gus", true, now);
    assert!(typing.set_typing(key(), UserId(7), "gus", false, now));
    assert!(typing.current_typers(key(), now).is_empty());
    assert!(!typing.set_typing(key(), UserId(7), "gus", false, now));
}

#[test]
fn local_user_is_never_reported() {
    let mut typing = TypingAggregator::new(WINDOW, UserId(1));
    let now = Instant::now();
    assert!(!typing.set_typing(key(), UserId(1), "me", true, now));
    typing.set_typing(key(), UserId(2), "bea", true, now);
    assert_eq!(user_ids(&typing.current_typers(key(), now)), vec![2]);
}

#[test]
fn typers_are_ordered_by_name() {
    let mut typing = TypingAggregator::new(WINDOW, UserId(1));
    let now = Instant::now();
    typing.set_typing(key(), UserId(9), "zoe", true, now);
    typing.set_typing(key(), UserId(3), "amir", true, now);
    assert_eq!(user_ids(&typing.current_typers(key(), now)), vec![3, 9]);
}

#[test]
fn sweep_reports_conversations_that_lost_typers() {
    let mut typing = TypingAggregator::new(WINDOW, UserId(1));
    let start = Instant::now();
    let direct = ConversationKey::Direct(UserId(4));
    typing.set_typing(key(), UserId(7), "gus", true, start);
    typing.set_typing(direct, UserId(4), "dee", true, start + Duration::from_secs(2));

    let changed = typing.sweep(start + Duration::from_secs(4));
    assert_eq!(changed, vec![key()]);
    assert_eq!(
        user_ids(&typing.current_typers(direct, start + Duration::from_secs(4))),
        vec![4]
    );
}
