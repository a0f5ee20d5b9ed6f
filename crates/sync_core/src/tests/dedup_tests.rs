use super::*;
use crate::test_support::{direct, message};

fn ids(log: &[LoggedMessage]) -> Vec<i64> {
    log.iter().map(|entry| entry.message.id.0).collect()
}

#[test]
fn admitting_the_same_message_twice_keeps_one_copy() {
    let mut dedup = MessageDeduplicator::new();
    let mut log = Vec::new();
    let m = message(1, direct(42), 0);

    assert!(dedup.merge(m.clone(), &mut log));
    assert!(!dedup.merge(m.clone(), &mut log));
    assert_eq!(ids(&log), vec![1]);
    assert_eq!(dedup.admit(&m, &log), Admission::Duplicate { position: 0 });
}

#[test]
fn out_of_order_arrivals_are_sorted_by_sent_at() {
    let mut dedup = MessageDeduplicator::new();
    let mut log = Vec::new();
    for (id, at) in [(3, 30), (1, 10), (4, 40), (2, 20)] {
        dedup.merge(message(id, direct(1), at), &mut log);
    }
    assert_eq!(ids(&log), vec![1, 2, 3, 4]);
}

#[test]
fn equal_timestamps_keep_arrival_order() {
    let mut dedup = MessageDeduplicator::new();
    let mut log = Vec::new();
    dedup.merge(message(9, direct(1), 5), &mut log);
    dedup.merge(message(2, direct(1), 5), &mut log);
    dedup.merge(message(5, direct(1), 5), &mut log);
    assert_eq!(ids(&log), vec![9, 2, 5]);
    assert!(log.windows(2).all(|w| w[0].arrival_seq < w[1].arrival_seq));
}

#[test]
fn live_push_before_history_page_is_not_duplicated() {
    let mut dedup = MessageDeduplicator::new();
    let mut log = Vec::new();

    // Live push lands first.
    dedup.merge(message(7, direct(3), 70), &mut log);
    // The page requested earlier includes it as well.
    let page = vec![
        message(5, direct(3), 50),
        message(6, direct(3), 60),
        message(7, direct(3), 70),
    ];
    let admitted = page
        .into_iter()
        .filter(|m| dedup.merge(m.clone(), &mut log))
        .count();

    assert_eq!(admitted, 2);
    assert_eq!(ids(&log), vec![5, 6, 7]);
}

#[test]
fn interleaved_pages_and_pushes_stay_sorted_without_duplicates() {
    let mut dedup = MessageDeduplicator::new();
    let mut log = Vec::new();
    let newest_page: Vec<_> = (11..=20).map(|id| message(id, direct(8), id * 10)).collect();
    let older_page: Vec<_> = (1..=10).map(|id| message(id, direct(8), id * 10)).collect();

    for m in newest_page.iter().take(5) {
        dedup.merge(m.clone(), &mut log);
    }
    dedup.merge(message(21, direct(8), 210), &mut log);
    dedup.merge(message(15, direct(8), 150), &mut log);
    for m in newest_page.iter().skip(3) {
        dedup.merge(m.clone(), &mut log);
    }
    for m in older_page {
        dedup.merge(m, &mut log);
    }
    dedup.merge(message(21, direct(8), 210), &mut log);

    assert_eq!(ids(&log), (1..=21).collect::<Vec<_>>());
    assert!(log.windows(2).all(|w| {
        (w[0].message.sent_at, w[0].arrival_seq) <= (w[1].message.sent_at, w[1].arrival_seq)
    }));
}
