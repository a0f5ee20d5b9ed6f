use std::collections::VecDeque;

use shared::domain::{Notification, NotificationId};

#[derive(Debug)]
pub struct NotificationFeed {
    capacity: usize,
    recent: VecDeque<Notification>,
    unread: u64,
}

impl NotificationFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: VecDeque::with_capacity(capacity.max(1)),
            unread: 0,
        }
    }

    /// Redeliveries of a notification still in the ring are ignored.
    pub fn push(&mut self, notification: Notification) -> bool {
        if self.recent.iter().any(|n| n.id == notification.id) {
            return false;
        }
        if !notification.is_read {
            self.unread = self.unread.saturating_add(1);
        }
        self.recent.push_front(notification);
        self.recent.truncate(self.capacity);
        true
    }

    /// Only entries still in the ring can be marked individually.
    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        let Some(notification) = self.recent.iter_mut().find(|n| n.id == id) else {
            return false;
        };
        if notification.is_read {
            return false;
        }
        notification.is_read = true;
        self.unread = self.unread.saturating_sub(1);
        true
    }

    pub fn mark_all_read(&mut self) {
        self.unread = 0;
        for notification in &mut self.recent {
            notification.is_read = true;
        }
    }

    pub fn unread(&self) -> u64 {
        self.unread
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<Notification> {
        self.recent.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared::domain::{NotificationKind, UserId};

    fn notification(id: i64) -> Notification {
        Notification {
            id: NotificationId(id),
            kind: NotificationKind::Like,
            actor_id: UserId(id + 100),
            actor_name: Some(format!("user{id}")),
            text: "liked your post".into(),
            created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
            is_read: false,
        }
    }

    #[test]
    fn ring_evicts_oldest_but_count_is_unbounded() {
        let mut feed = NotificationFeed::new(3);
        for id in 1..=5 {
            assert!(feed.push(notification(id)));
        }
        let ids: Vec<i64> = feed.recent().iter().map(|n| n.id.0).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(feed.unread(), 5);
    }

    #[test]
    fn redelivery_does_not_double_count() {
        let mut feed = NotificationFeed::new(3);
        feed.push(notification(1));
        assert!(!feed.push(notification(1)));
        assert_eq!(feed.unread(), 1);
    }

    #[test]
    fn mark_read_clamps_and_mark_all_resets() {
        let mut feed = NotificationFeed::new(3);
        feed.push(notification(1));
        feed.push(notification(2));
        assert!(feed.mark_read(NotificationId(1)));
        assert!(!feed.mark_read(NotificationId(1)));
        assert!(!feed.mark_read(NotificationId(99)));
        assert_eq!(feed.unread(), 1);

        feed.push(Notification {
            is_read: true,
            ..notification(3)
        });
        assert_eq!(feed.unread(), 1);

        feed.mark_all_read();
        assert_eq!(feed.unread(), 0);
        assert!(feed.recent().iter().all(|n| n.is_read));
    }
}
