use shared::domain::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub message: Message,
    pub arrival_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept { position: usize, arrival_seq: u64 },
    Duplicate { position: usize },
}

#[derive(Debug, Default)]
pub struct MessageDeduplicator {
    next_arrival: u64,
}

impl MessageDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `candidate` against the log as it is now, not as it was when
    /// the candidate's page was requested.
    pub fn admit(&mut self, candidate: &Message, log: &[LoggedMessage]) -> Admission {
        if let Some(position) = log
            .iter()
            .position(|entry| entry.message.id == candidate.id)
        {
            return Admission::Duplicate { position };
        }

        let arrival_seq = self.next_arrival;
        self.next_arrival += 1;
        let key = (candidate.sent_at, arrival_seq);
        let position =
            log.partition_point(|entry| (entry.message.sent_at, entry.arrival_seq) <= key);
        Admission::Accept {
            position,
            arrival_seq,
        }
    }

    /// Admits and inserts in one step. Returns `false` for duplicates.
    pub fn merge(&mut self, candidate: Message, log: &mut Vec<LoggedMessage>) -> bool {
        match self.admit(&candidate, log) {
            Admission::Accept {
                position,
                arrival_seq,
            } => {
                log.insert(
                    position,
                    LoggedMessage {
                        message: candidate,
                        arrival_seq,
                    },
                );
                true
            }
            Admission::Duplicate { .. } => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
