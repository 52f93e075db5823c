//! Read receipts and the local user's unread counter.

use std::collections::HashSet;

use murmur_shared::protocol::MessageRecord;
use murmur_shared::types::{ChatId, MessageId, UserId};
use murmur_store::{WriteBatch, WriteOp};

/// Turns live windows into "mark seen / reset unread" batches without
/// repeating work across snapshots.
#[derive(Debug, Clone)]
pub struct ReadTracker {
    me: UserId,
    chat_id: ChatId,
    marked: HashSet<MessageId>,
    reset_in_flight: bool,
}

impl ReadTracker {
    pub fn new(me: UserId, chat_id: ChatId) -> Self {
        Self {
            me,
            chat_id,
            marked: HashSet::new(),
            reset_in_flight: false,
        }
    }

    /// Writes needed for this window. Empty when there is nothing to do.
    ///
    /// `receipts_enabled` is false when the local user opted out of read
    /// receipts: incoming messages stay unseen for the sender, but the local
    /// counter is still cleared.
    pub fn plan(
        &mut self,
        window: &[MessageRecord],
        my_unread: u64,
        receipts_enabled: bool,
    ) -> WriteBatch {
        let mut batch = WriteBatch::new();

        if receipts_enabled {
            for message in window {
                if message.sender_id == self.me
                    || message.seen
                    || self.marked.contains(&message.id)
                {
                    continue;
                }
                self.marked.insert(message.id.clone());
                batch.push(WriteOp::MarkSeen {
                    message_id: message.id.clone(),
                });
            }
        }

        if my_unread == 0 {
            self.reset_in_flight = false;
        } else if !self.reset_in_flight {
            self.reset_in_flight = true;
            batch.push(WriteOp::ResetUnread {
                chat_id: self.chat_id.clone(),
                uid: self.me.clone(),
            });
        }

        batch
    }

    /// Forget a batch that failed to commit so the next snapshot retries it.
    pub fn rollback(&mut self, batch: &WriteBatch) {
        for op in batch.ops() {
            match op {
                WriteOp::MarkSeen { message_id } => {
                    self.marked.remove(message_id);
                }
                WriteOp::ResetUnread { .. } => self.reset_in_flight = false,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use murmur_shared::protocol::{MessageBody, MessageDraft};

    use super::*;

    fn incoming(id: &str, from: &str, seen: bool) -> MessageRecord {
        let mut record = MessageRecord::from_draft(
            MessageId::from(id),
            Utc::now(),
            MessageDraft {
                chat_id: ChatId::from("c"),
                sender_id: UserId::from(from),
                body: MessageBody::Text("x".into()),
            },
        );
        record.seen = seen;
        record
    }

    fn tracker() -> ReadTracker {
        ReadTracker::new(UserId::from("me"), ChatId::from("c"))
    }

    #[test]
    fn marks_only_unseen_incoming_and_resets_once() {
        let mut tracker = tracker();
        let window = vec![
            incoming("1", "peer", false),
            incoming("2", "me", false),
            incoming("3", "peer", true),
        ];

        let batch = tracker.plan(&window, 2, true);
        assert_eq!(
            batch.ops(),
            &[
                WriteOp::MarkSeen {
                    message_id: MessageId::from("1")
                },
                WriteOp::ResetUnread {
                    chat_id: ChatId::from("c"),
                    uid: UserId::from("me")
                },
            ]
        );

        // Same snapshot delivered again before the writes land.
        assert!(tracker.plan(&window, 2, true).is_empty());
    }

    #[test]
    fn reset_rearms_after_counter_reaches_zero() {
        let mut tracker = tracker();
        assert_eq!(tracker.plan(&[], 1, true).len(), 1);
        assert!(tracker.plan(&[], 0, true).is_empty());
        assert_eq!(tracker.plan(&[], 1, true).len(), 1);
    }

    #[test]
    fn receipts_disabled_still_clears_counter() {
        let mut tracker = tracker();
        let batch = tracker.plan(&[incoming("1", "peer", false)], 3, false);
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch.ops()[0], WriteOp::ResetUnread { .. }));
    }

    #[test]
    fn rollback_allows_retry() {
        let mut tracker = tracker();
        let window = vec![incoming("1", "peer", false)];
        let batch = tracker.plan(&window, 1, true);
        tracker.rollback(&batch);
        assert_eq!(tracker.plan(&window, 1, true), batch);
    }
}
