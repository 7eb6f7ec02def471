//! Assertions over conversation state

use crate::core_model::{Message, MessageId};
use std::collections::HashSet;

/// Panic unless the sequence is strictly increasing by `(sent_at, id)`
pub fn assert_strictly_ordered(messages: &[Message]) {
    for (i, pair) in messages.windows(2).enumerate() {
        if pair[0].order_key() >= pair[1].order_key() {
            panic!(
                "Messages out of order at {}: {:?} then {:?}",
                i,
                pair[0].order_key(),
                pair[1].order_key()
            );
        }
    }
}

/// Panic if any id occurs twice
pub fn assert_unique_ids(messages: &[Message]) {
    let mut seen = HashSet::new();
    for m in messages {
        if !seen.insert(&m.id) {
            panic!("Duplicate message id {}", m.id);
        }
    }
}

/// Ids of the sequence, in order
pub fn ids(messages: &[Message]) -> Vec<MessageId> {
    messages.iter().map(|m| m.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::message;

    #[test]
    fn test_ordered_sequence_passes() {
        let seq = vec![message("a", "alice", "bob", 1), message("b", "bob", "alice", 1), message("a", "alice", "bob", 2)];
        assert_strictly_ordered(&seq);
        assert_eq!(ids(&seq), vec![MessageId::from("a"), MessageId::from("b"), MessageId::from("a")]);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_unordered_sequence_panics() {
        assert_strictly_ordered(&[message("a", "alice", "bob", 2), message("b", "alice", "bob", 1)]);
    }

    #[test]
    #[should_panic(expected = "Duplicate message id")]
    fn test_duplicate_ids_panic() {
        assert_unique_ids(&[message("a", "alice", "bob", 1), message("a", "alice", "bob", 2)]);
    }
}
