use remote_swe_common::{ChatMessage, ContentBlock, MessageRecord, MessageType};
use tracing::debug;

pub const DEFAULT_HEAD_RATIO: f64 = 0.6;

pub fn total_tokens(history: &[MessageRecord]) -> i64 {
    history.iter().map(|r| r.token_count).sum()
}

/// Bound `history` to roughly `max_tokens` by dropping a contiguous middle.
///
/// Histories under budget are returned unchanged. Otherwise the first record
/// is always kept, the head grows while it fits in `head_ratio` of the budget
/// and the tail grows from the end while it fits in the remainder. A tool-use
/// at the end of the head or a tool-result at the start of the tail is dropped
/// so no pair is split by the cut.
pub fn middle_out_filter(
    history: &[MessageRecord],
    max_tokens: i64,
    head_ratio: f64,
) -> Vec<MessageRecord> {
    let total = total_tokens(history);
    if total < max_tokens {
        return history.to_vec();
    }

    let head_budget = max_tokens as f64 * head_ratio;
    let tail_budget = max_tokens as f64 * (1.0 - head_ratio);

    let mut head_end = 0usize;
    let mut running = 0i64;
    for (i, record) in history.iter().enumerate() {
        running += record.token_count;
        if i == 0 || running as f64 <= head_budget {
            head_end = i + 1;
        } else {
            break;
        }
    }

    let mut tail_start = history.len();
    running = 0;
    for (i, record) in history.iter().enumerate().rev() {
        if i < head_end {
            break;
        }
        running += record.token_count;
        if running as f64 <= tail_budget {
            tail_start = i;
        } else {
            break;
        }
    }

    if tail_start == head_end {
        return history.to_vec();
    }

    let mut head = &history[..head_end];
    let mut tail = &history[tail_start..];
    if head.len() > 1 && head.last().is_some_and(|r| r.message_type == MessageType::ToolUse) {
        head = &head[..head.len() - 1];
    }
    if tail
        .first()
        .is_some_and(|r| r.message_type == MessageType::ToolResult)
    {
        tail = &tail[1..];
    }

    debug!(
        "middle-out: kept {} head + {} tail of {} records ({} tokens, budget {})",
        head.len(),
        tail.len(),
        history.len(),
        total,
        max_tokens
    );
    head.iter().chain(tail.iter()).cloned().collect()
}

/// Tracks the prompt-cache boundaries across turns of one loop.
#[derive(Debug, Clone, Default)]
pub struct CachePointTracker {
    previous: Option<usize>,
}

impl CachePointTracker {
    /// Start from the length of the filtered history the loop begins with.
    pub fn new(initial_len: usize) -> Self {
        let previous = match initial_len {
            0 => None,
            n if n > 2 => Some(n - 3),
            n => Some(n - 1),
        };
        Self { previous }
    }

    pub fn previous(&self) -> Option<usize> {
        self.previous
    }

    /// Tag the previous boundary and the end of `messages`, then remember the
    /// end as the next turn's previous boundary.
    pub fn apply(&mut self, messages: &mut [ChatMessage]) {
        let Some(current) = messages.len().checked_sub(1) else {
            return;
        };
        if let Some(previous) = self.previous.filter(|&p| p < messages.len() && p != current) {
            tag(&mut messages[previous]);
        }
        tag(&mut messages[current]);
        self.previous = Some(current);
    }
}

fn tag(message: &mut ChatMessage) {
    if !message.content.last().is_some_and(ContentBlock::is_cache_point) {
        message.content.push(ContentBlock::CachePoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_swe_common::ChatRole;

    fn record(i: usize, message_type: MessageType, tokens: i64) -> MessageRecord {
        let role = match message_type {
            MessageType::UserMessage | MessageType::ToolResult => ChatRole::User,
            _ => ChatRole::Assistant,
        };
        MessageRecord {
            conversation_id: "c".into(),
            sequence_key: format!("{i:015}"),
            role,
            message_type,
            content: vec![ContentBlock::text(format!("m{i}"))],
            token_count: tokens,
            author_user_id: None,
        }
    }

    fn alternating_tool_history(n: usize, tokens: i64) -> Vec<MessageRecord> {
        (0..n)
            .map(|i| {
                let kind = if i == 0 {
                    MessageType::UserMessage
                } else if i % 2 == 1 {
                    MessageType::ToolUse
                } else {
                    MessageType::ToolResult
                };
                record(i, kind, tokens)
            })
            .collect()
    }

    fn assert_no_split_pairs(filtered: &[MessageRecord]) {
        for (i, r) in filtered.iter().enumerate() {
            if r.message_type == MessageType::ToolUse {
                let next = filtered.get(i + 1).expect("tool use must be followed");
                assert_eq!(next.message_type, MessageType::ToolResult);
                let a: u64 = r.sequence_key.parse().expect("key");
                let b: u64 = next.sequence_key.parse().expect("key");
                assert_eq!(b, a + 1, "tool use {a} paired with foreign result {b}");
            }
            if r.message_type == MessageType::ToolResult {
                assert!(i > 0);
                assert_eq!(filtered[i - 1].message_type, MessageType::ToolUse);
            }
        }
    }

    #[test]
    fn under_budget_is_identity() {
        let history = vec![
            record(0, MessageType::UserMessage, 10),
            record(1, MessageType::ToolUse, 10),
            record(2, MessageType::ToolResult, 10),
        ];
        assert_eq!(middle_out_filter(&history, 1000, DEFAULT_HEAD_RATIO), history);
    }

    #[test]
    fn hundred_equal_messages_keep_head_and_tail() {
        let history: Vec<MessageRecord> = (0..100)
            .map(|i| record(i, MessageType::UserMessage, 1000))
            .collect();
        let filtered = middle_out_filter(&history, 80_000, DEFAULT_HEAD_RATIO);

        assert_eq!(filtered[0], history[0]);
        assert!(total_tokens(&filtered) <= 80_000 + 1000);
        assert!(filtered.len() < history.len());

        let indices: Vec<usize> = filtered
            .iter()
            .map(|r| r.sequence_key.parse::<usize>().expect("key"))
            .collect();
        let gap = indices
            .windows(2)
            .position(|w| w[1] != w[0] + 1)
            .expect("a middle must be dropped");
        assert!(indices[..=gap].windows(2).all(|w| w[1] == w[0] + 1));
        assert!(indices[gap + 1..].windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(*indices.last().expect("tail"), 99);
        assert_eq!(indices[..=gap].len(), 48);
        assert_eq!(indices[gap + 1..].len(), 32);
    }

    #[test]
    fn never_splits_pairs_at_the_cut() {
        for n in [21usize, 37, 51, 101] {
            let history = alternating_tool_history(n, 1000);
            for max in [5_000i64, 7_000, 9_999, 12_345] {
                let filtered = middle_out_filter(&history, max, DEFAULT_HEAD_RATIO);
                assert_eq!(filtered[0], history[0], "first record must survive");
                assert_no_split_pairs(&filtered);
            }
        }
    }

    #[test]
    fn oversized_first_record_is_still_kept() {
        let history = vec![
            record(0, MessageType::UserMessage, 100_000),
            record(1, MessageType::ToolUse, 10),
            record(2, MessageType::ToolResult, 10),
            record(3, MessageType::Assistant, 10),
        ];
        let filtered = middle_out_filter(&history, 1000, DEFAULT_HEAD_RATIO);
        assert_eq!(filtered[0], history[0]);
        assert_no_split_pairs(&filtered);
    }

    #[test]
    fn negative_corrections_do_not_duplicate_records() {
        let history = vec![
            record(0, MessageType::UserMessage, 50),
            record(1, MessageType::UserMessage, -40),
            record(2, MessageType::UserMessage, 60),
        ];
        let filtered = middle_out_filter(&history, 70, DEFAULT_HEAD_RATIO);
        let mut keys: Vec<&str> = filtered.iter().map(|r| r.sequence_key.as_str()).collect();
        keys.dedup();
        assert_eq!(keys.len(), filtered.len());
    }

    fn messages(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| ChatMessage::user(vec![ContentBlock::text(format!("m{i}"))]))
            .collect()
    }

    fn tagged(messages: &[ChatMessage]) -> Vec<usize> {
        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.content.iter().any(ContentBlock::is_cache_point))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn first_turn_tags_len_minus_three_and_end() {
        let mut tracker = CachePointTracker::new(5);
        let mut turn = messages(5);
        tracker.apply(&mut turn);
        assert_eq!(tagged(&turn), vec![2, 4]);
    }

    #[test]
    fn later_turns_tag_previous_end_and_new_end() {
        let mut tracker = CachePointTracker::new(5);
        tracker.apply(&mut messages(5));

        let mut turn = messages(7);
        tracker.apply(&mut turn);
        assert_eq!(tagged(&turn), vec![4, 6]);
        assert_eq!(tracker.previous(), Some(6));
    }

    #[test]
    fn short_history_tags_once() {
        let mut tracker = CachePointTracker::new(1);
        let mut turn = messages(1);
        tracker.apply(&mut turn);
        assert_eq!(tagged(&turn), vec![0]);
        assert_eq!(turn[0].content.iter().filter(|b| b.is_cache_point()).count(), 1);
    }

    #[test]
    fn tagging_is_idempotent() {
        let mut tracker = CachePointTracker::new(3);
        let mut turn = messages(3);
        tracker.apply(&mut turn);
        tracker.apply(&mut turn);
        for message in &turn {
            assert!(message.content.iter().filter(|b| b.is_cache_point()).count() <= 1);
        }
    }
}
