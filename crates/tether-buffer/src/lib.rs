//! `tether-buffer` — asynchronous pairing of `tool_use` and `tool_result`
//! messages by tool-use id.
//!
//! The model's side of a tool call (the assistant message holding the
//! `tool_use` block) and the runner's side (the user message holding the
//! `tool_result`) arrive independently, possibly minutes apart and in either
//! order. The buffer holds whichever side arrives first and emits a
//! [`ToolPair`] the moment both are present. Buffered uses expire after a
//! configurable timeout; buffered results never expire on their own.
//!
//! Both maps live under one mutex. Every public operation
//! acquires-modifies-releases; pairs are handed back to the caller, so no
//! callback ever runs under the lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use tether_core::Message;

/// Default expiry for a `tool_use` waiting on its result.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An id-matched `tool_use`/`tool_result` message pair, ready to send.
#[derive(Debug, Clone)]
pub struct ToolPair {
    pub tool_use_id: String,
    /// Assistant message containing the `tool_use` block.
    pub tool_use: Message,
    /// User message containing the matching `tool_result` block.
    pub tool_result: Message,
}

/// A buffered `tool_use` that outlived the pair timeout without a result.
#[derive(Debug, Clone)]
pub struct ExpiredUse {
    pub tool_use_id: String,
    pub tool_names: Vec<String>,
    pub buffered_at: Instant,
}

/// Result of a [`ToolPairBuffer::flush`] call.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Matched pairs in ascending enqueue-timestamp order.
    pub pairs: Vec<ToolPair>,
    pub expired: Vec<ExpiredUse>,
}

struct PendingUse {
    message: Message,
    buffered_at: Instant,
}

#[derive(Default)]
struct Inner {
    pending_use: HashMap<String, PendingUse>,
    pending_result: HashMap<String, Message>,
}

/// Thread-safe tool-pair buffer. See the crate docs for the pairing model.
pub struct ToolPairBuffer {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl Default for ToolPairBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_PAIR_TIMEOUT)
    }
}

impl ToolPairBuffer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeout,
        }
    }

    /// Buffer the assistant side of a tool call. Returns the ready pair if
    /// the result was already waiting; both entries are consumed.
    pub fn buffer_use(&self, tool_use_id: &str, message: Message) -> Option<ToolPair> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(result) = inner.pending_result.remove(tool_use_id) {
            debug!(tool_use_id, "tool result was waiting; pair ready");
            return Some(ToolPair {
                tool_use_id: tool_use_id.to_string(),
                tool_use: message,
                tool_result: result,
            });
        }
        inner.pending_use.insert(
            tool_use_id.to_string(),
            PendingUse {
                message,
                buffered_at: Instant::now(),
            },
        );
        None
    }

    /// Buffer the runner side of a tool call. Returns the ready pair if the
    /// use was already waiting; both entries are consumed.
    pub fn buffer_result(&self, tool_use_id: &str, message: Message) -> Option<ToolPair> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.pending_use.remove(tool_use_id) {
            debug!(tool_use_id, "tool use was waiting; pair ready");
            return Some(ToolPair {
                tool_use_id: tool_use_id.to_string(),
                tool_use: pending.message,
                tool_result: message,
            });
        }
        inner.pending_result.insert(tool_use_id.to_string(), message);
        None
    }

    /// Drain every id-matched pair (ascending enqueue-timestamp order) and
    /// expire `tool_use` entries older than the pair timeout. Results
    /// without a matching use are kept until one arrives.
    pub fn flush(&self) -> FlushOutcome {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut outcome = FlushOutcome::default();

        let mut matched: Vec<String> = inner
            .pending_use
            .keys()
            .filter(|id| inner.pending_result.contains_key(*id))
            .cloned()
            .collect();
        matched.sort_by_key(|id| inner.pending_use[id].buffered_at);

        for id in matched {
            let (Some(pending), Some(result)) = (
                inner.pending_use.remove(&id),
                inner.pending_result.remove(&id),
            ) else {
                continue;
            };
            outcome.pairs.push(ToolPair {
                tool_use_id: id,
                tool_use: pending.message,
                tool_result: result,
            });
        }

        let expired_ids: Vec<String> = inner
            .pending_use
            .iter()
            .filter(|(_, p)| now.duration_since(p.buffered_at) > self.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired_ids {
            let Some(pending) = inner.pending_use.remove(&id) else {
                continue;
            };
            debug!(tool_use_id = %id, "buffered tool use expired");
            outcome.expired.push(ExpiredUse {
                tool_use_id: id,
                tool_names: pending
                    .message
                    .content
                    .iter()
                    .filter_map(|b| b.tool_name())
                    .map(String::from)
                    .collect(),
                buffered_at: pending.buffered_at,
            });
        }

        outcome
    }

    /// Snapshot of the tool names still awaiting results, in enqueue order.
    pub fn pending_tool_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<&PendingUse> = inner.pending_use.values().collect();
        entries.sort_by_key(|p| p.buffered_at);
        entries
            .iter()
            .flat_map(|p| p.message.content.iter().filter_map(|b| b.tool_name()))
            .map(String::from)
            .collect()
    }

    pub fn pending_use_count(&self) -> usize {
        self.inner.lock().unwrap().pending_use.len()
    }

    pub fn pending_result_count(&self) -> usize {
        self.inner.lock().unwrap().pending_result.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ContentBlock, Message, Role};

    fn use_msg(id: &str, name: &str) -> Message {
        Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("working on it"),
                ContentBlock::tool_use(id, name, serde_json::json!({})),
            ],
        )
    }

    fn result_msg(id: &str) -> Message {
        Message::new(
            Role::User,
            vec![ContentBlock::tool_result(
                id,
                vec![ContentBlock::text("done")],
                false,
            )],
        )
    }

    #[test]
    fn use_then_result_pairs_on_result() {
        let buffer = ToolPairBuffer::default();
        assert!(buffer.buffer_use("t1", use_msg("t1", "demo")).is_none());
        let pair = buffer.buffer_result("t1", result_msg("t1")).unwrap();
        assert_eq!(pair.tool_use_id, "t1");
        assert_eq!(buffer.pending_use_count(), 0);
        assert_eq!(buffer.pending_result_count(), 0);
    }

    #[test]
    fn result_then_use_pairs_on_use() {
        let buffer = ToolPairBuffer::default();
        assert!(buffer.buffer_result("t1", result_msg("t1")).is_none());
        let pair = buffer.buffer_use("t1", use_msg("t1", "demo")).unwrap();
        assert_eq!(pair.tool_use_id, "t1");
        assert_eq!(buffer.pending_use_count(), 0);
        assert_eq!(buffer.pending_result_count(), 0);
    }

    #[test]
    fn exactly_one_pair_per_id() {
        let buffer = ToolPairBuffer::default();
        buffer.buffer_use("t1", use_msg("t1", "demo"));
        assert!(buffer.buffer_result("t1", result_msg("t1")).is_some());
        let outcome = buffer.flush();
        assert!(outcome.pairs.is_empty());
        assert!(outcome.expired.is_empty());
    }

    #[test]
    fn flush_emits_pairs_in_enqueue_order() {
        let buffer = ToolPairBuffer::default();
        buffer.buffer_use("a", use_msg("a", "first"));
        std::thread::sleep(Duration::from_millis(5));
        buffer.buffer_use("b", use_msg("b", "second"));
        // Deposit results directly so both sides coexist; the public path
        // pairs eagerly and would never leave matched entries for flush.
        {
            let mut inner = buffer.inner.lock().unwrap();
            inner.pending_result.insert("b".into(), result_msg("b"));
            inner.pending_result.insert("a".into(), result_msg("a"));
        }

        let outcome = buffer.flush();
        let ids: Vec<_> = outcome.pairs.iter().map(|p| p.tool_use_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn stale_uses_expire_results_do_not() {
        let buffer = ToolPairBuffer::new(Duration::from_millis(10));
        buffer.buffer_use("t1", use_msg("t1", "demo"));
        buffer.buffer_result("t2", result_msg("t2"));
        std::thread::sleep(Duration::from_millis(25));

        let outcome = buffer.flush();
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].tool_use_id, "t1");
        assert_eq!(outcome.expired[0].tool_names, vec!["demo"]);
        assert_eq!(buffer.pending_use_count(), 0);
        // The orphan result stays until a matching use arrives.
        assert_eq!(buffer.pending_result_count(), 1);
    }

    #[test]
    fn pending_tool_names_in_enqueue_order() {
        let buffer = ToolPairBuffer::default();
        buffer.buffer_use("a", use_msg("a", "alpha"));
        std::thread::sleep(Duration::from_millis(5));
        buffer.buffer_use("b", use_msg("b", "beta"));
        assert_eq!(buffer.pending_tool_names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn concurrent_callers_produce_exactly_one_pair_each() {
        use std::sync::Arc;

        let buffer = Arc::new(ToolPairBuffer::default());
        let mut handles = Vec::new();
        let pair_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for i in 0..50 {
            let id = format!("t{i}");
            for side in 0..2 {
                let buffer = buffer.clone();
                let id = id.clone();
                let pair_count = pair_count.clone();
                handles.push(std::thread::spawn(move || {
                    let paired = if side == 0 {
                        buffer.buffer_use(&id, use_msg(&id, "demo")).is_some()
                    } else {
                        buffer.buffer_result(&id, result_msg(&id)).is_some()
                    };
                    if paired {
                        pair_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                }));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let flushed = buffer.flush().pairs.len();
        let direct = pair_count.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(direct + flushed, 50);
        assert_eq!(buffer.pending_use_count(), 0);
        assert_eq!(buffer.pending_result_count(), 0);
    }
}
