//! `tether-history` — deterministic repair of persisted conversation
//! history.
//!
//! # Overview
//!
//! Histories loaded from disk accumulate damage: duplicated text, messages
//! emptied by truncation, placeholder wedges from earlier repairs, tool
//! calls whose results never landed. [`normalize`] runs a staged repair
//! pipeline until it reaches a fixed point, so the result always satisfies:
//!
//! - first message is user, last is assistant;
//! - roles strictly alternate;
//! - no two adjacent placeholder messages;
//! - every `tool_use` is answered by a matching `tool_result` in the
//!   following user message, and no `tool_result` lacks its `tool_use`;
//! - `normalize(normalize(h)) == normalize(h)`.
//!
//! The pipeline never fails. Input beyond repair yields an empty history
//! and a warning.

use tracing::{debug, warn};

use tether_core::{
    ContentBlock, Message, Role, PLACEHOLDER_USER_TOOL_RESULT,
};

/// Upper bound on repair sweeps before declaring the input unstable. Real
/// histories stabilize in one or two.
const MAX_PASSES: usize = 4;

/// Repair a loaded history. See the crate docs for the guarantees.
pub fn normalize(history: Vec<Message>) -> Vec<Message> {
    let (repaired, stable) = stabilize(history);
    if repaired.is_empty() {
        return repaired;
    }
    if stable && verify(&repaired) {
        return repaired;
    }

    warn!("history did not stabilize cleanly; salvaging alternating suffix");
    let (rescued, stable) = stabilize(salvage(repaired));
    if rescued.is_empty() || (stable && verify(&rescued)) {
        rescued
    } else {
        warn!("history beyond repair; discarding");
        Vec::new()
    }
}

/// Run the stage pipeline until output equals input (or the pass budget is
/// exhausted). Returns the last output and whether a fixed point was hit.
fn stabilize(history: Vec<Message>) -> (Vec<Message>, bool) {
    let mut current = history;
    for _ in 0..MAX_PASSES {
        let next = pass(current.clone());
        if next == current {
            return (current, true);
        }
        current = next;
    }
    (current, false)
}

fn pass(history: Vec<Message>) -> Vec<Message> {
    let history = clean(history);
    let history = collapse_repeats(history);
    let history = enforce_alternation(history);
    let history = remove_sandwiches(history);
    let history = collapse_runs(history);
    let history = strip_placeholder_runs(history);
    let history = repair_tool_pairing(history);
    bookend(history)
}

/// Stage 1: drop empty text blocks, deduplicate identical text bodies
/// within a message (first occurrence wins), drop messages left with no
/// content. System-role rows have no place in a chat history and are
/// discarded here.
fn clean(history: Vec<Message>) -> Vec<Message> {
    history
        .into_iter()
        .filter(|m| {
            if m.role == Role::System {
                debug!("dropping system-role message from history");
                return false;
            }
            true
        })
        .filter_map(|mut msg| {
            let mut seen_texts: Vec<String> = Vec::new();
            let mut kept: Vec<ContentBlock> = Vec::new();
            for block in msg.content {
                if let Some(text) = block.as_text() {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if seen_texts.iter().any(|t| t == text) {
                        continue;
                    }
                    seen_texts.push(text.to_string());
                }
                kept.push(block);
            }
            if kept.is_empty() {
                return None;
            }
            msg.content = kept;
            msg.ensure_leading_text();
            Some(msg)
        })
        .collect()
}

/// Stage 2: a placeholder wedged between two copies of the same message is
/// an artifact of an earlier repair. Keep the newer copy only.
fn collapse_repeats(history: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < history.len() {
        if i + 2 < history.len()
            && history[i + 1].is_placeholder()
            && !history[i].is_placeholder()
            && history[i].role == history[i + 2].role
            && history[i].content == history[i + 2].content
        {
            // Skip the older copy and the wedge; the newer copy is picked up
            // on the next iteration.
            i += 2;
            continue;
        }
        out.push(history[i].clone());
        i += 1;
    }
    out
}

/// Stage 3: restore alternation. Identical same-role neighbors collapse to
/// the newer one. A user-user pair gets an assistant placeholder between
/// them; an assistant pair whose first member ends with a `tool_use` gets
/// the matching user `tool_result` placeholder. Remaining assistant runs
/// are alternative drafts of the same reply and fall through to stage 5.
fn enforce_alternation(history: Vec<Message>) -> Vec<Message> {
    enum Action {
        Push,
        Replace,
        Wedge(Message),
    }

    let mut out: Vec<Message> = Vec::new();
    for msg in history {
        let action = match out.last() {
            Some(last) if last.role == msg.role => {
                if last.content == msg.content {
                    Action::Replace
                } else {
                    match (last.role, last.trailing_tool_use()) {
                        (Role::Assistant, Some(id)) => {
                            Action::Wedge(Message::placeholder_tool_result(id.to_string()))
                        }
                        (Role::User, _) => Action::Wedge(Message::placeholder_assistant()),
                        _ => Action::Push,
                    }
                }
            }
            _ => Action::Push,
        };
        match action {
            Action::Replace => *out.last_mut().expect("non-empty") = msg,
            Action::Wedge(placeholder) => {
                out.push(placeholder);
                out.push(msg);
            }
            Action::Push => out.push(msg),
        }
    }
    out
}

/// Stage 4: a real message wedged between two placeholders, where the
/// window also breaks alternation, is unreliable. Delete the whole triple.
fn remove_sandwiches(history: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < history.len() {
        if i + 2 < history.len()
            && history[i].is_placeholder()
            && !history[i + 1].is_placeholder()
            && history[i + 2].is_placeholder()
            && (history[i].role == history[i + 1].role
                || history[i + 1].role == history[i + 2].role)
        {
            i += 3;
            continue;
        }
        out.push(history[i].clone());
        i += 1;
    }
    out
}

/// Stage 5: consecutive same-role messages collapse to their last element.
fn collapse_runs(history: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    for msg in history {
        if out.last().map(|l| l.role == msg.role).unwrap_or(false) {
            *out.last_mut().expect("non-empty") = msg;
        } else {
            out.push(msg);
        }
    }
    out
}

/// Stage 6: no two adjacent placeholders (first wins); an
/// alternation-breaking placeholder/real/placeholder triple keeps only the
/// leading placeholder. One pairing is exempt from the adjacency rule: a
/// user tool-result placeholder followed by the closing assistant
/// placeholder — that pair is exactly what the bookend stage produces for a
/// history ending in an unanswered `tool_use`.
fn strip_placeholder_runs(history: Vec<Message>) -> Vec<Message> {
    let mut deduped: Vec<Message> = Vec::new();
    for msg in history {
        if let Some(prev) = deduped.last() {
            if msg.is_placeholder() && prev.is_placeholder() {
                let answers_tool_use =
                    !prev.tool_result_ids().is_empty() && prev.role != msg.role;
                if !answers_tool_use {
                    continue;
                }
            }
        }
        deduped.push(msg);
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i < deduped.len() {
        if i + 2 < deduped.len()
            && deduped[i].is_placeholder()
            && !deduped[i + 1].is_placeholder()
            && deduped[i + 2].is_placeholder()
            && (deduped[i].role == deduped[i + 1].role
                || deduped[i + 1].role == deduped[i + 2].role)
        {
            out.push(deduped[i].clone());
            i += 3;
            continue;
        }
        out.push(deduped[i].clone());
        i += 1;
    }
    out
}

/// Interior tool pairing: every `tool_use` must be answered in the next
/// user message; every `tool_result` must answer the directly preceding
/// assistant message. Missing results are filled with placeholder blocks,
/// orphan results are dropped.
fn repair_tool_pairing(history: Vec<Message>) -> Vec<Message> {
    let mut out = history;
    for i in 0..out.len() {
        if out[i].role == Role::User {
            let preceding: Vec<String> = if i > 0 && out[i - 1].role == Role::Assistant {
                out[i - 1].tool_use_ids().iter().map(|s| s.to_string()).collect()
            } else {
                Vec::new()
            };
            let before = out[i].content.len();
            out[i].content.retain(|block| match block.tool_use_id() {
                Some(id) if block.is_tool_result() => preceding.iter().any(|p| p == id),
                _ => true,
            });
            if out[i].content.len() != before {
                debug!(dropped = before - out[i].content.len(), "dropped orphan tool results");
            }
            if out[i].content.is_empty() {
                out[i] = Message::placeholder_user_text();
            } else {
                out[i].ensure_leading_text();
            }
        }
    }

    for i in 0..out.len() {
        if out[i].role != Role::Assistant {
            continue;
        }
        let use_ids: Vec<String> = out[i].tool_use_ids().iter().map(|s| s.to_string()).collect();
        if use_ids.is_empty() || i + 1 >= out.len() || out[i + 1].role != Role::User {
            continue;
        }
        let have: Vec<String> = out[i + 1]
            .tool_result_ids()
            .iter()
            .map(|s| s.to_string())
            .collect();
        for id in use_ids.iter().filter(|id| !have.contains(*id)) {
            debug!(tool_use_id = %id, "filling missing tool result with placeholder");
            out[i + 1].content.push(ContentBlock::tool_result(
                id.clone(),
                vec![ContentBlock::text(PLACEHOLDER_USER_TOOL_RESULT)],
                false,
            ));
        }
    }
    out
}

/// Stage 7: bracket with valid endpoints. A leading assistant placeholder
/// or trailing user placeholder is dropped rather than wrapped in another
/// placeholder; real endpoints get a placeholder bookend. A trailing
/// assistant `tool_use` gets its matching user `tool_result` placeholder
/// before the final assistant bookend.
fn bookend(mut history: Vec<Message>) -> Vec<Message> {
    while let Some(first) = history.first() {
        if first.role == Role::Assistant && first.is_placeholder() {
            history.remove(0);
        } else {
            break;
        }
    }
    while let Some(last) = history.last() {
        if last.role == Role::User && last.is_placeholder() {
            history.pop();
        } else {
            break;
        }
    }
    if history.is_empty() {
        return history;
    }

    if history.first().map(|m| m.role) == Some(Role::Assistant) {
        history.insert(0, Message::placeholder_user_text());
    }

    if let Some(last) = history.last() {
        if last.role == Role::Assistant {
            let unanswered: Vec<String> =
                last.tool_use_ids().iter().map(|s| s.to_string()).collect();
            if last.trailing_tool_use().is_some() && !unanswered.is_empty() {
                history.push(placeholder_results_for(&unanswered));
            }
        }
    }

    if history.last().map(|m| m.role) == Some(Role::User) {
        history.push(Message::placeholder_assistant());
    }
    history
}

fn placeholder_results_for(ids: &[String]) -> Message {
    let mut content = vec![ContentBlock::text(PLACEHOLDER_USER_TOOL_RESULT)];
    for id in ids {
        content.push(ContentBlock::tool_result(
            id.clone(),
            vec![ContentBlock::text(PLACEHOLDER_USER_TOOL_RESULT)],
            false,
        ));
    }
    Message {
        role: Role::User,
        content,
        synthetic: true,
    }
}

/// Stage 8 predicate: user first, assistant last, strict alternation.
pub fn verify(history: &[Message]) -> bool {
    let Some(first) = history.first() else {
        return false;
    };
    let Some(last) = history.last() else {
        return false;
    };
    if first.role != Role::User || last.role != Role::Assistant {
        return false;
    }
    history.windows(2).all(|w| w[0].role != w[1].role)
}

/// Stage 8 fallback: keep the alternating subsequence starting at the first
/// user message, then close with an assistant placeholder if needed.
fn salvage(history: Vec<Message>) -> Vec<Message> {
    let Some(start) = history.iter().position(|m| m.role == Role::User) else {
        warn!("no user message found; history is beyond repair");
        return Vec::new();
    };

    let mut out: Vec<Message> = Vec::new();
    for msg in history.into_iter().skip(start) {
        let keep = match out.last() {
            None => true,
            Some(last) => last.role != msg.role,
        };
        if keep {
            out.push(msg);
        }
    }
    if out.last().map(|m| m.role) == Some(Role::User) {
        out.push(Message::placeholder_assistant());
    }
    out
}
