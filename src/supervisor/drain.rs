//! Pure queue-draining and prompt-resolution logic, kept separate from the
//! async state machine so it can be unit tested without a store or runner.

use crate::domain::{Intent, LoopQueueItem, PromptSource};

/// Result of walking a loop's pending queue items in position order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drain {
    /// Ids of items consumed this iteration (prompt-modifying intents, plus
    /// the halting control intent itself, if any).
    pub to_complete: Vec<String>,
    pub override_text: Option<String>,
    /// `(text, is_steer)` in position order.
    pub messages: Vec<(String, bool)>,
    /// The first control-terminal intent encountered, if iteration halted.
    pub halt: Option<Intent>,
}

/// Accumulate prompt-modifying intents (`message_append`, `steer_message`,
/// `next_prompt_override`) until the first control-terminal intent
/// (`pause`, `stop_graceful`, `kill_now`), which halts draining. Items after
/// a halt are left untouched — they remain pending for the next iteration.
pub fn drain_pending(items: &[LoopQueueItem]) -> Drain {
    let mut drain = Drain::default();
    for item in items {
        match &item.intent {
            Intent::MessageAppend { text } => {
                drain.messages.push((text.clone(), false));
                drain.to_complete.push(item.id.clone());
            }
            Intent::SteerMessage { text } => {
                drain.messages.push((text.clone(), true));
                drain.to_complete.push(item.id.clone());
            }
            Intent::NextPromptOverride { text } => {
                drain.override_text = Some(text.clone());
                drain.to_complete.push(item.id.clone());
            }
            Intent::Pause | Intent::StopGraceful | Intent::KillNow => {
                drain.to_complete.push(item.id.clone());
                drain.halt = Some(item.intent.clone());
                break;
            }
        }
    }
    drain
}

/// Resolve the prompt text and source for an iteration: an override wins
/// outright; otherwise the base text (already materialized by the caller,
/// from `base_prompt_msg` or a read `base_prompt_path`) has any accumulated
/// messages appended. Returns `None` if there is neither an override nor a
/// base to run.
pub fn resolve_prompt(base_text: Option<String>, drain: &Drain) -> Option<(String, PromptSource)> {
    if let Some(text) = &drain.override_text {
        return Some((text.clone(), PromptSource::Override));
    }
    let base = base_text?;
    if drain.messages.is_empty() {
        return Some((base, PromptSource::Base));
    }
    let appended = drain.messages.iter().map(|(text, _)| text.as_str()).collect::<Vec<_>>().join("\n");
    let full = format!("{base}\n\n{appended}");
    let source = if drain.messages.iter().any(|(_, is_steer)| *is_steer) {
        PromptSource::Steer
    } else {
        PromptSource::Base
    };
    Some((full, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, intent: Intent) -> LoopQueueItem {
        LoopQueueItem::new(id, "loop-1", intent, 0)
    }

    #[test]
    fn drains_message_appends_without_halting() {
        let items = vec![
            item("q1", Intent::MessageAppend { text: "a".into() }),
            item("q2", Intent::MessageAppend { text: "b".into() }),
        ];
        let drain = drain_pending(&items);
        assert_eq!(drain.to_complete, vec!["q1", "q2"]);
        assert!(drain.halt.is_none());
        assert_eq!(drain.messages, vec![("a".to_string(), false), ("b".to_string(), false)]);
    }

    #[test]
    fn stop_graceful_halts_and_leaves_later_items_untouched() {
        let items = vec![
            item("q1", Intent::MessageAppend { text: "a".into() }),
            item("q2", Intent::StopGraceful),
            item("q3", Intent::MessageAppend { text: "c".into() }),
        ];
        let drain = drain_pending(&items);
        assert_eq!(drain.to_complete, vec!["q1", "q2"]);
        assert_eq!(drain.halt, Some(Intent::StopGraceful));
    }

    #[test]
    fn next_prompt_override_does_not_halt_draining() {
        let items = vec![
            item("q1", Intent::NextPromptOverride { text: "do this instead".into() }),
            item("q2", Intent::MessageAppend { text: "a".into() }),
        ];
        let drain = drain_pending(&items);
        assert_eq!(drain.override_text.as_deref(), Some("do this instead"));
        assert!(drain.halt.is_none());
        assert_eq!(drain.to_complete.len(), 2);
    }

    #[test]
    fn resolve_prompt_prefers_override_over_base() {
        let drain = Drain {
            override_text: Some("override".to_string()),
            ..Default::default()
        };
        let (text, source) = resolve_prompt(Some("base".to_string()), &drain).unwrap();
        assert_eq!(text, "override");
        assert_eq!(source, PromptSource::Override);
    }

    #[test]
    fn resolve_prompt_appends_messages_to_base() {
        let drain = Drain {
            messages: vec![("steer me".to_string(), true)],
            ..Default::default()
        };
        let (text, source) = resolve_prompt(Some("base prompt".to_string()), &drain).unwrap();
        assert!(text.starts_with("base prompt"));
        assert!(text.contains("steer me"));
        assert_eq!(source, PromptSource::Steer);
    }

    #[test]
    fn resolve_prompt_with_no_base_and_no_override_is_none() {
        let drain = Drain::default();
        assert!(resolve_prompt(None, &drain).is_none());
    }

    #[test]
    fn resolve_prompt_with_only_message_appends_stays_base_source() {
        let drain = Drain {
            messages: vec![("append me".to_string(), false)],
            ..Default::default()
        };
        let (_, source) = resolve_prompt(Some("base".to_string()), &drain).unwrap();
        assert_eq!(source, PromptSource::Base);
    }
}
