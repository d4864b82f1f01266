//! Next-speaker arbitration.
//!
//! After a turn finishes with a natural stop and fresh function responses
//! were appended, the client asks whether the model should continue without
//! new user input. This implementation is a heuristic over the tail of the
//! history; the hard `max_turns` cap is enforced by the client.

use crate::types::{Content, FinishReason, Part, Role};

/// Who should speak next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextSpeaker {
    Model,
    User,
}

/// Markers a model reply can end with to signal it intends to continue.
const CONTINUATION_SUFFIXES: &[&str] = &["...", "\u{2026}"];

/// Decide whether the model auto-continues.
///
/// The model continues when the turn ended in `Stop` and either
/// - the last content is a function response block (the model has results it
///   has not yet commented on), or
/// - the model's last text explicitly trails off with a continuation marker.
#[must_use]
pub fn decide(history: &[Content], finish: FinishReason, appended_responses: bool) -> NextSpeaker {
    if finish != FinishReason::Stop {
        return NextSpeaker::User;
    }

    let Some(last) = history.last() else {
        return NextSpeaker::User;
    };

    if appended_responses && last.role == Role::Function {
        return NextSpeaker::Model;
    }

    if last.role == Role::Model {
        let trailing_text = last.parts.iter().rev().find_map(|part| match part {
            Part::Text { text } => Some(text.trim_end()),
            _ => None,
        });
        if let Some(text) = trailing_text {
            if CONTINUATION_SUFFIXES
                .iter()
                .any(|suffix| text.ends_with(suffix))
            {
                return NextSpeaker::Model;
            }
        }
    }

    NextSpeaker::User
}
