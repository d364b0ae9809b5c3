//! Plain-text rendering of sessions, trees and models

use std::fmt::Write;

use chrono::{Local, TimeZone};

use arbor_core::{ModelConfig, Node, NodeId, NodeKind, Session, SessionId};

const PREVIEW_CHARS: usize = 60;

/// One line per session: id, node count, last update, title
pub fn session_list(sessions: &[&Session], active: Option<&SessionId>) -> String {
    let mut out = String::new();
    for session in sessions {
        let marker = if Some(&session.id) == active { '*' } else { ' ' };
        let _ = writeln!(
            out,
            "{marker} {}  {:>4} nodes  {}  {}",
            session.id,
            session.node_count(),
            timestamp(session.updated_at),
            session.title
        );
    }
    out
}

/// Indented tree of a session, marking the selected node
pub fn tree(session: &Session, selected: Option<&NodeId>) -> String {
    let mut out = String::new();
    let Some(root) = session.node(&session.root_id) else {
        return out;
    };
    let _ = writeln!(out, "{}", node_line(root, selected));

    // (node, prefix, last sibling); explicit stack keeps long chains off the call stack
    let mut stack = Vec::new();
    push_children(session, root, "", &mut stack);
    while let Some((node, prefix, last)) = stack.pop() {
        let branch = if last { "└─ " } else { "├─ " };
        let _ = writeln!(out, "{prefix}{branch}{}", node_line(node, selected));

        let next = format!("{prefix}{}", if last { "   " } else { "│  " });
        push_children(session, node, &next, &mut stack);
    }
    out
}

fn push_children<'a>(
    session: &'a Session,
    node: &Node,
    prefix: &str,
    stack: &mut Vec<(&'a Node, String, bool)>,
) {
    let count = node.children.len();
    let children: Vec<_> = node
        .children
        .iter()
        .enumerate()
        .filter_map(|(i, id)| session.node(id).map(|child| (child, prefix.to_string(), i + 1 == count)))
        .collect();
    stack.extend(children.into_iter().rev());
}

fn node_line(node: &Node, selected: Option<&NodeId>) -> String {
    let marker = if Some(&node.id) == selected { "* " } else { "" };
    let text = match &node.kind {
        NodeKind::PendingInput { draft } if draft.is_empty() => "(empty)".to_string(),
        NodeKind::Composite {
            user_message,
            assistant_message,
            ..
        } => {
            let reply = assistant_message.as_deref().unwrap_or("…");
            format!("{} → {}", preview(user_message), preview(reply))
        }
        _ => preview(&node.display_text()),
    };
    format!("{marker}[{}] {} {text}", node.kind.label(), node.id)
}

/// First line of `text`, shortened to a fixed width
pub fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS - 1).collect();
        format!("{cut}…")
    } else {
        line.to_string()
    }
}

/// One line per model configuration
pub fn model_list(models: &[ModelConfig]) -> String {
    let mut out = String::new();
    for model in models {
        let marker = if model.is_default { '*' } else { ' ' };
        let _ = writeln!(
            out,
            "{marker} {}  {:?}  {}  {}",
            model.id,
            model.provider,
            model.model,
            model.base_url()
        );
    }
    out
}

fn timestamp(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
}
