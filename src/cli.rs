//! Line-oriented terminal front end

use crate::runtime::ClientEvent;
use crate::timeline::{local_time, ConversationEntry, Sender};
use crate::transport::AgentStatus;
use crate::turn::{ToolExecutionRecord, TurnPhase};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::PathBuf;

pub const HELP: &str = "\
Commands:
  /new                 start a new chat session
  /form <json>         answer a pending form
  /cancel              dismiss a pending form
  /upload <file>...    upload PDF, DOC, DOCX or TXT attachments
  /history             list archived exchanges
  /delete <n>          delete archived exchange n (1 = newest)
  /clear               delete all archived exchanges
  /export [file]       write the transcript to a file or stdout
  /status              check the agent
  /models              list available models
  /settings            show preferences
  /set <name> <value>  change a preference (model, temperature, maxTokens)
  /retry               reconnect the push channel now
  /help                show this help
  /quit                exit
Anything else is sent to the agent.";

/// One parsed line of user input
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Message(String),
    NewChat,
    Form(Value),
    CancelForm,
    Upload(Vec<PathBuf>),
    History,
    Delete(usize),
    ClearHistory,
    Export(Option<PathBuf>),
    Status,
    Models,
    Settings,
    Set { name: String, value: String },
    Retry,
    Help,
    Quit,
}

/// Parse a line; `Err` carries a usage hint
pub fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Ok(Some(Input::Message(trimmed.to_string())));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, r)| (n, r.trim()));

    let input = match name {
        "new" => Input::NewChat,
        "form" => {
            let value = serde_json::from_str(rest).map_err(|e| format!("Invalid form JSON: {e}"))?;
            Input::Form(value)
        }
        "cancel" => Input::CancelForm,
        "upload" => {
            let paths: Vec<PathBuf> = rest.split_whitespace().map(PathBuf::from).collect();
            if paths.is_empty() {
                return Err("Usage: /upload <file>...".to_string());
            }
            Input::Upload(paths)
        }
        "history" => Input::History,
        "delete" => match rest.parse::<usize>() {
            Ok(n) if n > 0 => Input::Delete(n - 1),
            _ => return Err("Usage: /delete <n>, where 1 is the newest".to_string()),
        },
        "clear" => Input::ClearHistory,
        "export" => Input::Export((!rest.is_empty()).then(|| PathBuf::from(rest))),
        "status" => Input::Status,
        "models" => Input::Models,
        "settings" => Input::Settings,
        "set" => {
            let Some((name, value)) = rest.split_once(char::is_whitespace) else {
                return Err("Usage: /set <name> <value>".to_string());
            };
            Input::Set {
                name: name.to_string(),
                value: value.trim().to_string(),
            }
        }
        "retry" => Input::Retry,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("Unknown command /{other}; try /help")),
    };
    Ok(Some(input))
}

/// Text for an observer event, if it is worth printing
pub fn render(event: &ClientEvent) -> Option<String> {
    match event {
        ClientEvent::EntryAppended(entry) => Some(render_entry(entry, false)),
        ClientEvent::EntryReplaced(entry) => Some(render_entry(entry, true)),
        ClientEvent::StateChanged { phase } => match phase {
            TurnPhase::Thinking => Some("  ... thinking".to_string()),
            TurnPhase::AwaitingForm => {
                Some("  (reply with /form <json> or /cancel)".to_string())
            }
            TurnPhase::Idle
            | TurnPhase::ToolExecuting
            | TurnPhase::Responding
            | TurnPhase::AwaitingUserInput => None,
        },
        ClientEvent::ToolsUpdated(tools) => Some(render_tools(tools)),
        ClientEvent::ConnectionChanged(status) => Some(format!("  [connection {status}]")),
        ClientEvent::AgentStatusChanged(AgentStatus::Online { .. }) => {
            Some("  [agent online]".to_string())
        }
        ClientEvent::AgentStatusChanged(AgentStatus::Offline { reason }) => {
            Some(format!("  [agent offline: {reason}]"))
        }
        ClientEvent::Warning(message) => Some(format!("  ! {message}")),
        ClientEvent::TurnFinished { .. } => None,
    }
}

fn render_entry(entry: &ConversationEntry, replaced: bool) -> String {
    let who = match entry.sender {
        Sender::User => "You",
        Sender::Agent => "Agent",
    };
    let marker = if replaced { " (updated)" } else { "" };
    format!(
        "[{}] {who}{marker}: {}",
        local_time(entry.timestamp),
        entry.content
    )
}

fn render_tools(tools: &[ToolExecutionRecord]) -> String {
    let mut out = String::new();
    for (i, tool) in tools.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let status = match (tool.executing, tool.success) {
            (true, _) => "running".to_string(),
            (false, true) => format!("done in {}ms", tool.duration_ms),
            (false, false) => format!(
                "failed: {}",
                tool.error.as_deref().unwrap_or("unknown error")
            ),
        };
        let _ = write!(out, "  * {} {status}", tool.tool_name);
    }
    out
}
