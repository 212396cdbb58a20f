//! Subagent tracing for Claude's `stream-json` output.
//!
//! Claude spawns subagents through its `Task` tool. A `tool_use` block for
//! `Task` starts a subagent; the matching `tool_result` ends it.

use backlog_proto::{SubagentEvent, SubagentStatus};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::trace;

const SUBAGENT_TOOL: &str = "Task";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Assistant { message: Message },
    User { message: Message },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(#[allow(dead_code)] String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: TaskInput,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct TaskInput {
    #[serde(default)]
    subagent_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Turns `stream-json` lines into subagent lifecycle events.
#[derive(Debug, Default)]
pub struct SubagentParser {
    running: HashSet<String>,
}

impl SubagentParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one output line. Lines that are not JSON are ignored.
    pub fn parse_line(&mut self, line: &str) -> Vec<SubagentEvent> {
        let line = line.trim();
        if !line.starts_with('{') {
            return Vec::new();
        }
        let parsed = match serde_json::from_str::<StreamLine>(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(error = %e, "Skipping unparseable stream-json line");
                return Vec::new();
            }
        };

        let blocks = match parsed {
            StreamLine::Assistant { message } | StreamLine::User { message } => {
                match message.content {
                    MessageContent::Blocks(blocks) => blocks,
                    MessageContent::Text(_) => return Vec::new(),
                }
            }
            StreamLine::Other => return Vec::new(),
        };

        let mut events = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::ToolUse { id, name, input } if name == SUBAGENT_TOOL => {
                    self.running.insert(id.clone());
                    events.push(SubagentEvent {
                        id,
                        status: SubagentStatus::Running,
                        agent_type: input.subagent_type,
                        description: input.description,
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    is_error,
                } if self.running.remove(&tool_use_id) => {
                    events.push(SubagentEvent {
                        id: tool_use_id,
                        status: if is_error {
                            SubagentStatus::Failed
                        } else {
                            SubagentStatus::Completed
                        },
                        agent_type: None,
                        description: None,
                    });
                }
                _ => {}
            }
        }
        events
    }

    /// Subagents started but not yet finished.
    pub fn running(&self) -> usize {
        self.running.len()
    }
}
