//! Command presets for the supported coding-assistant CLIs.

use backlog_proto::{AgentConfig, PromptMode};
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// Prompts longer than this are handed to Claude through a temp file.
const LARGE_PROMPT_THRESHOLD: usize = 7000;

/// Output format a backend produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Text,
    /// Newline-delimited JSON events (Claude `--output-format stream-json`)
    StreamJson,
}

/// Errors resolving a backend from configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Unknown agent '{0}': set `command` in its agent settings")]
    UnknownAgent(String),
}

/// A CLI backend: the executable plus how the prompt reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliBackend {
    /// The command to execute.
    pub command: String,
    /// Arguments placed before the prompt.
    pub args: Vec<String>,
    pub prompt_mode: PromptMode,
    /// Flag preceding the prompt in arg mode (None = positional).
    pub prompt_flag: Option<String>,
    pub output_format: OutputFormat,
    /// Flag used to select a model, when the CLI has one.
    pub model_flag: Option<String>,
}

/// A fully resolved invocation.
#[derive(Debug)]
pub struct BuiltCommand {
    pub command: String,
    pub args: Vec<String>,
    /// Prompt text to write to stdin, in stdin mode.
    pub stdin: Option<String>,
    /// Holds a large prompt on disk; must outlive the process.
    pub prompt_file: Option<NamedTempFile>,
}

impl CliBackend {
    /// Returns the preset for a known agent id.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Self::claude()),
            "codex" => Some(Self::codex()),
            "gemini" => Some(Self::gemini()),
            "amp" => Some(Self::amp()),
            "copilot" => Some(Self::copilot()),
            "opencode" => Some(Self::opencode()),
            _ => None,
        }
    }

    /// Resolves the backend for `agent_id`, layering `config` over the preset.
    ///
    /// Agents without a preset need an explicit `command`.
    pub fn from_agent_config(agent_id: &str, config: &AgentConfig) -> Result<Self, BackendError> {
        let mut backend = match (Self::from_name(agent_id), &config.command) {
            (Some(preset), _) => preset,
            (None, Some(_)) => Self::custom(),
            (None, None) => return Err(BackendError::UnknownAgent(agent_id.to_string())),
        };

        if let Some(command) = &config.command {
            backend.command.clone_from(command);
        }
        if let Some(mode) = config.prompt_mode {
            backend.prompt_mode = mode;
        }
        if config.prompt_flag.is_some() {
            backend.prompt_flag.clone_from(&config.prompt_flag);
        }
        if let (Some(model), Some(flag)) = (&config.model, &backend.model_flag) {
            backend.args.push(flag.clone());
            backend.args.push(model.clone());
        }
        backend.args.extend(config.args.iter().cloned());
        Ok(backend)
    }

    /// Claude Code in headless mode with streaming JSON output.
    pub fn claude() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--dangerously-skip-permissions".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            output_format: OutputFormat::StreamJson,
            model_flag: Some("--model".to_string()),
        }
    }

    /// Codex `exec` in full-auto mode. The prompt is positional.
    pub fn codex() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["exec".to_string(), "--full-auto".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: None,
            output_format: OutputFormat::Text,
            model_flag: Some("--model".to_string()),
        }
    }

    pub fn gemini() -> Self {
        Self {
            command: "gemini".to_string(),
            args: vec!["--yolo".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            output_format: OutputFormat::Text,
            model_flag: Some("--model".to_string()),
        }
    }

    pub fn amp() -> Self {
        Self {
            command: "amp".to_string(),
            args: vec!["--dangerously-allow-all".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-x".to_string()),
            output_format: OutputFormat::Text,
            model_flag: None,
        }
    }

    /// GitHub Copilot CLI with automatic tool approval.
    pub fn copilot() -> Self {
        Self {
            command: "copilot".to_string(),
            args: vec!["--allow-all-tools".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            output_format: OutputFormat::Text,
            model_flag: Some("--model".to_string()),
        }
    }

    /// OpenCode `run` with a positional prompt:
    /// ```bash
    /// opencode run "prompt text here"
    /// ```
    pub fn opencode() -> Self {
        Self {
            command: "opencode".to_string(),
            args: vec!["run".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: None,
            output_format: OutputFormat::Text,
            model_flag: Some("--model".to_string()),
        }
    }

    /// Blank backend for user-supplied commands; the prompt goes to stdin.
    fn custom() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            prompt_mode: PromptMode::Stdin,
            prompt_flag: None,
            output_format: OutputFormat::Text,
            model_flag: None,
        }
    }

    /// Builds the invocation for `prompt`.
    pub fn build_command(&self, prompt: &str) -> BuiltCommand {
        let mut args = self.args.clone();

        let (stdin, prompt_file) = match self.prompt_mode {
            PromptMode::Arg => {
                let (prompt_text, prompt_file) = if self.command == "claude"
                    && prompt.len() > LARGE_PROMPT_THRESHOLD
                {
                    match write_prompt_file(prompt) {
                        Ok(file) => {
                            let path = file.path().display().to_string();
                            (
                                format!("Please read and execute the task in {}", path),
                                Some(file),
                            )
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to write prompt to temp file");
                            (prompt.to_string(), None)
                        }
                    }
                } else {
                    (prompt.to_string(), None)
                };

                if let Some(flag) = &self.prompt_flag {
                    args.push(flag.clone());
                }
                args.push(prompt_text);
                (None, prompt_file)
            }
            PromptMode::Stdin => (Some(prompt.to_string()), None),
        };

        debug!(
            command = %self.command,
            args_count = args.len(),
            prompt_len = prompt.len(),
            uses_stdin = stdin.is_some(),
            uses_temp_file = prompt_file.is_some(),
            "Built CLI command"
        );
        trace!(prompt = %prompt, "Full prompt content");

        BuiltCommand {
            command: self.command.clone(),
            args,
            stdin,
            prompt_file,
        }
    }
}

fn write_prompt_file(prompt: &str) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(prompt.as_bytes())?;
    file.flush()?;
    Ok(file)
}
