//! The agent subprocess: spawn, stream, parse.
//!
//! The agent is an opaque CLI that reads the prompt on stdin and emits
//! newline-delimited JSON on stdout. Recognized records accumulate into a
//! [`Transcript`]; unparseable lines are treated as free-form text.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One stdout record.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    /// Startup banner (`subtype: "init"`); ignored.
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    Text {
        content: String,
    },
    Message {
        #[serde(default)]
        content: Option<String>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Todo {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn glyph(&self) -> &'static str {
        match self {
            TodoStatus::Pending => "☐",
            TodoStatus::InProgress => "▸",
            TodoStatus::Completed => "✓",
        }
    }
}

#[derive(Deserialize)]
struct TodoWriteInput {
    #[serde(default)]
    todos: Vec<Todo>,
}

/// Accumulated view of the agent's output so far.
///
/// A `TodoWrite` tool call transitions the visible content to the todo
/// list; text that arrives afterwards renders below it.
#[derive(Debug, Default)]
pub struct Transcript {
    text: String,
    error: Option<String>,
    todos: Vec<Todo>,
}

impl Transcript {
    pub fn apply_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_str::<AgentRecord>(trimmed) {
            Ok(record) => self.apply_record(record),
            Err(_) => {
                // Free-form output from the agent's own tooling.
                self.push_text(trimmed);
            }
        }
    }

    fn apply_record(&mut self, record: AgentRecord) {
        match record {
            AgentRecord::System { subtype } => {
                debug!(subtype = ?subtype, "agent system record");
            }
            AgentRecord::Assistant { message } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => self.push_text(&text),
                        ContentBlock::ToolUse { name, input } => {
                            if name == "TodoWrite" {
                                self.apply_todo_write(input);
                            } else {
                                debug!(tool = %name, "agent tool use");
                            }
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            AgentRecord::Text { content } => self.push_text(&content),
            AgentRecord::Message { content } => {
                if let Some(content) = content {
                    self.push_text(&content);
                }
            }
            AgentRecord::Error { message } => {
                warn!(error = %message, "agent reported error");
                self.error = Some(message);
            }
            AgentRecord::Other => {}
        }
    }

    fn apply_todo_write(&mut self, input: serde_json::Value) {
        match serde_json::from_value::<TodoWriteInput>(input) {
            Ok(parsed) => {
                self.todos = parsed.todos;
                // The todo list takes over the visible content.
                self.text.clear();
            }
            Err(e) => warn!(error = %e, "unparseable TodoWrite input"),
        }
    }

    fn push_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Render the visible content for the current frame.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.todos.is_empty() {
            out.push_str("*Todo list*\n");
            for todo in &self.todos {
                out.push_str(&format!("{} {}\n", todo.status.glyph(), todo.content));
            }
        }
        if !self.text.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.text);
        }
        out
    }
}

/// Result of one agent invocation.
#[derive(Debug)]
pub struct AgentOutcome {
    pub content: String,
    pub error: Option<String>,
}

/// Spawns the agent CLI and streams its transcript.
pub struct AgentRunner {
    command: String,
    workspace_dir: PathBuf,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(command: impl Into<String>, workspace_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workspace_dir: workspace_dir.into(),
            timeout,
        }
    }

    /// Run the agent on one prompt.
    ///
    /// Each parsed stdout line pushes the freshly rendered transcript into
    /// `updates`. On cancellation the subprocess gets SIGTERM, then SIGKILL
    /// five seconds later.
    pub async fn run(
        &self,
        prompt: &str,
        extra_args: &[String],
        updates: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("agent command is empty")?;

        let mut child = Command::new(program)
            .args(parts)
            .args(extra_args)
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn agent `{}`", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
            // Closing stdin tells the agent the prompt is complete.
            drop(stdin);
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "agent stderr");
                }
            });
        }

        let stdout = child.stdout.take().context("agent stdout not captured")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut transcript = Transcript::default();

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("agent run cancelled, terminating subprocess");
                    terminate(&mut child).await;
                    return Ok(AgentOutcome {
                        content: transcript.render(),
                        error: Some("agent was cancelled".to_string()),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("agent run timed out, terminating subprocess");
                    terminate(&mut child).await;
                    return Ok(AgentOutcome {
                        content: transcript.render(),
                        error: Some(format!(
                            "agent timed out after {} seconds",
                            self.timeout.as_secs()
                        )),
                    });
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        transcript.apply_line(&line);
                        // Receiver gone means the session is shutting down;
                        // keep draining so the exit status is accurate.
                        let _ = updates.send(transcript.render());
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "agent stdout read failed");
                        break;
                    }
                }
            }
        }

        let status = child.wait().await.context("failed to await agent exit")?;
        let error = transcript.error().map(str::to_string).or_else(|| {
            (!status.success()).then(|| format!("agent exited with status {status}"))
        });

        Ok(AgentOutcome {
            content: transcript.render(),
            error,
        })
    }
}

/// SIGTERM, five seconds of grace, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => return,
            Err(_) => warn!("agent ignored SIGTERM, killing"),
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_text_concatenates() {
        let mut transcript = Transcript::default();
        transcript.apply_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}"#,
        );
        transcript.apply_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"second"}]}}"#,
        );
        assert_eq!(transcript.render(), "first\nsecond");
    }

    #[test]
    fn system_init_is_ignored() {
        let mut transcript = Transcript::default();
        transcript.apply_line(r#"{"type":"system","subtype":"init","version":"1.2.3"}"#);
        assert_eq!(transcript.render(), "");
    }

    #[test]
    fn todo_write_replaces_visible_content() {
        let mut transcript = Transcript::default();
        transcript.apply_line(r#"{"type":"text","content":"planning…"}"#);
        transcript.apply_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"TodoWrite","input":{"todos":[
                {"id":"1","content":"write tests","status":"completed"},
                {"id":"2","content":"fix bug","status":"in_progress"},
                {"id":"3","content":"ship","status":"pending"}
            ]}}]}}"#,
        );

        let rendered = transcript.render();
        assert!(rendered.starts_with("*Todo list*"));
        assert!(rendered.contains("✓ write tests"));
        assert!(rendered.contains("▸ fix bug"));
        assert!(rendered.contains("☐ ship"));
        // The pre-todo text was replaced.
        assert!(!rendered.contains("planning"));
    }

    #[test]
    fn text_after_todo_renders_below_list() {
        let mut transcript = Transcript::default();
        transcript.apply_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"TodoWrite","input":{"todos":[{"id":"1","content":"a","status":"pending"}]}}]}}"#,
        );
        transcript.apply_line(r#"{"type":"text","content":"working on it"}"#);

        let rendered = transcript.render();
        assert!(rendered.contains("☐ a"));
        assert!(rendered.ends_with("working on it"));
    }

    #[test]
    fn non_json_lines_append_as_text() {
        let mut transcript = Transcript::default();
        transcript.apply_line("npm WARN deprecated");
        transcript.apply_line(r#"{"type":"text","content":"done"}"#);
        assert_eq!(transcript.render(), "npm WARN deprecated\ndone");
    }

    #[test]
    fn error_record_is_captured() {
        let mut transcript = Transcript::default();
        transcript.apply_line(r#"{"type":"error","message":"out of tokens"}"#);
        assert_eq!(transcript.error(), Some("out of tokens"));
    }

    #[test]
    fn unknown_record_types_are_skipped() {
        let mut transcript = Transcript::default();
        transcript.apply_line(r#"{"type":"usage","tokens":42}"#);
        assert_eq!(transcript.render(), "");
    }

    #[test]
    fn other_tool_uses_do_not_disturb_text() {
        let mut transcript = Transcript::default();
        transcript.apply_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"reading"},{"type":"tool_use","name":"Read","input":{"path":"x"}}]}}"#,
        );
        assert_eq!(transcript.render(), "reading");
    }
}
