//! Scripted answers for interactive device commands.
//!
//! IOS asks questions in the middle of `copy` and friends
//! (`Destination filename [running-config]?`). A [`PromptTable`] lists
//! the questions we know how to answer; anything else is left unanswered
//! and the caller's timeout ends the exchange.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::error::RtbhError;

/// Upper bound on answers given in one exchange.
pub const MAX_RESPONSES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRule {
    /// Substring that identifies the question
    pub pattern: String,
    /// Text sent back, followed by a newline (empty means just Enter)
    pub response: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptTable {
    rules: Vec<PromptRule>,
    error_markers: Vec<String>,
    done_markers: Vec<String>,
}

impl PromptTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, pattern: &str, response: &str) -> Self {
        self.rules.push(PromptRule {
            pattern: pattern.to_string(),
            response: response.to_string(),
        });
        self
    }

    /// Output containing `marker` fails the exchange.
    pub fn fail_on(mut self, marker: &str) -> Self {
        self.error_markers.push(marker.to_string());
        self
    }

    /// Output containing `marker` completes the exchange.
    pub fn done_on(mut self, marker: &str) -> Self {
        self.done_markers.push(marker.to_string());
        self
    }

    pub fn rules(&self) -> &[PromptRule] {
        &self.rules
    }

    /// Answers for `copy <file> running-config`.
    pub fn copy_to_running_config() -> Self {
        Self::new()
            .answer("Destination filename [running-config]?", "running-config")
            .fail_on("%Error")
            .fail_on("% Invalid")
            .done_on("bytes copied")
    }

    /// Answers for `copy running-config <snapshot>`: accept the default
    /// file name and confirm overwriting an older snapshot.
    pub fn save_snapshot() -> Self {
        Self::new()
            .answer("Destination filename [", "")
            .answer("[confirm]", "")
            .fail_on("%Error")
            .fail_on("% Invalid")
            .done_on("bytes copied")
    }

    /// Answers for `configure replace <snapshot> force`.
    pub fn configure_replace() -> Self {
        Self::new()
            .answer("[no]:", "yes")
            .fail_on("%Error")
            .fail_on("Rollback aborted")
            .done_on("Rollback Done")
    }

    pub fn session(&self) -> PromptSession<'_> {
        PromptSession {
            table: self,
            transcript: String::new(),
            pending_from: 0,
            responses: 0,
        }
    }
}

/// What to do after a chunk of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptEvent {
    NeedMore,
    Respond(String),
    Complete,
    Error(String),
}

/// Progress through one interactive exchange.
#[derive(Debug)]
pub struct PromptSession<'a> {
    table: &'a PromptTable,
    transcript: String,
    /// Start of the output not yet matched against the rules
    pending_from: usize,
    responses: usize,
}

impl PromptSession<'_> {
    /// Feed device output and decide the next step.
    pub fn feed(&mut self, chunk: &str) -> PromptEvent {
        self.transcript.push_str(chunk);
        let pending = &self.transcript[self.pending_from..];

        if let Some(marker) = self.table.error_markers.iter().find(|m| pending.contains(m.as_str())) {
            let line = pending
                .lines()
                .find(|l| l.contains(marker.as_str()))
                .unwrap_or(marker.as_str())
                .trim()
                .to_string();
            return PromptEvent::Error(line);
        }

        if let Some(rule) = self.table.rules.iter().find(|r| pending.contains(r.pattern.as_str())) {
            if self.responses >= MAX_RESPONSES {
                return PromptEvent::Error(format!(
                    "device kept prompting after {} answers",
                    MAX_RESPONSES
                ));
            }
            self.responses += 1;
            self.pending_from = self.transcript.len();
            return PromptEvent::Respond(format!("{}\n", rule.response));
        }

        if self.table.done_markers.iter().any(|m| pending.contains(m.as_str())) {
            return PromptEvent::Complete;
        }
        PromptEvent::NeedMore
    }

    /// Outcome when the device closes the channel.
    pub fn finish(&self) -> Result<(), String> {
        if self.table.done_markers.is_empty() {
            return Ok(());
        }
        let pending = &self.transcript[self.pending_from..];
        if self.table.done_markers.iter().any(|m| pending.contains(m.as_str())) {
            Ok(())
        } else {
            Err(format!(
                "channel closed before completion, last output: '{}'",
                last_line(&self.transcript)
            ))
        }
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Trailing text nobody answered; shown when a prompt times out.
    pub fn unanswered(&self) -> &str {
        last_line(&self.transcript[self.pending_from..])
    }
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// Run an exchange over a byte stream pair.
///
/// Each read is bounded by `silence`; a device that stays quiet (usually
/// because it asked something the table cannot answer) fails the exchange.
pub async fn drive_session<R, W>(
    reader: &mut R,
    writer: &mut W,
    table: &PromptTable,
    silence: Duration,
    operation: &str,
) -> Result<String, RtbhError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = table.session();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = match timeout(silence, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!("{}: no output, last line '{}'", operation, session.unanswered());
                return Err(RtbhError::Timeout {
                    operation: format!("{} (unanswered: '{}')", operation, session.unanswered()),
                    secs: silence.as_secs(),
                });
            }
        };
        if n == 0 {
            return session
                .finish()
                .map(|_| session.transcript().to_string())
                .map_err(|e| RtbhError::Transfer(format!("{}: {}", operation, e)));
        }

        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
        match session.feed(&chunk) {
            PromptEvent::NeedMore => {}
            PromptEvent::Respond(answer) => {
                debug!("{}: answering prompt", operation);
                writer.write_all(answer.as_bytes()).await?;
                writer.flush().await?;
            }
            PromptEvent::Complete => return Ok(session.transcript().to_string()),
            PromptEvent::Error(line) => {
                return Err(RtbhError::Transfer(format!("{}: {}", operation, line)))
            }
        }
    }
}
