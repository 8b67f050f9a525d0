//! Interactive shell sessions
//!
//! A [`Session`] is a line-oriented channel to a shell inside a node. A round
//! trip writes one command line and reads until the shell's prompt pattern
//! shows up again. Completion is detected only by the prompt, and a deadline
//! bounds the wait. Output is never returned early on a guess.

use regex::Regex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("prompt not seen within {after:?}")]
    Timeout { after: Duration, partial: String },

    #[error("session closed before the prompt appeared")]
    Closed { partial: String },

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Session {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    prompt: Regex,
    timeout: Duration,
    /// Decoded output not yet handed to a caller
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending: Vec<u8>,
    child: Option<Child>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("prompt", &self.prompt.as_str())
            .field("timeout", &self.timeout)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Session {
    pub fn new<R, W>(reader: R, writer: W, prompt: Regex, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            prompt,
            timeout,
            buffer: String::new(),
            pending: Vec::new(),
            child: None,
        }
    }

    /// Tie the lifetime of a spawned process to this session
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        debug!("session <- {}", line);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a command and return everything the shell wrote before its next prompt
    pub async fn send_command(&mut self, line: &str) -> Result<String, SessionError> {
        if !self.buffer.is_empty() {
            debug!("discarding {} stale bytes before command", self.buffer.len());
            self.buffer.clear();
        }
        self.send_line(line).await?;
        self.await_prompt(self.timeout).await
    }

    /// Consume output up to the next prompt using the session's default deadline
    pub async fn wait_for_prompt(&mut self) -> Result<String, SessionError> {
        self.await_prompt(self.timeout).await
    }

    /// Read until the prompt pattern matches, or fail once `limit` elapses.
    ///
    /// On timeout the buffered output is kept, so waiting again resumes where
    /// this call stopped.
    pub async fn await_prompt(&mut self, limit: Duration) -> Result<String, SessionError> {
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; 4096];

        loop {
            if let Some(output) = self.take_until_prompt() {
                return Ok(output);
            }

            let read = tokio::time::timeout_at(deadline, self.reader.read(&mut chunk)).await;
            let n = match read {
                Ok(result) => result?,
                Err(_) => {
                    warn!("prompt /{}/ not seen within {:?}", self.prompt, limit);
                    return Err(SessionError::Timeout {
                        after: limit,
                        partial: self.buffer.clone(),
                    });
                }
            };
            if n == 0 {
                return Err(SessionError::Closed {
                    partial: std::mem::take(&mut self.buffer),
                });
            }
            self.push_bytes(&chunk[..n]);
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.pending.clear();
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the end; keep it for the next read
                let valid = e.valid_up_to();
                self.buffer
                    .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                self.pending.drain(..valid);
            }
            Err(_) => {
                self.buffer.push_str(&String::from_utf8_lossy(&self.pending));
                self.pending.clear();
            }
        }
    }

    fn take_until_prompt(&mut self) -> Option<String> {
        let (start, end) = {
            let m = self.prompt.find(&self.buffer)?;
            (m.start(), m.end())
        };
        let output = self.buffer[..start].to_string();
        self.buffer.drain(..end);
        Some(output)
    }

    /// Ask the shell to exit and reap the process
    pub async fn close(mut self) {
        let _ = self.send_line("exit").await;
        let _ = self.writer.shutdown().await;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("session child already gone: {}", e);
            }
        }
    }
}
