//! Payload re-encoding.
//!
//! An [`Encoder`] rewrites the payload of each completed frame, typically to
//! convert its character set. [`CommandEncoder`] hands the payload to an
//! external converter through a pair of scratch files:
//!
//! ```text
//! <program> [args...] <source-file> <destination-file>
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempPath;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from a single re-encoding attempt.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The configured command line has no program.
    #[error("encoder command is empty")]
    EmptyCommand,

    /// The configured command line opens a quote it never closes.
    #[error("encoder command has an unterminated quote")]
    UnbalancedQuote,

    /// The converter process could not be started.
    #[error("failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The converter ran but reported failure.
    #[error("encoder exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },

    /// A scratch file could not be created, written, read or removed.
    #[error("encoder scratch file error: {0}")]
    Scratch(#[source] io::Error),

    /// In-process encoder failure.
    #[error("encoder failed: {0}")]
    Failed(String),
}

/// Rewrites a frame payload.
#[async_trait]
pub trait Encoder: Send + Sync + fmt::Debug {
    /// Encode one payload. The result is re-wrapped in MLLP framing by the caller.
    async fn encode(&self, payload: Bytes) -> Result<Bytes, EncodeError>;
}

/// What a filter does with a frame whose payload failed to encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncoderFailurePolicy {
    /// End the copy direction with an error, which tears the session down.
    #[default]
    CloseSession,
    /// Forward the original frame unencoded.
    Forward,
    /// Drop the frame.
    Drop,
}

impl EncoderFailurePolicy {
    /// Stable name used on the command line and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderFailurePolicy::CloseSession => "close-session",
            EncoderFailurePolicy::Forward => "forward",
            EncoderFailurePolicy::Drop => "drop",
        }
    }
}

impl fmt::Display for EncoderFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "close-session" | "close" => Ok(EncoderFailurePolicy::CloseSession),
            "forward" => Ok(EncoderFailurePolicy::Forward),
            "drop" => Ok(EncoderFailurePolicy::Drop),
            other => Err(format!(
                "unknown encoder failure policy '{}' (expected close-session, forward or drop)",
                other
            )),
        }
    }
}

/// Runs an external converter once per payload.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    /// Executable to run.
    program: String,
    /// Arguments placed before the two scratch file paths.
    args: Vec<String>,
    /// Directory for scratch files (system temp dir when unset).
    scratch_dir: Option<PathBuf>,
}

impl CommandEncoder {
    /// Parse a command line. Whitespace separates the program from its
    /// arguments; single or double quotes keep a word with spaces together.
    pub fn parse(command: &str) -> Result<Self, EncodeError> {
        let mut parts = split_words(command)?.into_iter();
        let program = parts.next().ok_or(EncodeError::EmptyCommand)?;

        Ok(Self {
            program,
            args: parts.collect(),
            scratch_dir: None,
        })
    }

    /// Place scratch files in `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// The command line without scratch paths, for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn scratch_file(&self, prefix: &str) -> Result<TempPath, EncodeError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(".hl7");

        let file = match &self.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(EncodeError::Scratch)?;

        // Release the handle so the converter can open the path itself.
        Ok(file.into_temp_path())
    }

    async fn run(&self, src: &Path, dst: &Path) -> Result<(), EncodeError> {
        debug!(
            command = %self.command_line(),
            src = %src.display(),
            dst = %dst.display(),
            "running encoder"
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(src)
            .arg(dst)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EncodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EncodeError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Split a command line into words, removing the quotes around quoted words.
fn split_words(command: &str) -> Result<Vec<String>, EncodeError> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => word.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            None => {
                word.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(EncodeError::UnbalancedQuote);
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

#[async_trait]
impl Encoder for CommandEncoder {
    async fn encode(&self, payload: Bytes) -> Result<Bytes, EncodeError> {
        // Both paths are removed on drop, whichever way this returns.
        let src = self.scratch_file("hl7-src-")?;
        let dst = self.scratch_file("hl7-dst-")?;

        tokio::fs::write(&src, &payload)
            .await
            .map_err(EncodeError::Scratch)?;

        self.run(&src, &dst).await?;

        let encoded = tokio::fs::read(&dst).await.map_err(EncodeError::Scratch)?;

        src.close().map_err(EncodeError::Scratch)?;
        dst.close().map_err(EncodeError::Scratch)?;

        Ok(Bytes::from(encoded))
    }
}
