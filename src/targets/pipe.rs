//! Pipe target: hand each message to an external command on stdin.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::message::RawMessage;
use crate::targets::{DeliveryContext, ImportOutcome};

#[derive(Debug)]
pub struct PipeTarget {
    identifier: String,
    command: String,
    argv: Vec<String>,
}

impl PipeTarget {
    pub fn new(identifier: &str, command: &str) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Configuration(format!(
                "pipe target '{}' requires a command",
                identifier
            )));
        }

        let argv = shlex::split(command).ok_or_else(|| {
            Error::Configuration(format!(
                "invalid command for pipe target '{}': {}",
                identifier, command
            ))
        })?;
        if argv.is_empty() {
            return Err(Error::Configuration(format!(
                "pipe target '{}' requires a non-empty command",
                identifier
            )));
        }

        Ok(Self {
            identifier: identifier.to_string(),
            command: command.to_string(),
            argv,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn connect(&mut self) -> Result<()> {
        log::debug!("pipe target ready with command: {}", self.command);
        Ok(())
    }

    /// Spawn the command with the labels appended as positional
    /// arguments and the normalized message on stdin.
    pub async fn import_message(
        &mut self,
        msg: &RawMessage,
        ctx: &DeliveryContext<'_>,
    ) -> Result<ImportOutcome> {
        let payload = msg.as_bytes(Some(ctx.feed_name), Some(ctx.delivery_name));

        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .args(ctx.labels)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::Delivery(format!("pipe command not found: {}", self.argv[0]))
                } else {
                    Error::Delivery(format!("failed to spawn pipe command: {}", e))
                }
            })?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::Delivery("pipe command has no stdin".to_string()))?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| Error::Delivery(format!("failed to write to pipe command: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Delivery(format!("failed to wait for pipe command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Delivery(format!(
                "pipe command failed with exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr
            )));
        }

        log::debug!("piped message to command: {}", self.argv[0]);
        Ok(ImportOutcome::Delivered(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(labels: &'a [String]) -> DeliveryContext<'a> {
        DeliveryContext {
            feed_name: "test-feed",
            delivery_name: "test-delivery",
            labels,
            subfolder: None,
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            PipeTarget::new("p", "").unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        assert!(matches!(
            PipeTarget::new("p", "cat 'unterminated").unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_command_split() {
        let target = PipeTarget::new("p", "tee -a /tmp/out").unwrap();
        assert_eq!(target.argv, vec!["tee", "-a", "/tmp/out"]);
    }

    #[tokio::test]
    async fn test_import_pipes_message() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("out.eml");
        let mut target =
            PipeTarget::new("p", &format!("tee {}", out.display())).unwrap();
        target.connect().unwrap();

        let msg = RawMessage::new(
            b"From: a@x\nMessage-ID: <m1@x>\nSubject: T\n\nbody\n".to_vec(),
        );
        let labels: Vec<String> = Vec::new();
        let outcome = target.import_message(&msg, &ctx(&labels)).await.unwrap();
        assert_eq!(outcome, ImportOutcome::Delivered(None));

        let written = std::fs::read(&out).unwrap();
        // CRLF-normalized with the trace header ahead of the body.
        assert!(written.windows(17).any(|w| w == b"X-Korgalore-Trace"));
        assert!(written.windows(2).any(|w| w == b"\r\n"));
        let text = String::from_utf8_lossy(&written).replace("\r\n ", " ");
        assert!(text.contains("from feed=test-feed for delivery=test-delivery"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_delivery_error() {
        let mut target = PipeTarget::new("p", "false").unwrap();
        let msg = RawMessage::new(b"From: a@x\n\nbody\n".to_vec());
        let labels: Vec<String> = Vec::new();
        let err = target.import_message(&msg, &ctx(&labels)).await.unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
    }

    #[tokio::test]
    async fn test_missing_command_is_delivery_error() {
        let mut target = PipeTarget::new("p", "/nonexistent/command-xyz").unwrap();
        let msg = RawMessage::new(b"From: a@x\n\nbody\n".to_vec());
        let labels: Vec<String> = Vec::new();
        let err = target.import_message(&msg, &ctx(&labels)).await.unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
    }
}
