//! Delivery targets.
//!
//! Every target exposes the same surface: an idempotent `connect`, a
//! single-message `import_message` returning either an opaque
//! identifier or a skipped-duplicate marker, and an optional
//! `disconnect`. Variants are dispatched through a tagged enum.

pub mod gmail;
pub mod imap;
pub mod jmap;
pub mod maildir;
pub mod oauth2;
pub mod pipe;

use std::path::Path;

use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::message::RawMessage;

pub use gmail::GmailTarget;
pub use imap::ImapTarget;
pub use jmap::JmapTarget;
pub use maildir::MaildirTarget;
pub use pipe::PipeTarget;

/// Everything a target may need to deliver one message.
pub struct DeliveryContext<'a> {
    pub feed_name: &'a str,
    pub delivery_name: &'a str,
    pub labels: &'a [String],
    pub subfolder: Option<&'a str>,
}

/// Result of importing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Delivered; the identifier is target-specific and may be absent.
    Delivered(Option<String>),
    /// The target already had this message and skipped the import.
    Skipped,
}

pub enum Target {
    Imap(ImapTarget),
    Jmap(JmapTarget),
    Maildir(MaildirTarget),
    Gmail(GmailTarget),
    Pipe(PipeTarget),
}

impl Target {
    /// Build a target from its configuration section.
    pub fn from_config(
        name: &str,
        cfg: &TargetConfig,
        config_dir: &Path,
        interactive: bool,
    ) -> Result<Target> {
        match cfg {
            TargetConfig::Gmail { credentials, token } => Ok(Target::Gmail(GmailTarget::new(
                name,
                credentials,
                token,
                interactive,
            )?)),
            TargetConfig::Imap {
                server,
                username,
                folder,
                password,
                password_file,
                timeout,
                auth_type,
                client_id,
                tenant,
                token,
            } => Ok(Target::Imap(ImapTarget::new(imap::ImapConfig {
                identifier: name.to_string(),
                server: server.clone(),
                username: username.clone(),
                folder: folder.clone(),
                password: password.clone(),
                password_file: password_file.clone(),
                timeout: *timeout,
                auth_type: auth_type.clone(),
                client_id: client_id.clone(),
                tenant: tenant.clone(),
                token: token.clone(),
                config_dir: config_dir.to_path_buf(),
                interactive,
            })?)),
            TargetConfig::Jmap {
                server,
                username,
                token,
                token_file,
                timeout,
            } => Ok(Target::Jmap(JmapTarget::new(
                name,
                server,
                username,
                token.as_deref(),
                token_file.as_deref(),
                *timeout,
            )?)),
            TargetConfig::Maildir { path } => {
                Ok(Target::Maildir(MaildirTarget::new(name, path)?))
            }
            TargetConfig::Pipe { command } => Ok(Target::Pipe(PipeTarget::new(name, command)?)),
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            Target::Imap(t) => t.identifier(),
            Target::Jmap(t) => t.identifier(),
            Target::Maildir(t) => t.identifier(),
            Target::Gmail(t) => t.identifier(),
            Target::Pipe(t) => t.identifier(),
        }
    }

    /// Labels applied when a delivery configures none.
    pub fn default_labels(&self) -> &'static [&'static str] {
        match self {
            Target::Gmail(_) => &["INBOX", "UNREAD"],
            _ => &[],
        }
    }

    /// Establish whatever connection the variant needs; idempotent.
    pub async fn connect(&mut self) -> Result<()> {
        match self {
            Target::Imap(t) => t.connect().await,
            Target::Jmap(t) => t.connect().await,
            Target::Maildir(t) => t.connect(),
            Target::Gmail(t) => t.connect().await,
            Target::Pipe(t) => t.connect(),
        }
    }

    /// Import one message.
    pub async fn import_message(
        &mut self,
        msg: &RawMessage,
        ctx: &DeliveryContext<'_>,
    ) -> Result<ImportOutcome> {
        match self {
            Target::Imap(t) => t.import_message(msg, ctx).await,
            Target::Jmap(t) => t.import_message(msg, ctx).await,
            Target::Maildir(t) => t.import_message(msg, ctx),
            Target::Gmail(t) => t.import_message(msg, ctx).await,
            Target::Pipe(t) => t.import_message(msg, ctx).await,
        }
    }

    /// Tear down connections between pull cycles. Only IMAP holds a
    /// stateful connection; the rest are no-ops.
    pub async fn disconnect(&mut self) {
        if let Target::Imap(t) = self {
            t.disconnect().await;
        }
    }

    /// Whether the target needs interactive (re-)authentication.
    pub fn needs_auth(&self) -> bool {
        match self {
            Target::Imap(t) => t.needs_auth(),
            Target::Gmail(t) => t.needs_auth(),
            _ => false,
        }
    }

    /// Run the interactive authentication flow for OAuth targets.
    pub async fn reauthenticate(&mut self) -> Result<()> {
        match self {
            Target::Imap(t) => t.reauthenticate().await,
            Target::Gmail(t) => t.reauthenticate().await,
            _ => Err(Error::Configuration(format!(
                "target '{}' does not use OAuth authentication",
                self.identifier()
            ))),
        }
    }
}
