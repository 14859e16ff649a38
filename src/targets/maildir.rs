//! Maildir target: atomic local delivery via tmp/ -> new/.

use std::collections::HashMap;
use std::path::PathBuf;

use maildir::Maildir;

use crate::config::expand_tilde;
use crate::error::{Error, Result};
use crate::message::RawMessage;
use crate::targets::{DeliveryContext, ImportOutcome};

pub struct MaildirTarget {
    identifier: String,
    base_path: PathBuf,
    maildir: Maildir,
    subfolders: HashMap<String, Maildir>,
}

impl MaildirTarget {
    pub fn new(identifier: &str, maildir_path: &str) -> Result<Self> {
        let base_path = expand_tilde(maildir_path);

        if let Some(parent) = base_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Configuration(format!(
                    "failed to initialize maildir at {}: {}",
                    base_path.display(),
                    e
                ))
            })?;
        }
        let maildir = Maildir::from(base_path.clone());
        maildir.create_dirs().map_err(|e| {
            Error::Configuration(format!(
                "failed to initialize maildir at {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(Self {
            identifier: identifier.to_string(),
            base_path,
            maildir,
            subfolders: HashMap::new(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn connect(&mut self) -> Result<()> {
        log::debug!("maildir target ready at {}", self.base_path.display());
        Ok(())
    }

    /// The maildir to deliver into: the base maildir, or a child
    /// maildir materialized on first use and cached per subfolder.
    fn maildir_for(&mut self, subfolder: Option<&str>) -> Result<&Maildir> {
        let Some(subfolder) = subfolder else {
            return Ok(&self.maildir);
        };

        if !self.subfolders.contains_key(subfolder) {
            let path = self.base_path.join(subfolder);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Configuration(format!(
                        "failed to create maildir at {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
            let child = Maildir::from(path.clone());
            child.create_dirs().map_err(|e| {
                Error::Configuration(format!(
                    "failed to create maildir at {}: {}",
                    path.display(),
                    e
                ))
            })?;
            log::debug!("created subfolder maildir at {}", path.display());
            self.subfolders.insert(subfolder.to_string(), child);
        }

        Ok(&self.subfolders[subfolder])
    }

    /// Labels are ignored for maildir; the subfolder (already
    /// strftime-expanded by the delivery map) picks the child maildir.
    pub fn import_message(
        &mut self,
        msg: &RawMessage,
        ctx: &DeliveryContext<'_>,
    ) -> Result<ImportOutcome> {
        let payload = msg.as_bytes(Some(ctx.feed_name), Some(ctx.delivery_name));
        let maildir = self.maildir_for(ctx.subfolder)?;
        let key = maildir
            .store_new(&payload)
            .map_err(|e| Error::Configuration(format!("failed to deliver to maildir: {}", e)))?;
        log::debug!("delivered message to maildir with key: {}", key);
        Ok(ImportOutcome::Delivered(Some(key)))
    }
}
