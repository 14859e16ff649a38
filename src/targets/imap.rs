//! IMAP target: implicit TLS on port 993, password or XOAUTH2
//! authentication, Message-ID deduplication before APPEND.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_imap::Session;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::expand_tilde;
use crate::error::{Error, Result};
use crate::message::RawMessage;
use crate::targets::oauth2::MsOAuthenticator;
use crate::targets::{DeliveryContext, ImportOutcome};

type ImapSession = Session<TlsStream<TcpStream>>;

pub struct ImapConfig {
    pub identifier: String,
    pub server: String,
    pub username: String,
    pub folder: String,
    pub password: Option<String>,
    pub password_file: Option<String>,
    pub timeout: u64,
    pub auth_type: String,
    pub client_id: Option<String>,
    pub tenant: String,
    pub token: Option<String>,
    pub config_dir: PathBuf,
    pub interactive: bool,
}

#[derive(Debug)]
enum ImapAuth {
    Password(String),
    OAuth2(MsOAuthenticator),
}

struct Xoauth2 {
    auth_string: String,
}

impl async_imap::Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.auth_string.clone()
    }
}

#[derive(Debug)]
pub struct ImapTarget {
    identifier: String,
    server: String,
    username: String,
    folder: String,
    timeout: Duration,
    auth: ImapAuth,
    session: Option<ImapSession>,
}

impl ImapTarget {
    pub fn new(cfg: ImapConfig) -> Result<Self> {
        if cfg.server.is_empty() {
            return Err(Error::Configuration(format!(
                "no server specified for IMAP target: {}",
                cfg.identifier
            )));
        }
        if cfg.username.is_empty() {
            return Err(Error::Configuration(format!(
                "no username specified for IMAP target: {}",
                cfg.identifier
            )));
        }

        let auth = match cfg.auth_type.as_str() {
            "password" => {
                let password = if let Some(password) = cfg.password {
                    password
                } else if let Some(file) = cfg.password_file {
                    let path = expand_tilde(&file);
                    if !path.exists() {
                        return Err(Error::Configuration(format!(
                            "password file not found: {}",
                            file
                        )));
                    }
                    std::fs::read_to_string(&path)?.trim_end().to_string()
                } else {
                    return Err(Error::Configuration(format!(
                        "no password or password_file specified for IMAP target: {}",
                        cfg.identifier
                    )));
                };
                ImapAuth::Password(password)
            }
            "oauth2" => {
                let token_file = match cfg.token {
                    Some(token) => expand_tilde(&token),
                    None => cfg
                        .config_dir
                        .join(format!("imap-{}-oauth2-token.json", cfg.identifier)),
                };
                ImapAuth::OAuth2(MsOAuthenticator::new(
                    &cfg.identifier,
                    &cfg.username,
                    cfg.client_id.as_deref(),
                    &cfg.tenant,
                    token_file,
                    cfg.interactive,
                ))
            }
            other => {
                return Err(Error::Configuration(format!(
                    "invalid auth_type '{}' for IMAP target: {}. Must be 'password' or 'oauth2'",
                    other, cfg.identifier
                )));
            }
        };

        Ok(Self {
            identifier: cfg.identifier,
            server: cfg.server,
            username: cfg.username,
            folder: cfg.folder,
            timeout: Duration::from_secs(cfg.timeout),
            auth,
            session: None,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn needs_auth(&self) -> bool {
        match &self.auth {
            ImapAuth::OAuth2(auth) => auth.needs_auth(),
            ImapAuth::Password(_) => false,
        }
    }

    pub async fn reauthenticate(&mut self) -> Result<()> {
        match &mut self.auth {
            ImapAuth::OAuth2(auth) => {
                auth.reauthenticate().await?;
                // Force a reconnect with the fresh credentials.
                self.session = None;
                Ok(())
            }
            ImapAuth::Password(_) => Err(Error::Configuration(format!(
                "target '{}' is not configured for OAuth2 authentication",
                self.identifier
            ))),
        }
    }

    async fn open_tls(&self) -> Result<TlsStream<TcpStream>> {
        let tcp = match tokio::time::timeout(
            self.timeout,
            TcpStream::connect((self.server.as_str(), 993)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::Remote(format!(
                    "IMAP connection to {} failed: {}",
                    self.server, e
                )));
            }
            Err(_) => {
                return Err(Error::Remote(format!(
                    "IMAP connection to {} timed out",
                    self.server
                )));
            }
        };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let dns_name = ServerName::try_from(self.server.clone()).map_err(|_| {
            Error::Configuration(format!("invalid IMAP server name: {}", self.server))
        })?;

        match tokio::time::timeout(self.timeout, connector.connect(dns_name, tcp)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(Error::Remote(format!(
                "TLS handshake with {} failed: {}",
                self.server, e
            ))),
            Err(_) => Err(Error::Remote(format!(
                "TLS handshake with {} timed out",
                self.server
            ))),
        }
    }

    /// Connect, authenticate, and verify the target folder exists.
    /// Idempotent; folders are never auto-created on the server.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let tls = self.open_tls().await?;
        let client = async_imap::Client::new(tls);

        let mut session = match &mut self.auth {
            ImapAuth::Password(password) => client
                .login(&self.username, password)
                .await
                .map_err(|(e, _)| {
                    Error::Remote(format!(
                        "IMAP authentication failed for {}: {}",
                        self.server, e
                    ))
                })?,
            ImapAuth::OAuth2(auth) => {
                let authenticator = Xoauth2 {
                    auth_string: auth.xoauth2_string().await?,
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|(e, _)| {
                        Error::Remote(format!(
                            "IMAP XOAUTH2 authentication failed for {}: {}",
                            self.server, e
                        ))
                    })?
            }
        };

        match tokio::time::timeout(self.timeout, session.examine(&self.folder)).await {
            Ok(Ok(_mailbox)) => {}
            Ok(Err(e)) => {
                return Err(Error::Configuration(format!(
                    "folder '{}' does not exist on IMAP server {}: {}",
                    self.folder, self.server, e
                )));
            }
            Err(_) => {
                return Err(Error::Remote(format!(
                    "IMAP EXAMINE of '{}' timed out",
                    self.folder
                )));
            }
        }

        log::debug!(
            "IMAP target ready: server={}, folder={}",
            self.server,
            self.folder
        );
        self.session = Some(session);
        Ok(())
    }

    /// Whether a message with this Message-ID is already in the target
    /// folder. Search problems fail open so a flaky SEARCH cannot
    /// block delivery.
    async fn message_exists(&mut self, message_id: &str) -> bool {
        let timeout = self.timeout;
        let folder = self.folder.clone();
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        match tokio::time::timeout(timeout, session.examine(&folder)).await {
            Ok(Ok(_)) => {}
            _ => {
                log::debug!("failed to select folder {} for search", folder);
                return false;
            }
        }

        let query = format!("HEADER Message-ID \"{}\"", message_id);
        match tokio::time::timeout(timeout, session.uid_search(&query)).await {
            Ok(Ok(uids)) => {
                if uids.is_empty() {
                    false
                } else {
                    log::debug!(
                        "message {} already exists in folder {}",
                        message_id,
                        folder
                    );
                    true
                }
            }
            Ok(Err(e)) => {
                log::debug!("failed to check for existing message: {}", e);
                false
            }
            Err(_) => {
                log::debug!("IMAP SEARCH timed out");
                false
            }
        }
    }

    /// Deliver one message: SEARCH for the Message-ID first, then
    /// APPEND with no flags (unread) and no internal date (server
    /// time). Labels are ignored; only the configured folder matters.
    pub async fn import_message(
        &mut self,
        msg: &RawMessage,
        ctx: &DeliveryContext<'_>,
    ) -> Result<ImportOutcome> {
        self.connect().await?;

        if let Some(message_id) = msg.message_id() {
            let message_id = message_id.to_string();
            if self.message_exists(&message_id).await {
                log::debug!(
                    "skipping import: message {} already in folder {}",
                    message_id,
                    self.folder
                );
                return Ok(ImportOutcome::Skipped);
            }
        }

        let payload = msg.as_bytes(Some(ctx.feed_name), Some(ctx.delivery_name));
        let timeout = self.timeout;
        let folder = self.folder.clone();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Remote("IMAP connection not established".to_string()))?;

        match tokio::time::timeout(timeout, session.append(&folder, None, None, &payload)).await
        {
            Ok(Ok(())) => {
                log::debug!("delivered message to IMAP folder {}", folder);
                Ok(ImportOutcome::Delivered(None))
            }
            Ok(Err(e)) => Err(Error::Remote(format!(
                "failed to append message to folder '{}': {}",
                folder, e
            ))),
            Err(_) => Err(Error::Remote(format!(
                "IMAP APPEND to '{}' timed out",
                folder
            ))),
        }
    }

    /// Log out and drop the connection so it is not held between pull
    /// cycles.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            match tokio::time::timeout(self.timeout, session.logout()).await {
                Ok(Ok(())) => log::debug!("IMAP connection closed for {}", self.identifier),
                Ok(Err(e)) => log::debug!(
                    "error closing IMAP connection for {}: {}",
                    self.identifier,
                    e
                ),
                Err(_) => log::debug!("IMAP LOGOUT timed out for {}", self.identifier),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ImapConfig {
        ImapConfig {
            identifier: "work".to_string(),
            server: "imap.example.com".to_string(),
            username: "me@example.com".to_string(),
            folder: "INBOX".to_string(),
            password: Some("hunter2".to_string()),
            password_file: None,
            timeout: 60,
            auth_type: "password".to_string(),
            client_id: None,
            tenant: "common".to_string(),
            token: None,
            config_dir: PathBuf::from("/tmp"),
            interactive: true,
        }
    }

    #[test]
    fn test_missing_server_rejected() {
        let cfg = ImapConfig {
            server: String::new(),
            ..base_config()
        };
        assert!(matches!(
            ImapTarget::new(cfg).unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_missing_username_rejected() {
        let cfg = ImapConfig {
            username: String::new(),
            ..base_config()
        };
        assert!(matches!(
            ImapTarget::new(cfg).unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_invalid_auth_type_rejected() {
        let cfg = ImapConfig {
            auth_type: "kerberos".to_string(),
            ..base_config()
        };
        let err = ImapTarget::new(cfg).unwrap_err();
        assert!(err.to_string().contains("auth_type"));
    }

    #[test]
    fn test_password_file_trailing_whitespace_stripped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let password_path = tmp.path().join("password");
        std::fs::write(&password_path, "secret\n").unwrap();

        let cfg = ImapConfig {
            password: None,
            password_file: Some(password_path.to_string_lossy().to_string()),
            ..base_config()
        };
        let target = ImapTarget::new(cfg).unwrap();
        match &target.auth {
            ImapAuth::Password(pw) => assert_eq!(pw, "secret"),
            _ => panic!("expected password auth"),
        }
    }

    #[test]
    fn test_missing_password_rejected() {
        let cfg = ImapConfig {
            password: None,
            ..base_config()
        };
        assert!(matches!(
            ImapTarget::new(cfg).unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_oauth2_without_password_accepted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = ImapConfig {
            password: None,
            auth_type: "oauth2".to_string(),
            config_dir: tmp.path().to_path_buf(),
            ..base_config()
        };
        let target = ImapTarget::new(cfg).unwrap();
        assert!(target.needs_auth());
    }
}
