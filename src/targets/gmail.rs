//! Gmail target: messages.import over the Gmail API with an
//! installed-application OAuth flow.
//!
//! Scopes cover labels and insertion only; existing mailbox content is
//! never modified.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::expand_tilde;
use crate::error::{Error, Result};
use crate::message::RawMessage;
use crate::targets::oauth2::{quarantine_token_file, save_token_file, OAuth2Token};
use crate::targets::{DeliveryContext, ImportOutcome};

const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const GMAIL_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/gmail.labels",
    "https://www.googleapis.com/auth/gmail.insert",
];

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
    #[serde(default = "default_auth_uri")]
    auth_uri: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialsFile {
    installed: InstalledCredentials,
}

/// Translate label names through the cached name -> id map.
fn labels_to_ids(
    label_map: &HashMap<String, String>,
    labels: &[String],
    identifier: &str,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for label in labels {
        let id = label_map.get(label).ok_or_else(|| {
            Error::Configuration(format!(
                "label '{}' not found in Gmail '{}'",
                label, identifier
            ))
        })?;
        ids.push(id.clone());
    }
    Ok(ids)
}

pub struct GmailTarget {
    identifier: String,
    credentials_file: PathBuf,
    token_file: PathBuf,
    interactive: bool,
    token: Option<OAuth2Token>,
    label_map: Option<HashMap<String, String>>,
    client: reqwest::Client,
    needs_auth: bool,
}

impl GmailTarget {
    pub fn new(
        identifier: &str,
        credentials_file: &str,
        token_file: &str,
        interactive: bool,
    ) -> Result<Self> {
        let token_file = expand_tilde(token_file);
        let client = reqwest::Client::builder()
            .user_agent(crate::user_agent())
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let mut target = Self {
            identifier: identifier.to_string(),
            credentials_file: expand_tilde(credentials_file),
            token_file,
            interactive,
            token: None,
            label_map: None,
            client,
            needs_auth: true,
        };
        target.load_token();
        Ok(target)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn needs_auth(&self) -> bool {
        self.needs_auth
    }

    fn load_token(&mut self) {
        if !self.token_file.exists() {
            return;
        }
        match std::fs::read_to_string(&self.token_file)
            .map_err(Error::Io)
            .and_then(|content| serde_json::from_str(&content).map_err(Error::Json))
        {
            Ok(token) => {
                self.token = Some(token);
                self.needs_auth = false;
            }
            Err(e) => {
                log::warn!(
                    "failed to load Gmail token from {}: {}",
                    self.token_file.display(),
                    e
                );
            }
        }
    }

    fn auth_error(&self, reason: impl Into<String>) -> Error {
        Error::Authentication {
            target_id: self.identifier.clone(),
            reason: reason.into(),
        }
    }

    fn load_credentials(&self) -> Result<InstalledCredentials> {
        if !self.credentials_file.exists() {
            return Err(Error::Configuration(format!(
                "{} not found. Please download it from Google Cloud Console",
                self.credentials_file.display()
            )));
        }
        let parsed: CredentialsFile =
            serde_json::from_str(&std::fs::read_to_string(&self.credentials_file)?).map_err(
                |e| {
                    Error::Configuration(format!(
                        "invalid credentials file {}: {}",
                        self.credentials_file.display(),
                        e
                    ))
                },
            )?;
        Ok(parsed.installed)
    }

    fn oauth_http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .user_agent(crate::user_agent())
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))
    }

    async fn refresh_token(&mut self) -> Result<()> {
        let refresh_token = self
            .token
            .as_ref()
            .map(|t| t.refresh_token.clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.auth_error("no refresh token available"))?;

        let creds = self.load_credentials()?;
        let client = BasicClient::new(ClientId::new(creds.client_id))
            .set_client_secret(ClientSecret::new(creds.client_secret))
            .set_auth_uri(
                AuthUrl::new(creds.auth_uri)
                    .map_err(|e| Error::Configuration(format!("invalid auth URI: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(creds.token_uri)
                    .map_err(|e| Error::Configuration(format!("invalid token URI: {}", e)))?,
            );

        let result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&self.oauth_http_client()?)
            .await;

        match result {
            Ok(response) => {
                self.store_token_response(&response, Some(refresh_token))?;
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "gmail token for {} has expired or been revoked: {}",
                    self.identifier,
                    e
                );
                quarantine_token_file(&self.token_file);
                self.token = None;
                self.needs_auth = true;
                Err(self.auth_error("token is invalid, please re-authenticate"))
            }
        }
    }

    fn store_token_response(
        &mut self,
        response: &oauth2::basic::BasicTokenResponse,
        old_refresh: Option<String>,
    ) -> Result<()> {
        let expires_in = response
            .expires_in()
            .map(|d| d.as_secs() as i64)
            .unwrap_or(3600);
        let token = OAuth2Token {
            access_token: response.access_token().secret().clone(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(old_refresh)
                .unwrap_or_default(),
            expires_at: Utc::now().timestamp() + expires_in,
            token_type: "Bearer".to_string(),
            scope: GMAIL_SCOPES.join(" "),
        };
        save_token_file(&self.token_file, &token)?;
        self.token = Some(token);
        self.needs_auth = false;
        Ok(())
    }

    /// Interactive installed-app flow with a loopback redirect.
    async fn run_auth_flow(&mut self) -> Result<()> {
        let creds = self.load_credentials()?;
        log::info!("log in to the Gmail account for {}", self.identifier);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::Remote(format!("failed to bind callback listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Remote(format!("failed to read listener address: {}", e)))?
            .port();

        let client = BasicClient::new(ClientId::new(creds.client_id))
            .set_client_secret(ClientSecret::new(creds.client_secret))
            .set_auth_uri(
                AuthUrl::new(creds.auth_uri)
                    .map_err(|e| Error::Configuration(format!("invalid auth URI: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(creds.token_uri)
                    .map_err(|e| Error::Configuration(format!("invalid token URI: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(format!("http://localhost:{}/", port))
                    .map_err(|e| Error::Configuration(format!("invalid redirect URL: {}", e)))?,
            );

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut authorize = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent");
        for scope in GMAIL_SCOPES {
            authorize = authorize.add_scope(Scope::new(scope.to_string()));
        }
        let (authorize_url, csrf_state) = authorize.url();

        log::info!("if the browser does not open, visit: {}", authorize_url);
        let _ = std::process::Command::new("xdg-open")
            .arg(authorize_url.as_str())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();

        let code = crate::targets::oauth2::wait_for_auth_code(listener, csrf_state.secret())
            .await
            .map_err(|e| match e {
                Error::Authentication { reason, .. } => self.auth_error(reason),
                other => other,
            })?;

        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(&self.oauth_http_client()?)
            .await
            .map_err(|e| self.auth_error(format!("failed to exchange authorization code: {}", e)))?;

        self.store_token_response(&response, None)?;
        log::info!("authentication successful for {}", self.identifier);
        Ok(())
    }

    /// A valid access token, refreshing or running the interactive
    /// flow as needed.
    async fn ensure_token(&mut self) -> Result<String> {
        match &self.token {
            Some(token) if !token.is_expired() => {
                return Ok(token.access_token.clone());
            }
            Some(_) => {
                self.refresh_token().await?;
            }
            None => {
                // Nothing persisted: full flow, unless we are not
                // allowed to interact.
                self.load_credentials()?;
                if !self.interactive {
                    self.needs_auth = true;
                    return Err(self.auth_error("Gmail target requires authentication"));
                }
                self.run_auth_flow().await?;
            }
        }
        self.token
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| self.auth_error("no valid token available"))
    }

    pub async fn reauthenticate(&mut self) -> Result<()> {
        self.token = None;
        self.run_auth_flow().await?;
        self.label_map = None;
        Ok(())
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.ensure_token().await?;
        log::debug!("connected to Gmail for {}", self.identifier);
        Ok(())
    }

    /// All labels of the mailbox.
    pub async fn list_labels(&mut self) -> Result<Vec<Value>> {
        let token = self.ensure_token().await?;
        let response: Value = self
            .client
            .get(format!("{}/labels", GMAIL_API))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Remote(format!("failed to list Gmail labels: {}", e)))?
            .json()
            .await?;
        Ok(response
            .get("labels")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Translate label names to Gmail label ids; the full label list
    /// is fetched once and cached.
    pub async fn translate_labels(&mut self, labels: &[String]) -> Result<Vec<String>> {
        if self.label_map.is_none() {
            let mut map = HashMap::new();
            for label in self.list_labels().await? {
                let name = label.get("name").and_then(|v| v.as_str());
                let id = label.get("id").and_then(|v| v.as_str());
                if let (Some(name), Some(id)) = (name, id) {
                    map.insert(name.to_string(), id.to_string());
                }
            }
            self.label_map = Some(map);
        }
        labels_to_ids(
            self.label_map.as_ref().expect("just populated"),
            labels,
            &self.identifier,
        )
    }

    /// Import via `messages.import` with URL-safe base64 raw bytes.
    pub async fn import_message(
        &mut self,
        msg: &RawMessage,
        ctx: &DeliveryContext<'_>,
    ) -> Result<ImportOutcome> {
        let payload = msg.as_bytes(Some(ctx.feed_name), Some(ctx.delivery_name));
        let mut body = json!({ "raw": URL_SAFE.encode(&payload) });
        if !ctx.labels.is_empty() {
            let label_ids = self.translate_labels(ctx.labels).await?;
            body["labelIds"] = json!(label_ids);
        }

        let token = self.ensure_token().await?;
        let response: Value = self
            .client
            .post(format!("{}/messages/import", GMAIL_API))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Remote(format!("Gmail import failed: {}", e)))?
            .json()
            .await?;

        let id = response
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(ImportOutcome::Delivered(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_parsing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let creds_path = tmp.path().join("credentials.json");
        std::fs::write(
            &creds_path,
            r#"{"installed": {"client_id": "cid", "client_secret": "secret"}}"#,
        )
        .unwrap();

        let target = GmailTarget::new(
            "personal",
            creds_path.to_str().unwrap(),
            tmp.path().join("token.json").to_str().unwrap(),
            true,
        )
        .unwrap();
        let creds = target.load_credentials().unwrap();
        assert_eq!(creds.client_id, "cid");
        assert_eq!(creds.auth_uri, default_auth_uri());
        assert_eq!(creds.token_uri, default_token_uri());
    }

    #[test]
    fn test_missing_credentials_is_configuration_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = GmailTarget::new(
            "personal",
            tmp.path().join("missing.json").to_str().unwrap(),
            tmp.path().join("token.json").to_str().unwrap(),
            true,
        )
        .unwrap();
        assert!(matches!(
            target.load_credentials().unwrap_err(),
            Error::Configuration(_)
        ));
        assert!(target.needs_auth());
    }

    #[test]
    fn test_existing_token_clears_needs_auth() {
        let tmp = tempfile::TempDir::new().unwrap();
        let token_path = tmp.path().join("token.json");
        std::fs::write(
            &token_path,
            r#"{"access_token": "a", "refresh_token": "r", "expires_at": 9999999999}"#,
        )
        .unwrap();

        let target = GmailTarget::new(
            "personal",
            tmp.path().join("credentials.json").to_str().unwrap(),
            token_path.to_str().unwrap(),
            true,
        )
        .unwrap();
        assert!(!target.needs_auth());
    }

    #[test]
    fn test_label_translation() {
        let mut map = HashMap::new();
        map.insert("INBOX".to_string(), "INBOX".to_string());
        map.insert("kernel".to_string(), "Label_42".to_string());

        let ids = labels_to_ids(
            &map,
            &["INBOX".to_string(), "kernel".to_string()],
            "personal",
        )
        .unwrap();
        assert_eq!(ids, vec!["INBOX", "Label_42"]);

        let err =
            labels_to_ids(&map, &["missing".to_string()], "personal").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("missing"));
    }
}
