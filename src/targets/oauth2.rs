//! OAuth2 for IMAP: Microsoft 365 PKCE authorization-code flow.
//!
//! Tokens persist in a JSON file with owner-only permissions, written
//! atomically. A token that fails to refresh is parked under an
//! `.invalid` suffix so a human can inspect it and the next run
//! re-authenticates. Non-interactive callers get an authentication
//! error instead of a browser flow.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl,
    RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{Error, Result};

const MS_AUTH_URL: &str = "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize";
const MS_TOKEN_URL: &str = "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token";

const IMAP_SCOPE: &str = "https://outlook.office.com/IMAP.AccessAsUser.All";
const OFFLINE_SCOPE: &str = "offline_access";

/// Default Azure AD application (client) id. Users whose tenant blocks
/// third-party applications can override it with their own
/// registration.
pub const DEFAULT_CLIENT_ID: &str = "96202974-99c3-4d7d-b2a5-1f57fe7f114c";

/// Refresh when within this many seconds of expiry.
const EXPIRY_BUFFER: i64 = 300;

/// How long to wait for the browser redirect.
const AUTH_FLOW_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for token endpoint requests.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Token {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp of expiry.
    pub expires_at: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuth2Token {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at - EXPIRY_BUFFER
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(TOKEN_TIMEOUT)
        .user_agent(crate::user_agent())
        .build()
        .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))
}

/// Atomically write a token file with owner-only permissions.
pub fn save_token_file(path: &Path, token: &impl Serialize) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(serde_json::to_string_pretty(token)?.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    log::debug!("saved OAuth2 token to {}", path.display());
    Ok(())
}

/// Park a token file under `<file>.invalid`, replacing any previous
/// quarantined copy.
pub fn quarantine_token_file(path: &Path) {
    if !path.exists() {
        return;
    }
    let invalid = PathBuf::from(format!("{}.invalid", path.display()));
    if invalid.exists() {
        let _ = std::fs::remove_file(&invalid);
    }
    if let Err(e) = std::fs::rename(path, &invalid) {
        log::warn!("failed to quarantine token file {}: {}", path.display(), e);
    }
}

/// Catch a single OAuth redirect on a loopback listener and return the
/// authorization code after verifying the CSRF state.
pub async fn wait_for_auth_code(listener: TcpListener, expected_state: &str) -> Result<String> {
    let accept = tokio::time::timeout(AUTH_FLOW_TIMEOUT, listener.accept()).await;
    let (mut stream, _) = accept
        .map_err(|_| Error::Authentication {
            target_id: String::new(),
            reason: "OAuth2 authentication timed out or was cancelled".to_string(),
        })?
        .map_err(|e| Error::Remote(format!("callback listener failed: {}", e)))?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Remote(format!("failed to read callback request: {}", e)))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 64 * 1024 {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let result = parse_callback_request(&request, expected_state);

    let body = match &result {
        Ok(_) => {
            "<!DOCTYPE html>\n<html><head><title>Authentication Successful</title></head>\n\
             <body><h1>Authentication Successful</h1>\n\
             <p>You can close this window and return to korgalore.</p></body></html>"
                .to_string()
        }
        Err(e) => format!(
            "<!DOCTYPE html>\n<html><head><title>Authentication Failed</title></head>\n\
             <body><h1>Authentication Failed</h1>\n<p>Error: {}</p>\n\
             <p>Please close this window and try again.</p></body></html>",
            e
        ),
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    result
}

/// Pull `code` and `state` out of the callback's request line.
fn parse_callback_request(request: &str, expected_state: &str) -> Result<String> {
    let first_line = request.lines().next().unwrap_or("");
    let path = first_line.split_whitespace().nth(1).unwrap_or("");
    let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            "error_description" | "error" if error.is_none() => {
                error = Some(value.replace('+', " "))
            }
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(Error::Authentication {
            target_id: String::new(),
            reason: format!("OAuth2 authentication failed: {}", error),
        });
    }
    let code = code.ok_or_else(|| Error::Authentication {
        target_id: String::new(),
        reason: "OAuth2 callback carried no authorization code".to_string(),
    })?;
    if state.as_deref() != Some(expected_state) {
        return Err(Error::Authentication {
            target_id: String::new(),
            reason: "state mismatch - possible CSRF attack".to_string(),
        });
    }
    Ok(code)
}

/// Best-effort attempt to open the system browser.
fn open_browser(url: &str) {
    let _ = std::process::Command::new("xdg-open")
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
}

/// OAuth2 authenticator for IMAP XOAUTH2 against Microsoft 365.
#[derive(Debug)]
pub struct MsOAuthenticator {
    pub identifier: String,
    pub username: String,
    client_id: String,
    tenant: String,
    token_file: PathBuf,
    interactive: bool,
    token: Option<OAuth2Token>,
    needs_auth: bool,
}

impl MsOAuthenticator {
    pub fn new(
        identifier: &str,
        username: &str,
        client_id: Option<&str>,
        tenant: &str,
        token_file: PathBuf,
        interactive: bool,
    ) -> Self {
        let mut auth = Self {
            identifier: identifier.to_string(),
            username: username.to_string(),
            client_id: client_id.unwrap_or(DEFAULT_CLIENT_ID).to_string(),
            tenant: tenant.to_string(),
            token_file,
            interactive,
            token: None,
            needs_auth: true,
        };
        auth.load_token();
        auth
    }

    fn load_token(&mut self) {
        if !self.token_file.exists() {
            self.needs_auth = true;
            return;
        }
        match std::fs::read_to_string(&self.token_file)
            .map_err(Error::Io)
            .and_then(|content| serde_json::from_str(&content).map_err(Error::Json))
        {
            Ok(token) => {
                log::debug!(
                    "loaded OAuth2 token for {} from {}",
                    self.identifier,
                    self.token_file.display()
                );
                self.token = Some(token);
                self.needs_auth = false;
            }
            Err(e) => {
                log::warn!(
                    "failed to load OAuth2 token from {}: {}",
                    self.token_file.display(),
                    e
                );
                self.token = None;
                self.needs_auth = true;
            }
        }
    }

    pub fn needs_auth(&self) -> bool {
        self.token.is_none() || self.needs_auth
    }

    fn auth_error(&self, reason: impl Into<String>) -> Error {
        Error::Authentication {
            target_id: self.identifier.clone(),
            reason: reason.into(),
        }
    }

    fn endpoints(&self) -> Result<(AuthUrl, TokenUrl)> {
        let auth = AuthUrl::new(MS_AUTH_URL.replace("{tenant}", &self.tenant))
            .map_err(|e| Error::Configuration(format!("invalid auth URL: {}", e)))?;
        let token = TokenUrl::new(MS_TOKEN_URL.replace("{tenant}", &self.tenant))
            .map_err(|e| Error::Configuration(format!("invalid token URL: {}", e)))?;
        Ok((auth, token))
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
            scope: format!("{} {}", IMAP_SCOPE, OFFLINE_SCOPE),
        };
        save_token_file(&self.token_file, &token)?;
        self.token = Some(token);
        self.needs_auth = false;
        Ok(())
    }

    /// A valid access token, refreshed or re-acquired as needed.
    pub async fn access_token(&mut self) -> Result<String> {
        if self.token.is_none() {
            if !self.interactive {
                self.needs_auth = true;
                return Err(self.auth_error("IMAP OAuth2 target requires authentication"));
            }
            self.run_auth_flow().await?;
        }

        if self.token.as_ref().is_some_and(|t| t.is_expired()) {
            match self.refresh().await {
                Ok(()) => {}
                Err(e) => {
                    if !self.interactive {
                        self.needs_auth = true;
                        return Err(e);
                    }
                    self.run_auth_flow().await?;
                }
            }
        }

        self.token
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| self.auth_error("no valid token available"))
    }

    async fn refresh(&mut self) -> Result<()> {
        let refresh_token = self
            .token
            .as_ref()
            .map(|t| t.refresh_token.clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.auth_error("no refresh token available"))?;

        log::debug!("refreshing OAuth2 token for {}", self.identifier);
        let (auth_url, token_url) = self.endpoints()?;
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url);

        let result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .add_scope(Scope::new(IMAP_SCOPE.to_string()))
            .add_scope(Scope::new(OFFLINE_SCOPE.to_string()))
            .request_async(&http_client()?)
            .await;

        match result {
            Ok(response) => {
                self.store_token_response(&response, Some(refresh_token))?;
                log::debug!("OAuth2 token refreshed for {}", self.identifier);
                Ok(())
            }
            Err(e) => {
                log::warn!("token refresh failed for {}: {}", self.identifier, e);
                quarantine_token_file(&self.token_file);
                self.token = None;
                self.needs_auth = true;
                Err(self.auth_error("token refresh failed, please re-authenticate"))
            }
        }
    }

    /// Interactive PKCE flow: local redirect catcher, system browser,
    /// code exchange.
    async fn run_auth_flow(&mut self) -> Result<()> {
        log::info!(
            "starting OAuth2 authentication for IMAP target {}",
            self.identifier
        );

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::Remote(format!("failed to bind callback listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Remote(format!("failed to read listener address: {}", e)))?
            .port();
        let redirect_uri = RedirectUrl::new(format!("http://localhost:{}/", port))
            .map_err(|e| Error::Configuration(format!("invalid redirect URL: {}", e)))?;

        let (auth_url, token_url) = self.endpoints()?;
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_uri);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (authorize_url, csrf_state) = client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(IMAP_SCOPE.to_string()))
            .add_scope(Scope::new(OFFLINE_SCOPE.to_string()))
            .set_pkce_challenge(pkce_challenge)
            .add_extra_param("login_hint", &self.username)
            .url();

        log::info!("opening browser for Microsoft 365 authentication...");
        log::info!("if the browser does not open, visit: {}", authorize_url);
        open_browser(authorize_url.as_str());

        let code = wait_for_auth_code(listener, csrf_state.secret())
            .await
            .map_err(|e| match e {
                Error::Authentication { reason, .. } => self.auth_error(reason),
                other => other,
            })?;

        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(&http_client()?)
            .await
            .map_err(|e| self.auth_error(format!("failed to exchange authorization code: {}", e)))?;

        self.store_token_response(&response, None)?;
        log::info!("OAuth2 authentication successful for {}", self.identifier);
        Ok(())
    }

    /// Discard the current token and run the full flow again.
    pub async fn reauthenticate(&mut self) -> Result<()> {
        self.token = None;
        self.run_auth_flow().await
    }

    /// The XOAUTH2 SASL string:
    /// `user=<user>\x01auth=Bearer <token>\x01\x01`.
    pub async fn xoauth2_string(&mut self) -> Result<String> {
        let access_token = self.access_token().await?;
        Ok(build_xoauth2_string(&self.username, &access_token))
    }
}

pub fn build_xoauth2_string(username: &str, access_token: &str) -> String {
    format!("user={}\x01auth=Bearer {}\x01\x01", username, access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xoauth2_string_shape() {
        let s = build_xoauth2_string("me@example.com", "tok123");
        assert_eq!(s, "user=me@example.com\x01auth=Bearer tok123\x01\x01");
        assert_eq!(s.matches('\x01').count(), 3);
    }

    #[test]
    fn test_token_expiry_buffer() {
        let live = OAuth2Token {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now().timestamp() + 3600,
            token_type: "Bearer".into(),
            scope: String::new(),
        };
        assert!(!live.is_expired());

        // Within the 5 minute buffer counts as expired.
        let nearly = OAuth2Token {
            expires_at: Utc::now().timestamp() + 60,
            ..live.clone()
        };
        assert!(nearly.is_expired());

        let gone = OAuth2Token {
            expires_at: Utc::now().timestamp() - 10,
            ..live
        };
        assert!(gone.is_expired());
    }

    #[test]
    fn test_token_file_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("tokens/imap-work-oauth2-token.json");
        let token = OAuth2Token {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: 1700000000,
            token_type: "Bearer".into(),
            scope: "scope".into(),
        };
        save_token_file(&path, &token).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded: OAuth2Token =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.access_token, "access");
        assert_eq!(loaded.expires_at, 1700000000);
    }

    #[test]
    fn test_quarantine_replaces_previous_invalid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("token.json");
        let invalid = tmp.path().join("token.json.invalid");

        std::fs::write(&path, "current").unwrap();
        std::fs::write(&invalid, "older").unwrap();
        quarantine_token_file(&path);

        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(&invalid).unwrap(), "current");
    }

    #[test]
    fn test_parse_callback_request() {
        let request = "GET /?code=abc123&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(parse_callback_request(request, "xyz").unwrap(), "abc123");

        let err = parse_callback_request(request, "other").unwrap_err();
        assert!(err.to_string().contains("state mismatch"));

        let denied =
            "GET /?error=access_denied&error_description=User+denied HTTP/1.1\r\n\r\n";
        let err = parse_callback_request(denied, "xyz").unwrap_err();
        assert!(err.to_string().contains("User denied"));

        let empty = "GET / HTTP/1.1\r\n\r\n";
        assert!(parse_callback_request(empty, "xyz").is_err());
    }

    #[test]
    fn test_missing_token_file_needs_auth() {
        let tmp = tempfile::TempDir::new().unwrap();
        let auth = MsOAuthenticator::new(
            "work",
            "me@example.com",
            None,
            "common",
            tmp.path().join("token.json"),
            true,
        );
        assert!(auth.needs_auth());
        assert_eq!(auth.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_corrupt_token_file_needs_auth() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("token.json");
        std::fs::write(&path, "{not json").unwrap();
        let auth = MsOAuthenticator::new("work", "me@example.com", None, "common", path, true);
        assert!(auth.needs_auth());
    }
}
