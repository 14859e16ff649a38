//! JMAP target: bearer-token delivery via blob upload + Email/import.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::expand_tilde;
use crate::error::{Error, Result};
use crate::message::RawMessage;
use crate::targets::{DeliveryContext, ImportOutcome};

const JMAP_CAPS: [&str; 2] = [
    "urn:ietf:params:jmap:core",
    "urn:ietf:params:jmap:mail",
];

#[derive(Debug)]
pub struct JmapTarget {
    identifier: String,
    server: String,
    username: String,
    token: String,
    timeout: Duration,
    client: reqwest::Client,
    api_url: Option<String>,
    upload_url: Option<String>,
    account_id: Option<String>,
    mailbox_map: Option<HashMap<String, String>>,
}

impl JmapTarget {
    pub fn new(
        identifier: &str,
        server: &str,
        username: &str,
        token: Option<&str>,
        token_file: Option<&str>,
        timeout: u64,
    ) -> Result<Self> {
        let token = match (token, token_file) {
            (Some(token), _) => token.to_string(),
            (None, Some(file)) => {
                let path = expand_tilde(file);
                if !path.exists() {
                    return Err(Error::Configuration(format!(
                        "token file not found for JMAP target '{}': {}",
                        identifier,
                        path.display()
                    )));
                }
                std::fs::read_to_string(&path)?.trim_end().to_string()
            }
            (None, None) => {
                return Err(Error::Configuration(format!(
                    "no token or token_file specified for JMAP target: {}",
                    identifier
                )));
            }
        };

        let client = reqwest::Client::builder()
            .user_agent(crate::user_agent())
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            identifier: identifier.to_string(),
            server: server.trim_end_matches('/').to_string(),
            username: username.to_string(),
            token,
            timeout: Duration::from_secs(timeout),
            client,
            api_url: None,
            upload_url: None,
            account_id: None,
            mailbox_map: None,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Discover the JMAP session: api/upload URLs and the account id
    /// whose name matches the configured username.
    pub async fn connect(&mut self) -> Result<()> {
        if self.api_url.is_some() {
            return Ok(());
        }

        let url = format!("{}/jmap/session", self.server);
        let session: Value = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Remote(format!("failed to discover JMAP session: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Remote(format!("failed to discover JMAP session: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Remote(format!("failed to discover JMAP session: {}", e)))?;

        let api_url = session.get("apiUrl").and_then(|v| v.as_str());
        let upload_url = session.get("uploadUrl").and_then(|v| v.as_str());
        let (Some(api_url), Some(upload_url)) = (api_url, upload_url) else {
            return Err(Error::Remote(
                "JMAP session response missing apiUrl or uploadUrl".to_string(),
            ));
        };

        let accounts = session
            .get("accounts")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let account_id = accounts
            .iter()
            .find(|(_, account)| {
                account.get("name").and_then(|n| n.as_str()) == Some(self.username.as_str())
            })
            .map(|(id, _)| id.clone())
            .or_else(|| accounts.keys().next().cloned())
            .ok_or_else(|| {
                Error::Remote(format!(
                    "no JMAP account found for user {}",
                    self.username
                ))
            })?;

        self.upload_url = Some(upload_url.replace("{accountId}", &account_id));
        self.api_url = Some(api_url.to_string());
        self.account_id = Some(account_id);
        log::debug!(
            "JMAP session ready for {}: account {}",
            self.identifier,
            self.account_id.as_deref().unwrap_or("?")
        );
        Ok(())
    }

    async fn api_request(&self, body: Value) -> Result<Value> {
        let api_url = self
            .api_url
            .as_ref()
            .ok_or_else(|| Error::Remote("JMAP session not initialized".to_string()))?;
        let response: Value = self
            .client
            .post(api_url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Remote(format!("JMAP API request failed: {}", e)))?
            .json()
            .await?;
        Ok(response)
    }

    /// All mailboxes of the account, via `Mailbox/query` plus a
    /// back-referenced `Mailbox/get`.
    pub async fn list_mailboxes(&self) -> Result<Vec<Value>> {
        let account_id = self
            .account_id
            .as_ref()
            .ok_or_else(|| Error::Remote("JMAP session not initialized".to_string()))?;

        let body = json!({
            "using": JMAP_CAPS,
            "methodCalls": [
                ["Mailbox/query", {"accountId": account_id}, "call-0"],
                ["Mailbox/get", {
                    "accountId": account_id,
                    "#ids": {
                        "resultOf": "call-0",
                        "name": "Mailbox/query",
                        "path": "/ids"
                    }
                }, "call-1"]
            ]
        });

        let response = self
            .api_request(body)
            .await
            .map_err(|e| Error::Remote(format!("failed to list mailboxes: {}", e)))?;

        let mut mailboxes = Vec::new();
        for method_response in response
            .get("methodResponses")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let name = method_response.get(0).and_then(|v| v.as_str());
            if name != Some("Mailbox/get") {
                continue;
            }
            if let Some(list) = method_response
                .get(1)
                .and_then(|v| v.get("list"))
                .and_then(|v| v.as_array())
            {
                mailboxes.extend(list.iter().cloned());
            }
        }
        Ok(mailboxes)
    }

    async fn mailbox_map(&mut self) -> Result<&HashMap<String, String>> {
        if self.mailbox_map.is_none() {
            let mut map = HashMap::new();
            for mailbox in self.list_mailboxes().await? {
                let Some(id) = mailbox.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if let Some(name) = mailbox.get("name").and_then(|v| v.as_str()) {
                    map.insert(name.to_lowercase(), id.to_string());
                }
                if let Some(role) = mailbox.get("role").and_then(|v| v.as_str()) {
                    if !role.is_empty() {
                        map.insert(role.to_lowercase(), id.to_string());
                    }
                }
            }
            self.mailbox_map = Some(map);
        }
        Ok(self.mailbox_map.as_ref().expect("just populated"))
    }

    /// Translate mailbox names or roles (case-insensitive) to ids.
    pub async fn translate_folders(&mut self, folders: &[String]) -> Result<Vec<String>> {
        let map = self.mailbox_map().await?;
        let mut ids = Vec::new();
        for folder in folders {
            let id = map.get(&folder.to_lowercase()).ok_or_else(|| {
                Error::Configuration(format!(
                    "mailbox '{}' not found on JMAP server",
                    folder
                ))
            })?;
            ids.push(id.clone());
        }
        Ok(ids)
    }

    async fn upload_blob(&self, payload: &[u8]) -> Result<String> {
        let upload_url = self
            .upload_url
            .as_ref()
            .ok_or_else(|| Error::Remote("JMAP session not initialized".to_string()))?;

        let response: Value = self
            .client
            .post(upload_url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "message/rfc822")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| Error::Remote(format!("failed to upload message blob: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Remote(format!("failed to upload message blob: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Remote(format!("failed to upload message blob: {}", e)))?;

        response
            .get("blobId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Remote("no blobId in upload response".to_string()))
    }

    /// Upload the message and run `Email/import`. A server that
    /// already has the message answers `alreadyExists`, which counts
    /// as success with the existing id.
    pub async fn import_message(
        &mut self,
        msg: &RawMessage,
        ctx: &DeliveryContext<'_>,
    ) -> Result<ImportOutcome> {
        self.connect().await?;

        let labels: Vec<String> = if ctx.labels.is_empty() {
            vec!["inbox".to_string()]
        } else {
            ctx.labels.to_vec()
        };
        let mailbox_ids = self.translate_folders(&labels).await?;

        let payload = msg.as_bytes(Some(ctx.feed_name), Some(ctx.delivery_name));
        let blob_id = self.upload_blob(&payload).await?;

        let account_id = self
            .account_id
            .clone()
            .ok_or_else(|| Error::Remote("JMAP session not initialized".to_string()))?;
        let mailbox_value: Value = mailbox_ids
            .iter()
            .map(|id| (id.clone(), Value::Bool(true)))
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let body = json!({
            "using": JMAP_CAPS,
            "methodCalls": [
                ["Email/import", {
                    "accountId": account_id,
                    "emails": {
                        "msg1": {
                            "blobId": blob_id,
                            "mailboxIds": mailbox_value,
                        }
                    }
                }, "call-0"]
            ]
        });

        let response = self.api_request(body).await?;
        parse_import_response(&response)
    }
}

/// Interpret an `Email/import` response: created, alreadyExists, or
/// failure.
pub fn parse_import_response(response: &Value) -> Result<ImportOutcome> {
    let method_responses = response
        .get("methodResponses")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for method_response in &method_responses {
        if method_response.get(0).and_then(|v| v.as_str()) != Some("Email/import") {
            continue;
        }
        let Some(result) = method_response.get(1) else {
            continue;
        };

        if let Some(created) = result.get("created").and_then(|v| v.get("msg1")) {
            let id = created
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            return Ok(ImportOutcome::Delivered(id));
        }

        if let Some(not_created) = result.get("notCreated").and_then(|v| v.get("msg1")) {
            if not_created.get("type").and_then(|v| v.as_str()) == Some("alreadyExists") {
                let existing = not_created
                    .get("existingId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                log::debug!("message already exists on JMAP server");
                return Ok(ImportOutcome::Delivered(existing));
            }
            return Err(Error::Remote(format!(
                "Email/import failed: {}",
                not_created
            )));
        }
    }

    Err(Error::Remote(format!(
        "unexpected JMAP response: {}",
        response
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_required() {
        let err = JmapTarget::new("j", "https://api.example.com", "u@example.com", None, None, 60)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_token_file_trailing_whitespace_stripped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let token_path = tmp.path().join("token");
        std::fs::write(&token_path, "secret_token\n").unwrap();

        let target = JmapTarget::new(
            "j",
            "https://api.example.com/",
            "u@example.com",
            None,
            Some(token_path.to_str().unwrap()),
            60,
        )
        .unwrap();
        assert_eq!(target.token, "secret_token");
        // Trailing slash on the server is stripped too.
        assert_eq!(target.server, "https://api.example.com");
    }

    #[test]
    fn test_missing_token_file_rejected() {
        let err = JmapTarget::new(
            "j",
            "https://api.example.com",
            "u@example.com",
            None,
            Some("/nonexistent/token"),
            60,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_import_response_created() {
        let response = json!({
            "methodResponses": [
                ["Email/import", {"created": {"msg1": {"id": "email-456"}}}, "call-0"]
            ]
        });
        assert_eq!(
            parse_import_response(&response).unwrap(),
            ImportOutcome::Delivered(Some("email-456".to_string()))
        );
    }

    #[test]
    fn test_import_response_already_exists() {
        let response = json!({
            "methodResponses": [
                ["Email/import", {
                    "notCreated": {
                        "msg1": {"type": "alreadyExists", "existingId": "existing-789"}
                    }
                }, "call-0"]
            ]
        });
        assert_eq!(
            parse_import_response(&response).unwrap(),
            ImportOutcome::Delivered(Some("existing-789".to_string()))
        );
    }

    #[test]
    fn test_import_response_failure() {
        let response = json!({
            "methodResponses": [
                ["Email/import", {
                    "notCreated": {
                        "msg1": {"type": "invalidEmail", "description": "Bad message"}
                    }
                }, "call-0"]
            ]
        });
        let err = parse_import_response(&response).unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert!(err.to_string().contains("Email/import failed"));
    }

    #[test]
    fn test_import_response_unexpected() {
        let response = json!({"methodResponses": []});
        let err = parse_import_response(&response).unwrap_err();
        assert!(err.to_string().contains("unexpected JMAP response"));
    }
}
