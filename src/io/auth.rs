use crate::config::AuthConfig;
use crate::types::{TrendError, TrendResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Environment variable holding a ready-made access token
pub const ACCESS_TOKEN_ENV: &str = "HARMONIC_TREND_ACCESS_TOKEN";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens expiring within this margin are refreshed early
const EXPIRY_SKEW_SECS: i64 = 60;

/// Source of OAuth bearer tokens for the remote services
pub trait CredentialProvider: Send + Sync {
    fn access_token(&self) -> TrendResult<String>;
}

/// A fixed token, e.g. minted by `gcloud auth print-access-token`
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialProvider for StaticToken {
    fn access_token(&self) -> TrendResult<String> {
        Ok(self.0.clone())
    }
}

/// Authorized-user token cache as written by the installed-app OAuth flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// Token present and not about to expire; a missing expiry counts as valid
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.token, self.expiry) {
            (Some(_), Some(expiry)) => expiry - Duration::seconds(EXPIRY_SKEW_SECS) > now,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClientSecret {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Refreshing provider backed by a token file.
///
/// The interactive consent flow is not run here: the file must already hold
/// a refresh token.
pub struct AuthorizedUserCredentials {
    token_file: PathBuf,
    client: reqwest::blocking::Client,
    record: Mutex<TokenRecord>,
}

impl AuthorizedUserCredentials {
    pub fn load(config: &AuthConfig) -> TrendResult<Self> {
        log::info!("Loading OAuth token from {}", config.token_file.display());
        let content = std::fs::read_to_string(&config.token_file).map_err(|e| {
            TrendError::Auth(format!(
                "cannot read token file {}: {}",
                config.token_file.display(),
                e
            ))
        })?;
        let mut record: TokenRecord = serde_json::from_str(&content)?;

        if record.client_id.is_none() || record.client_secret.is_none() {
            if let Some(secret) = read_client_secret(&config.credentials_file)? {
                record.client_id.get_or_insert(secret.client_id);
                record.client_secret.get_or_insert(secret.client_secret);
                if record.token_uri.is_none() {
                    record.token_uri = secret.token_uri;
                }
            }
        }
        if record.scopes.is_empty() {
            record.scopes = config.scopes.clone();
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            token_file: config.token_file.clone(),
            client,
            record: Mutex::new(record),
        })
    }

    fn refresh(&self, record: &mut TokenRecord) -> TrendResult<()> {
        let refresh_token = record.refresh_token.clone().ok_or_else(|| {
            TrendError::Auth(format!(
                "token in {} expired and holds no refresh token; re-run the OAuth consent flow",
                self.token_file.display()
            ))
        })?;
        let (client_id, client_secret) = match (&record.client_id, &record.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => {
                return Err(TrendError::Auth(
                    "no OAuth client id/secret in token or credentials file".to_string(),
                ))
            }
        };
        let token_uri = record
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

        log::info!("Refreshing OAuth access token");
        let response = self
            .client
            .post(&token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            log::error!("Token refresh failed with {}", status);
            return Err(TrendError::Auth(format!("token refresh failed ({}): {}", status, message)));
        }

        let refreshed: RefreshResponse = response.json()?;
        record.token = Some(refreshed.access_token);
        record.expiry = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        if let Err(e) = persist(&self.token_file, record) {
            log::warn!("Could not update token file {}: {}", self.token_file.display(), e);
        }
        Ok(())
    }
}

impl CredentialProvider for AuthorizedUserCredentials {
    fn access_token(&self) -> TrendResult<String> {
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        if !record.is_valid_at(Utc::now()) {
            self.refresh(&mut record)?;
        }
        record
            .token
            .clone()
            .ok_or_else(|| TrendError::Auth("no access token available".to_string()))
    }
}

fn read_client_secret(path: &Path) -> TrendResult<Option<ClientSecret>> {
    if !path.exists() {
        return Ok(None);
    }
    let secrets: ClientSecrets = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    Ok(secrets.installed.or(secrets.web))
}

fn persist(path: &Path, record: &TokenRecord) -> TrendResult<()> {
    std::fs::write(path, serde_json::to_string_pretty(record)?)?;
    Ok(())
}

/// Pick a provider: the environment token when set, else the token file
pub fn credentials_from_config(config: &AuthConfig) -> TrendResult<Arc<dyn CredentialProvider>> {
    if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
        if !token.trim().is_empty() {
            log::info!("Using access token from {}", ACCESS_TOKEN_ENV);
            return Ok(Arc::new(StaticToken::new(token.trim())));
        }
    }
    Ok(Arc::new(AuthorizedUserCredentials::load(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_token_validity() {
        let now = Utc::now();
        let mut record = TokenRecord {
            token: Some("abc".to_string()),
            expiry: Some(now + Duration::seconds(3600)),
            ..Default::default()
        };
        assert!(record.is_valid_at(now));
        record.expiry = Some(now + Duration::seconds(30));
        assert!(!record.is_valid_at(now));
        record.expiry = None;
        assert!(record.is_valid_at(now));
        record.token = None;
        assert!(!record.is_valid_at(now));
    }

    #[test]
    fn test_load_merges_client_secret() {
        let mut token = NamedTempFile::new().unwrap();
        write!(
            token,
            r#"{{"token": "cached", "refresh_token": "r", "expiry": "2999-01-01T00:00:00.000000Z"}}"#
        )
        .unwrap();
        let mut secrets = NamedTempFile::new().unwrap();
        write!(
            secrets,
            r#"{{"installed": {{"client_id": "id", "client_secret": "s", "token_uri": "https://example.test/token"}}}}"#
        )
        .unwrap();

        let config = AuthConfig {
            token_file: token.path().to_path_buf(),
            credentials_file: secrets.path().to_path_buf(),
            scopes: vec!["scope".to_string()],
        };
        let credentials = AuthorizedUserCredentials::load(&config).unwrap();
        {
            let record = credentials.record.lock().unwrap();
            assert_eq!(record.client_id.as_deref(), Some("id"));
            assert_eq!(record.token_uri.as_deref(), Some("https://example.test/token"));
            assert_eq!(record.scopes, vec!["scope".to_string()]);
        }
        assert_eq!(credentials.access_token().unwrap(), "cached");
    }

    #[test]
    fn test_expired_without_refresh_token() {
        let mut token = NamedTempFile::new().unwrap();
        write!(token, r#"{{"token": "old", "expiry": "2000-01-01T00:00:00Z"}}"#).unwrap();
        let config = AuthConfig {
            token_file: token.path().to_path_buf(),
            credentials_file: PathBuf::from("/nonexistent/credentials.json"),
            scopes: vec![],
        };
        let credentials = AuthorizedUserCredentials::load(&config).unwrap();
        assert!(matches!(credentials.access_token(), Err(TrendError::Auth(_))));
    }
}
