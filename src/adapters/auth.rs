//! Access tokens for the Pub/Sub REST API.
//!
//! Supported sources:
//! - none (the emulator accepts unauthenticated requests)
//! - a static bearer token, from a JSON file with `access_token` or a plain
//!   text file holding just the token
//! - `authorized_user` credentials (as written by `gcloud auth
//!   application-default login`), exchanged for access tokens via OAuth
//! - `service_account` key files, exchanged for access tokens with a signed
//!   JWT grant
//! - Application Default Credentials when no credentials file is configured:
//!   `GOOGLE_APPLICATION_CREDENTIALS`, then the gcloud well-known file, then
//!   the GCE metadata server

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::PubSubError;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
const ADC_FILE: &str = "application_default_credentials.json";

pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Lifetime requested for self-signed grant assertions
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Where bearer tokens come from
#[derive(Debug)]
pub enum TokenSource {
    None,
    Static(String),
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        cache: Mutex<Option<CachedToken>>,
    },
    ServiceAccount {
        key: ServiceAccountKey,
        cache: Mutex<Option<CachedToken>>,
    },
    Metadata {
        host: String,
        cache: Mutex<Option<CachedToken>>,
    },
}

/// Signing identity from a `service_account` key file
pub struct ServiceAccountKey {
    client_email: String,
    token_uri: String,
    key: EncodingKey,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GrantClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

impl ServiceAccountKey {
    /// Signed JWT grant assertion issued at `now` (unix seconds)
    fn assertion(&self, now: i64) -> Result<String, PubSubError> {
        let claims = GrantClaims {
            iss: self.client_email.clone(),
            scope: PUBSUB_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| PubSubError::Credentials(format!("failed to sign JWT grant: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Credentials file as far as we care about it
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    client_email: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    quota_project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

impl TokenSource {
    /// Token source backed by the GCE metadata server
    pub fn metadata() -> Self {
        let host = std::env::var("GCE_METADATA_HOST")
            .unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        Self::Metadata {
            host,
            cache: Mutex::new(None),
        }
    }

    /// Application Default Credentials: the file named by
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then the gcloud well-known file,
    /// then the metadata server
    pub fn application_default() -> Result<(Self, Option<String>), PubSubError> {
        let path = default_credentials_path(std::env::var_os(CREDENTIALS_ENV), well_known_file());
        Self::from_default_path(path)
    }

    fn from_default_path(path: Option<PathBuf>) -> Result<(Self, Option<String>), PubSubError> {
        match path {
            Some(path) => {
                debug!(path = %path.display(), "using application default credentials");
                Self::from_credentials_file(&path)
            }
            None => Ok((Self::metadata(), None)),
        }
    }

    /// Load a credentials file, returning the token source and any project
    /// named in it
    pub fn from_credentials_file(path: &Path) -> Result<(Self, Option<String>), PubSubError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PubSubError::Credentials(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_credentials(&content)
    }

    fn from_credentials(content: &str) -> Result<(Self, Option<String>), PubSubError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(PubSubError::Credentials("credentials file is empty".to_string()));
        }

        if !trimmed.starts_with('{') {
            return Ok((Self::Static(trimmed.to_string()), None));
        }

        let creds: CredentialsFile = serde_json::from_str(trimmed)
            .map_err(|e| PubSubError::Credentials(format!("invalid credentials JSON: {}", e)))?;
        let project = creds.quota_project_id.or(creds.project_id);

        if let Some(token) = creds.access_token {
            return Ok((Self::Static(token), project));
        }

        match creds.kind.as_deref() {
            Some("authorized_user") => {
                let missing = || {
                    PubSubError::Credentials(
                        "authorized_user credentials need client_id, client_secret and refresh_token"
                            .to_string(),
                    )
                };
                Ok((
                    Self::RefreshToken {
                        client_id: creds.client_id.ok_or_else(missing)?,
                        client_secret: creds.client_secret.ok_or_else(missing)?,
                        refresh_token: creds.refresh_token.ok_or_else(missing)?,
                        cache: Mutex::new(None),
                    },
                    project,
                ))
            }
            Some("service_account") => {
                let missing = || {
                    PubSubError::Credentials(
                        "service_account credentials need client_email and private_key".to_string(),
                    )
                };
                let pem = creds.private_key.ok_or_else(missing)?;
                let key = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
                    PubSubError::Credentials(format!("invalid service account private key: {}", e))
                })?;
                Ok((
                    Self::ServiceAccount {
                        key: ServiceAccountKey {
                            client_email: creds.client_email.ok_or_else(missing)?,
                            token_uri: creds
                                .token_uri
                                .filter(|u| !u.is_empty())
                                .unwrap_or_else(|| TOKEN_URL.to_string()),
                            key,
                        },
                        cache: Mutex::new(None),
                    },
                    project,
                ))
            }
            other => Err(PubSubError::Credentials(format!(
                "unsupported credentials type {:?}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Current bearer token, refreshing it if needed
    pub async fn token(&self, http: &reqwest::Client) -> Result<Option<String>, PubSubError> {
        match self {
            Self::None => Ok(None),
            Self::Static(token) => Ok(Some(token.clone())),
            Self::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
                cache,
            } => {
                let mut cached = cache.lock().await;
                if let Some(t) = cached.as_ref().filter(|t| t.is_fresh()) {
                    return Ok(Some(t.token.clone()));
                }

                debug!("refreshing OAuth access token");
                let request = http.post(TOKEN_URL).form(&[
                    ("grant_type", "refresh_token"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("refresh_token", refresh_token.as_str()),
                ]);
                let fresh = fetch_token(request, TOKEN_URL).await?;
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(Some(token))
            }
            Self::ServiceAccount { key, cache } => {
                let mut cached = cache.lock().await;
                if let Some(t) = cached.as_ref().filter(|t| t.is_fresh()) {
                    return Ok(Some(t.token.clone()));
                }

                debug!(account = %key.client_email, "exchanging service account JWT grant");
                let assertion = key.assertion(chrono::Utc::now().timestamp())?;
                let request = http.post(&key.token_uri).form(&[
                    ("grant_type", JWT_GRANT_TYPE),
                    ("assertion", assertion.as_str()),
                ]);
                let fresh = fetch_token(request, &key.token_uri).await?;
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(Some(token))
            }
            Self::Metadata { host, cache } => {
                let mut cached = cache.lock().await;
                if let Some(t) = cached.as_ref().filter(|t| t.is_fresh()) {
                    return Ok(Some(t.token.clone()));
                }

                let url = format!(
                    "http://{}/computeMetadata/v1/instance/service-accounts/default/token",
                    host
                );
                debug!("fetching access token from metadata server");
                let request = http.get(&url).header("Metadata-Flavor", "Google");
                let fresh = fetch_token(request, &url).await?;
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(Some(token))
            }
        }
    }

    /// Project id advertised by the metadata server, if this source uses it
    pub async fn discover_project(
        &self,
        http: &reqwest::Client,
    ) -> Result<Option<String>, PubSubError> {
        let Self::Metadata { host, .. } = self else {
            return Ok(None);
        };

        let url = format!("http://{}/computeMetadata/v1/project/project-id", host);
        let response = http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|source| PubSubError::Http {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let project = response
            .text()
            .await
            .map_err(|source| PubSubError::Http { url, source })?;
        let project = project.trim();
        Ok((!project.is_empty()).then(|| project.to_string()))
    }
}

/// Credentials file to use when none is configured: the environment
/// variable wins, then the well-known file if it exists
fn default_credentials_path(
    env: Option<std::ffi::OsString>,
    well_known: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    well_known.filter(|p| p.is_file())
}

/// Where `gcloud auth application-default login` writes its credentials
fn well_known_file() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("CLOUDSDK_CONFIG").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir).join(ADC_FILE));
    }

    let config_dir = if cfg!(windows) {
        PathBuf::from(std::env::var_os("APPDATA")?)
    } else {
        PathBuf::from(std::env::var_os("HOME")?).join(".config")
    };
    Some(config_dir.join("gcloud").join(ADC_FILE))
}

async fn fetch_token(request: reqwest::RequestBuilder, url: &str) -> Result<CachedToken, PubSubError> {
    let response = request.send().await.map_err(|source| PubSubError::Http {
        url: url.to_string(),
        source,
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|source| PubSubError::Http {
        url: url.to_string(),
        source,
    })?;

    if !status.is_success() {
        return Err(PubSubError::Credentials(format!(
            "token request to {} failed with status {}: {}",
            url,
            status.as_u16(),
            body.trim()
        )));
    }

    let parsed: TokenResponse = serde_json::from_str(&body).map_err(|source| PubSubError::Decode {
        url: url.to_string(),
        source,
    })?;

    Ok(CachedToken {
        token: parsed.access_token,
        expires_at: Instant::now() + Duration::from_secs(parsed.expires_in),
    })
}
