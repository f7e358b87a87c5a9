//! Bot OAuth credentials
//!
//! Credentials live decrypted only in the presence controller. At rest both
//! tokens are sealed with the deployment's [`TokenCipher`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::crypto::TokenCipher;
use crate::db::StoredBotToken;
use crate::types::{Result, RuinousError};

/// Decrypted bot credentials
#[derive(Clone, PartialEq)]
pub struct BotCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
    pub obtained_at: DateTime<Utc>,
    /// Lifetime in seconds; `None` never expires
    pub expires_in: Option<i64>,
}

impl fmt::Debug for BotCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotCredentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("obtained_at", &self.obtained_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl BotCredentials {
    /// When the access token stops working, if it expires at all
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| self.obtained_at + chrono::Duration::seconds(secs))
    }

    /// Time left until `margin` before expiry; zero when already past it
    ///
    /// The margin never exceeds half the token's lifetime, so a fresh token
    /// is always due no earlier than halfway through its life.
    pub fn refresh_in(&self, margin: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let lifetime = self.expires_in?.max(0);
        let expires_at = self.expires_at()?;
        let margin = chrono::Duration::from_std(margin)
            .unwrap_or_else(|_| chrono::Duration::zero())
            .min(chrono::Duration::seconds(lifetime / 2));
        let due = expires_at - margin;
        Some((due - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Encrypt for storage under the bot's user id
    pub fn seal(&self, user_id: &str, cipher: &TokenCipher) -> Result<StoredBotToken> {
        Ok(StoredBotToken {
            user_id: user_id.to_string(),
            access_token: cipher.encrypt(&self.access_token)?,
            refresh_token: cipher.encrypt(&self.refresh_token)?,
            scopes: self.scopes.clone(),
            obtained_at: self.obtained_at,
            expires_in: self.expires_in,
        })
    }

    pub fn open(stored: &StoredBotToken, cipher: &TokenCipher) -> Result<Self> {
        Ok(Self {
            access_token: cipher.decrypt(&stored.access_token)?,
            refresh_token: cipher.decrypt(&stored.refresh_token)?,
            scopes: stored.scopes.clone(),
            obtained_at: stored.obtained_at,
            expires_in: stored.expires_in,
        })
    }
}

/// Exchanges a refresh token for new credentials
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<BotCredentials>;
}

/// Twitch's OAuth token endpoint
pub const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Vec<String>,
}

/// Refresh via the `refresh_token` grant of the OAuth token endpoint
pub struct TwitchTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl TwitchTokenRefresher {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuinousError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }
}

#[async_trait]
impl TokenRefresher for TwitchTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<BotCredentials> {
        debug!("Refreshing bot token");

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED
        {
            let body = response.text().await.unwrap_or_default();
            return Err(RuinousError::Auth(format!("Token refresh rejected: {body}")));
        }
        if !status.is_success() {
            return Err(RuinousError::Http(format!(
                "Token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(BotCredentials {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            scopes: token.scope,
            obtained_at: Utc::now(),
            expires_in: token.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn credentials(expires_in: Option<i64>) -> BotCredentials {
        BotCredentials {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            scopes: vec!["chat:read".into(), "chat:edit".into()],
            obtained_at: Utc::now(),
            expires_in,
        }
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = TokenCipher::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let creds = credentials(Some(3600));

        let stored = creds.seal("bot", &cipher).unwrap();
        assert_eq!(stored.user_id, "bot");
        assert_ne!(stored.access_token, "access");
        assert_ne!(stored.refresh_token, "refresh");

        assert_eq!(BotCredentials::open(&stored, &cipher).unwrap(), creds);
    }

    #[test]
    fn test_refresh_schedule() {
        let creds = credentials(Some(3600));
        let now = creds.obtained_at;

        let wait = creds.refresh_in(Duration::from_secs(600), now).unwrap();
        assert_eq!(wait, Duration::from_secs(3000));

        let late = now + chrono::Duration::seconds(4000);
        assert_eq!(
            creds.refresh_in(Duration::from_secs(600), late),
            Some(Duration::ZERO)
        );

        assert!(credentials(None)
            .refresh_in(Duration::from_secs(600), now)
            .is_none());
    }

    #[test]
    fn test_margin_longer_than_lifetime_is_halved() {
        let creds = credentials(Some(60));
        let now = creds.obtained_at;

        assert_eq!(
            creds.refresh_in(Duration::from_secs(4000), now),
            Some(Duration::from_secs(30))
        );
        let instant = credentials(Some(0));
        assert_eq!(
            instant.refresh_in(Duration::from_secs(4000), instant.obtained_at),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", credentials(None));
        assert!(!rendered.contains("access\""));
        assert!(rendered.contains("<redacted>"));
    }

    /// Answer one request with a canned response and return the endpoint URL
    async fn token_endpoint(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/oauth2/token")
    }

    #[tokio::test]
    async fn test_refresh_parses_token_response() {
        let url = token_endpoint(
            "200 OK",
            r#"{"access_token":"new-access","refresh_token":"new-refresh","expires_in":14400,"scope":["chat:read","chat:edit"],"token_type":"bearer"}"#,
        )
        .await;
        let refresher = TwitchTokenRefresher::new(url, "id", "secret", Duration::from_secs(2)).unwrap();

        let creds = refresher.refresh("old-refresh").await.unwrap();
        assert_eq!(creds.access_token, "new-access");
        assert_eq!(creds.refresh_token, "new-refresh");
        assert_eq!(creds.expires_in, Some(14400));
        assert_eq!(creds.scopes, vec!["chat:read", "chat:edit"]);
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_auth_error() {
        let url = token_endpoint(
            "400 Bad Request",
            r#"{"status":400,"message":"Invalid refresh token"}"#,
        )
        .await;
        let refresher = TwitchTokenRefresher::new(url, "id", "secret", Duration::from_secs(2)).unwrap();

        let err = refresher.refresh("revoked").await.unwrap_err();
        assert!(matches!(err, RuinousError::Auth(ref m) if m.contains("Invalid refresh token")));
    }
}
