//! The remote photo service as seen by the rest of the crate.

use crate::store::{SettingValue, Settings};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::fmt;
use thiserror::Error;

/// Settings key holding the authenticated account id.
pub const USER_ID_KEY: &str = "authenticated_user_id";
/// Settings key holding the cookie jar (bytes).
pub const COOKIE_KEY: &str = "cookie";
/// Settings key holding the cookie expiry as unix seconds.
pub const COOKIE_EXPIRES_KEY: &str = "cookie_expires";

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// An authenticated session: the settings blob plus the account it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub settings: Settings,
}

impl Session {
    /// Build a session from a settings blob that names its account.
    pub fn from_settings(settings: Settings) -> Option<Self> {
        let user_id = settings.get(USER_ID_KEY)?.as_str()?.to_string();
        Some(Self { user_id, settings })
    }

    pub fn cookie(&self) -> Option<&[u8]> {
        self.settings.get(COOKIE_KEY).and_then(SettingValue::as_bytes)
    }

    pub fn set_cookie(&mut self, cookie: Vec<u8>) {
        self.settings.insert(COOKIE_KEY.to_string(), SettingValue::Bytes(cookie));
    }
}

/// A response body plus the rotated cookie jar, when the service sent one.
#[derive(Debug)]
pub struct Reply<T> {
    pub body: T,
    pub cookie: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub pk: u64,
    pub username: String,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Friendship {
    #[serde(default)]
    pub following: bool,
}

/// One page of a user's feed. Items are kept raw so that a malformed item
/// can be skipped without failing the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "cursor_from_string_or_number")]
    pub next_max_id: Option<String>,
}

/// Error body returned by the service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    pub error_type: Option<String>,
    pub challenge_url: Option<String>,
    pub error_title: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (http {})", self.message, self.status)?;
        if let Some(title) = &self.error_title {
            write!(f, ": {title}")?;
        }
        if let Some(url) = &self.challenge_url {
            write!(f, "; complete the challenge at {url}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("session cookie expired")]
    CookieExpired,
    #[error("login required")]
    LoginRequired,
    #[error("api error: {0}")]
    Api(ApiError),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid API url: {0}")]
    InvalidUrl(String),
}

impl ServiceError {
    /// The two conditions that are cured by logging in again.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ServiceError::CookieExpired | ServiceError::LoginRequired)
    }

    pub fn api(&self) -> Option<&ApiError> {
        match self {
            ServiceError::Api(api) => Some(api),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PhotoService: Send + Sync {
    /// Fresh username/password login.
    async fn login(&self, credentials: &Credentials) -> Result<Session, ServiceError>;

    /// Resume from stored settings. Fails with `CookieExpired` once the
    /// stored cookie has lapsed and `LoginRequired` when the service refuses
    /// it. A checkpoint comes back as `Api` with its challenge URL.
    async fn resume(&self, settings: Settings) -> Result<Session, ServiceError>;

    async fn user_info(&self, session: &Session, handle: &str) -> Result<Reply<UserInfo>, ServiceError>;

    async fn friendship(&self, session: &Session, user_id: u64) -> Result<Reply<Friendship>, ServiceError>;

    async fn user_feed(
        &self,
        session: &Session,
        user_id: u64,
        max_id: Option<&str>,
    ) -> Result<Reply<FeedPage>, ServiceError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

fn id_from_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid account id {n}"))),
    }
}

fn cursor_from_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<StringOrNumber>::deserialize(deserializer)? {
        Some(StringOrNumber::String(s)) if s.is_empty() => None,
        Some(StringOrNumber::String(s)) => Some(s),
        Some(StringOrNumber::Number(n)) => Some(n.to_string()),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_info_accepts_string_pk() {
        let a: UserInfo = serde_json::from_value(json!({"pk": "1234", "username": "a", "is_private": true})).unwrap();
        let b: UserInfo = serde_json::from_value(json!({"pk": 1234, "username": "b"})).unwrap();
        assert_eq!(a.pk, 1234);
        assert!(a.is_private);
        assert_eq!(b.pk, 1234);
        assert!(!b.is_private);
    }

    #[test]
    fn test_feed_page_cursor_forms() {
        let page: FeedPage = serde_json::from_value(json!({"items": [], "next_max_id": "abc_1"})).unwrap();
        assert_eq!(page.next_max_id.as_deref(), Some("abc_1"));

        let page: FeedPage = serde_json::from_value(json!({"items": [], "next_max_id": 3189})).unwrap();
        assert_eq!(page.next_max_id.as_deref(), Some("3189"));

        let page: FeedPage = serde_json::from_value(json!({"items": [{}], "next_max_id": ""})).unwrap();
        assert_eq!(page.next_max_id, None);
        assert_eq!(page.items.len(), 1);

        let page: FeedPage = serde_json::from_value(json!({"items": [], "next_max_id": null})).unwrap();
        assert_eq!(page.next_max_id, None);

        let page: FeedPage = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_max_id, None);
    }

    #[test]
    fn test_session_from_settings() {
        let mut settings = Settings::new();
        assert!(Session::from_settings(settings.clone()).is_none());
        settings.insert(USER_ID_KEY.into(), "77".into());
        let mut session = Session::from_settings(settings).unwrap();
        assert_eq!(session.user_id, "77");
        assert_eq!(session.cookie(), None);
        session.set_cookie(b"sessionid=1".to_vec());
        assert_eq!(session.cookie(), Some(&b"sessionid=1"[..]));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "someone".into(),
            password: "hunter2".into(),
        };
        let text = format!("{creds:?}");
        assert!(text.contains("someone"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_api_error_display_includes_challenge() {
        let err = ApiError {
            status: 400,
            message: "challenge_required".into(),
            challenge_url: Some("https://www.instagram.com/challenge/1/".into()),
            error_title: Some("Confirm it's you".into()),
            ..ApiError::default()
        };
        let text = err.to_string();
        assert!(text.contains("challenge_required"));
        assert!(text.contains("https://www.instagram.com/challenge/1/"));
        assert!(text.contains("Confirm it's you"));
    }
}
