//! `PhotoService` over the private mobile API.

use crate::service::{
    ApiError, Credentials, FeedPage, Friendship, PhotoService, Reply, ServiceError, Session, UserInfo,
    COOKIE_EXPIRES_KEY, COOKIE_KEY, USER_ID_KEY,
};
use crate::store::{SettingValue, Settings};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

pub const DEFAULT_API_URL: &str = "https://i.instagram.com/api/v1/";

const USER_AGENT: &str = "Instagram 269.0.0.18.75 Android (26/8.0.0; 480dpi; 1080x1920; OnePlus; ONEPLUS A3010; OnePlus3T; qcom; en_US; 314665256)";
const APP_ID: &str = "567067343352427";
const DEVICE_ID_KEY: &str = "device_id";
const SESSION_COOKIE: &str = "sessionid";
const CSRF_COOKIE: &str = "csrftoken";
/// Lifetime assumed for a session cookie that carries no Max-Age.
const DEFAULT_COOKIE_LIFETIME: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Cookie jar kept in the settings blob as `name=value; name=value` bytes.
#[derive(Debug, Clone, Default, PartialEq)]
struct CookieJar {
    cookies: BTreeMap<String, String>,
    session_max_age: Option<u64>,
}

impl CookieJar {
    fn from_bytes(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let cookies = text
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        Self {
            cookies,
            session_max_age: None,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.header_value().into_bytes()
    }

    fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Apply `Set-Cookie` headers; returns true when the jar changed.
    fn absorb(&mut self, response: &Response) -> bool {
        let mut changed = false;
        for value in response.headers().get_all(header::SET_COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            let mut parts = value.split(';');
            let Some((name, cookie)) = parts.next().and_then(|p| p.trim().split_once('=')) else {
                continue;
            };
            let cookie = cookie.trim_matches('"');
            if name == SESSION_COOKIE {
                self.session_max_age = parts.find_map(|attr| {
                    let (key, value) = attr.trim().split_once('=')?;
                    key.eq_ignore_ascii_case("max-age").then(|| value.parse().ok())?
                });
            }
            if cookie.is_empty() {
                changed |= self.cookies.remove(name).is_some();
            } else if self.get(name) != Some(cookie) {
                self.cookies.insert(name.to_string(), cookie.to_string());
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error_type: Option<String>,
    challenge: Option<Challenge>,
    checkpoint_url: Option<String>,
    error_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    logged_in_user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    user: UserInfo,
}

/// Map an error response onto the service taxonomy.
///
/// Only `login_required` is cured by logging in again. Checkpoints and
/// challenges need the operator, so they stay API errors carrying the
/// challenge URL. Cookie expiry is detected locally in `resume`.
fn classify(status: StatusCode, body: &str) -> ServiceError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    if message == "login_required" {
        return ServiceError::LoginRequired;
    }
    ServiceError::Api(ApiError {
        status: status.as_u16(),
        message,
        error_type: parsed.error_type,
        challenge_url: parsed.challenge.and_then(|c| c.url).or(parsed.checkpoint_url),
        error_title: parsed.error_title,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Stable per-account device id.
fn device_id(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("android-{hex}")
}

#[derive(Debug, Clone)]
pub struct HttpPhotoService {
    client: Client,
    base_url: Url,
}

impl HttpPhotoService {
    pub fn new(base_url: &str) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, ServiceError> {
        let base_url = Url::parse(base_url).map_err(|e| ServiceError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ServiceError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { client, base_url })
    }

    /// Endpoint URL under the base; each segment is percent-encoded and the
    /// path keeps its trailing slash.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments).push("");
        }
        url
    }

    fn authorize(&self, request: RequestBuilder, jar: &CookieJar) -> RequestBuilder {
        let mut request = request.header("X-IG-App-ID", APP_ID).header(header::COOKIE, jar.header_value());
        if let Some(csrf) = jar.get(CSRF_COOKIE) {
            request = request.header("X-CSRFToken", csrf);
        }
        request
    }

    async fn read<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "api response");
        if status.is_success() {
            Ok(serde_json::from_str(&body)?)
        } else {
            Err(classify(status, &body))
        }
    }

    /// Authenticated GET; reports a rotated cookie jar alongside the body.
    async fn get<T: DeserializeOwned>(
        &self,
        session: &Session,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<Reply<T>, ServiceError> {
        let mut jar = session.cookie().map(CookieJar::from_bytes).unwrap_or_default();
        let request = self.authorize(self.client.get(url).query(query), &jar);
        let response = request.send().await?;
        let rotated = jar.absorb(&response);
        let body = Self::read(response).await?;
        Ok(Reply {
            body,
            cookie: rotated.then(|| jar.to_bytes()),
        })
    }
}

#[async_trait]
impl PhotoService for HttpPhotoService {
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    async fn login(&self, credentials: &Credentials) -> Result<Session, ServiceError> {
        let device_id = device_id(&credentials.username);
        let enc_password = format!("#PWD_INSTAGRAM:0:{}:{}", unix_now(), credentials.password);
        let response = self
            .client
            .post(self.url(&["accounts", "login"]))
            .header("X-IG-App-ID", APP_ID)
            .form(&[
                ("username", credentials.username.as_str()),
                ("enc_password", enc_password.as_str()),
                ("device_id", device_id.as_str()),
                ("login_attempt_count", "0"),
            ])
            .send()
            .await?;

        let mut jar = CookieJar::default();
        jar.absorb(&response);
        let login: LoginResponse = Self::read(response).await?;
        if jar.get(SESSION_COOKIE).is_none() {
            warn!("login response carried no session cookie");
        }

        let lifetime = jar
            .session_max_age
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COOKIE_LIFETIME);
        let expires = unix_now().saturating_add(lifetime.as_secs());

        let mut settings = Settings::new();
        settings.insert(USER_ID_KEY.into(), login.logged_in_user.pk.to_string().into());
        settings.insert(DEVICE_ID_KEY.into(), device_id.into());
        settings.insert(COOKIE_KEY.into(), SettingValue::Bytes(jar.to_bytes()));
        settings.insert(COOKIE_EXPIRES_KEY.into(), i64::try_from(expires).unwrap_or(i64::MAX).into());

        debug!(user_id = login.logged_in_user.pk, "logged in");
        Ok(Session {
            user_id: login.logged_in_user.pk.to_string(),
            settings,
        })
    }

    #[instrument(skip(self, settings))]
    async fn resume(&self, settings: Settings) -> Result<Session, ServiceError> {
        let expires = settings.get(COOKIE_EXPIRES_KEY).and_then(SettingValue::as_i64);
        if expires.is_some_and(|at| at <= i64::try_from(unix_now()).unwrap_or(i64::MAX)) {
            return Err(ServiceError::CookieExpired);
        }
        let mut session = Session::from_settings(settings).ok_or(ServiceError::LoginRequired)?;
        if session.cookie().is_none() {
            return Err(ServiceError::LoginRequired);
        }

        let reply: Reply<UserResponse> = self.get(&session, self.url(&["accounts", "current_user"]), &[]).await?;
        let user_id = reply.body.user.pk.to_string();
        if user_id != session.user_id {
            warn!(stored = %session.user_id, actual = %user_id, "stored session belongs to another account");
            session.user_id = user_id.clone();
            session.settings.insert(USER_ID_KEY.into(), user_id.into());
        }
        if let Some(cookie) = reply.cookie {
            session.set_cookie(cookie);
        }
        Ok(session)
    }

    #[instrument(skip(self, session))]
    async fn user_info(&self, session: &Session, handle: &str) -> Result<Reply<UserInfo>, ServiceError> {
        let reply: Reply<UserResponse> = self.get(session, self.url(&["users", handle, "usernameinfo"]), &[]).await?;
        Ok(Reply {
            body: reply.body.user,
            cookie: reply.cookie,
        })
    }

    #[instrument(skip(self, session))]
    async fn friendship(&self, session: &Session, user_id: u64) -> Result<Reply<Friendship>, ServiceError> {
        self.get(session, self.url(&["friendships", "show", &user_id.to_string()]), &[])
            .await
    }

    #[instrument(skip(self, session))]
    async fn user_feed(
        &self,
        session: &Session,
        user_id: u64,
        max_id: Option<&str>,
    ) -> Result<Reply<FeedPage>, ServiceError> {
        let url = self.url(&["feed", "user", &user_id.to_string()]);
        match max_id {
            Some(cursor) => self.get(session, url, &[("max_id", cursor)]).await,
            None => self.get(session, url, &[]).await,
        }
    }
}
