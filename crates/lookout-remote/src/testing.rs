//! In-memory `PhotoService` for unit tests.

use crate::service::{
    ApiError, Credentials, FeedPage, Friendship, PhotoService, Reply, ServiceError, Session, UserInfo, COOKIE_KEY,
    USER_ID_KEY,
};
use crate::store::{SettingValue, Settings};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub(crate) const FAKE_USER_ID: u64 = 1000;
pub(crate) const CHALLENGE_URL: &str = "https://www.instagram.com/challenge/1000/abc/";

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ResumeOutcome {
    Accept,
    CookieExpired,
    LoginRequired,
    Rejected,
    Challenge,
}

#[derive(Default)]
struct State {
    logins: usize,
    resumes: usize,
    friendship_calls: usize,
    feed_calls: Vec<Option<String>>,
    fail_login: bool,
    expire_next_call: bool,
    rotated_cookie: Option<Vec<u8>>,
    users: HashMap<String, UserInfo>,
    following: HashSet<u64>,
    pages: HashMap<Option<String>, FeedPage>,
}

pub(crate) struct FakeService {
    resume: ResumeOutcome,
    state: Mutex<State>,
}

impl FakeService {
    pub(crate) fn new() -> Self {
        Self {
            resume: ResumeOutcome::Accept,
            state: Mutex::new(State::default()),
        }
    }

    pub(crate) fn with_resume(mut self, outcome: ResumeOutcome) -> Self {
        self.resume = outcome;
        self
    }

    pub(crate) fn failing_login(self) -> Self {
        self.state.lock().unwrap().fail_login = true;
        self
    }

    pub(crate) fn with_user(self, handle: &str, pk: u64, is_private: bool) -> Self {
        let info = UserInfo {
            pk,
            username: handle.to_string(),
            is_private,
        };
        self.state.lock().unwrap().users.insert(handle.to_string(), info);
        self
    }

    pub(crate) fn following(self, pk: u64) -> Self {
        self.state.lock().unwrap().following.insert(pk);
        self
    }

    /// Register the page served for `cursor` (None is the first page).
    pub(crate) fn with_page(self, cursor: Option<&str>, items: Vec<Value>, next: Option<&str>) -> Self {
        let page = FeedPage {
            items,
            next_max_id: next.map(str::to_string),
        };
        self.state.lock().unwrap().pages.insert(cursor.map(str::to_string), page);
        self
    }

    /// Every reply carries this cookie jar as a rotation.
    pub(crate) fn rotating_cookie(self, cookie: &[u8]) -> Self {
        self.state.lock().unwrap().rotated_cookie = Some(cookie.to_vec());
        self
    }

    /// The next API call fails with `LoginRequired`.
    pub(crate) fn expire_next_call(&self) {
        self.state.lock().unwrap().expire_next_call = true;
    }

    pub(crate) fn logins(&self) -> usize {
        self.state.lock().unwrap().logins
    }

    pub(crate) fn resumes(&self) -> usize {
        self.state.lock().unwrap().resumes
    }

    pub(crate) fn friendship_calls(&self) -> usize {
        self.state.lock().unwrap().friendship_calls
    }

    pub(crate) fn feed_calls(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().feed_calls.clone()
    }

    /// The blob a login with the given sequence number produces.
    pub(crate) fn login_settings(n: usize) -> Settings {
        let mut settings = Settings::new();
        settings.insert(USER_ID_KEY.into(), FAKE_USER_ID.to_string().into());
        settings.insert(
            COOKIE_KEY.into(),
            SettingValue::Bytes(format!("sessionid=login-{n}").into_bytes()),
        );
        settings
    }

    fn reply<T>(&self, state: &mut State, body: T) -> Result<Reply<T>, ServiceError> {
        if std::mem::take(&mut state.expire_next_call) {
            return Err(ServiceError::LoginRequired);
        }
        Ok(Reply {
            body,
            cookie: state.rotated_cookie.clone(),
        })
    }
}

#[async_trait]
impl PhotoService for FakeService {
    async fn login(&self, _credentials: &Credentials) -> Result<Session, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.logins += 1;
        if state.fail_login {
            return Err(ServiceError::Api(ApiError {
                status: 400,
                message: "bad_password".into(),
                ..ApiError::default()
            }));
        }
        Ok(Session {
            user_id: FAKE_USER_ID.to_string(),
            settings: Self::login_settings(state.logins),
        })
    }

    async fn resume(&self, settings: Settings) -> Result<Session, ServiceError> {
        self.state.lock().unwrap().resumes += 1;
        match self.resume {
            ResumeOutcome::Accept => Session::from_settings(settings).ok_or(ServiceError::LoginRequired),
            ResumeOutcome::CookieExpired => Err(ServiceError::CookieExpired),
            ResumeOutcome::LoginRequired => Err(ServiceError::LoginRequired),
            ResumeOutcome::Rejected => Err(ServiceError::Api(ApiError {
                status: 429,
                message: "Please wait a few minutes before you try again.".into(),
                ..ApiError::default()
            })),
            ResumeOutcome::Challenge => Err(ServiceError::Api(ApiError {
                status: 400,
                message: "checkpoint_required".into(),
                challenge_url: Some(CHALLENGE_URL.into()),
                error_title: Some("Confirm it's you".into()),
                ..ApiError::default()
            })),
        }
    }

    async fn user_info(&self, _session: &Session, handle: &str) -> Result<Reply<UserInfo>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let info = state.users.get(handle).cloned().ok_or_else(|| {
            ServiceError::Api(ApiError {
                status: 404,
                message: "User not found".into(),
                ..ApiError::default()
            })
        })?;
        self.reply(&mut state, info)
    }

    async fn friendship(&self, _session: &Session, user_id: u64) -> Result<Reply<Friendship>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.friendship_calls += 1;
        let friendship = Friendship {
            following: state.following.contains(&user_id),
        };
        self.reply(&mut state, friendship)
    }

    async fn user_feed(
        &self,
        _session: &Session,
        _user_id: u64,
        max_id: Option<&str>,
    ) -> Result<Reply<FeedPage>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let cursor = max_id.map(str::to_string);
        state.feed_calls.push(cursor.clone());
        let page = state.pages.get(&cursor).cloned().unwrap_or_default();
        self.reply(&mut state, page)
    }
}
