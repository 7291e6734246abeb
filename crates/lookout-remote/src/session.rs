//! Authentication with a cached settings blob.
//!
//! A stored blob is resumed when present. A blob the service no longer
//! accepts is discarded and replaced by exactly one fresh login. Every
//! successful login, and every cookie rotation reported by a later reply,
//! overwrites the stored blob.

use crate::service::{Credentials, FeedPage, Friendship, PhotoService, Reply, ServiceError, Session, UserInfo};
use crate::store::{SessionStore, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Credentials,
    pub settings_path: PathBuf,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to persist session settings: {0}")]
    Store(#[from] StoreError),
    #[error("remote service error: {0}")]
    Remote(#[from] ServiceError),
}

/// The account whose photos are searched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: u64,
    pub handle: String,
    pub is_private: bool,
    pub is_followed_by_me: bool,
}

impl Target {
    /// Photos are reachable unless the account is private and not followed.
    pub fn is_visible(&self) -> bool {
        !(self.is_private && !self.is_followed_by_me)
    }
}

pub struct SessionManager {
    credentials: Credentials,
    store: SessionStore,
    service: Arc<dyn PhotoService>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, service: Arc<dyn PhotoService>) -> Result<Self, SessionError> {
        if config.credentials.username.trim().is_empty() {
            return Err(SessionError::Configuration("username is empty".into()));
        }
        if config.credentials.password.is_empty() {
            return Err(SessionError::Configuration("password is empty".into()));
        }
        Ok(Self {
            credentials: config.credentials,
            store: SessionStore::new(config.settings_path),
            service,
        })
    }

    #[instrument(skip(self), fields(username = %self.credentials.username))]
    pub async fn authenticate(&self) -> Result<AuthenticatedSession, SessionError> {
        let stored = self.store.load().map_err(|e| {
            SessionError::Configuration(format!("unusable settings file {}: {e}", self.store.path().display()))
        })?;

        let session = match stored {
            None => {
                warn!(path = %self.store.path().display(), "settings file not found, creating one");
                self.service.login(&self.credentials).await?
            }
            Some(settings) => match self.service.resume(settings).await {
                Ok(session) => {
                    info!(user_id = %session.user_id, "resumed stored session");
                    session
                }
                Err(e) if e.is_auth_expired() => {
                    warn!(error = %e, "stored session rejected, logging in again");
                    self.store.discard()?;
                    self.service.login(&self.credentials).await?
                }
                Err(e) => return Err(e.into()),
            },
        };

        self.store.save(&session.settings)?;
        Ok(AuthenticatedSession {
            session,
            credentials: self.credentials.clone(),
            store: self.store.clone(),
            service: Arc::clone(&self.service),
        })
    }
}

/// A logged-in session. Every call made through it keeps the stored blob
/// current and recovers once from an expired login.
pub struct AuthenticatedSession {
    session: Session,
    credentials: Credentials,
    store: SessionStore,
    service: Arc<dyn PhotoService>,
}

impl AuthenticatedSession {
    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    #[instrument(skip(self))]
    pub async fn resolve_target(&mut self, handle: &str) -> Result<Target, SessionError> {
        let user = self.user_info(handle).await?;
        let is_followed_by_me = if user.pk.to_string() == self.session.user_id {
            true
        } else {
            self.friendship(user.pk).await?.following
        };
        let target = Target {
            id: user.pk,
            handle: user.username,
            is_private: user.is_private,
            is_followed_by_me,
        };
        info!(id = target.id, private = target.is_private, followed = target.is_followed_by_me, "resolved target");
        Ok(target)
    }

    pub async fn user_info(&mut self, handle: &str) -> Result<UserInfo, SessionError> {
        let first = self.service.user_info(&self.session, handle).await;
        let reply = match first {
            Ok(reply) => reply,
            Err(e) => {
                self.recover(e).await?;
                self.service.user_info(&self.session, handle).await?
            }
        };
        self.absorb(reply)
    }

    pub async fn friendship(&mut self, user_id: u64) -> Result<Friendship, SessionError> {
        let first = self.service.friendship(&self.session, user_id).await;
        let reply = match first {
            Ok(reply) => reply,
            Err(e) => {
                self.recover(e).await?;
                self.service.friendship(&self.session, user_id).await?
            }
        };
        self.absorb(reply)
    }

    pub async fn user_feed(&mut self, user_id: u64, max_id: Option<&str>) -> Result<FeedPage, SessionError> {
        let first = self.service.user_feed(&self.session, user_id, max_id).await;
        let reply = match first {
            Ok(reply) => reply,
            Err(e) => {
                self.recover(e).await?;
                self.service.user_feed(&self.session, user_id, max_id).await?
            }
        };
        self.absorb(reply)
    }

    /// Log in again when `error` reports an expired login; otherwise return it.
    async fn recover(&mut self, error: ServiceError) -> Result<(), SessionError> {
        if !error.is_auth_expired() {
            return Err(error.into());
        }
        warn!(error = %error, "session expired mid-run, logging in again");
        self.store.discard()?;
        self.session = self.service.login(&self.credentials).await?;
        self.store.save(&self.session.settings)?;
        Ok(())
    }

    fn absorb<T>(&mut self, reply: Reply<T>) -> Result<T, SessionError> {
        if let Some(cookie) = reply.cookie {
            if self.session.cookie() != Some(cookie.as_slice()) {
                self.session.set_cookie(cookie);
                self.store.save(&self.session.settings)?;
                tracing::debug!("stored rotated session cookie");
            }
        }
        Ok(reply.body)
    }
}
