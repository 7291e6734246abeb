//! lookout-remote: remote account access for Lookout.
//!
//! Authenticates against the photo service with a cached settings blob,
//! enumerates a target's feed and downloads the photos with bounded
//! concurrency.

pub mod download;
pub mod feed;
pub mod http;
pub mod service;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use download::{DownloadCoordinator, DownloadError, DownloadOptions, DownloadReport, Progress};
pub use feed::{FeedPaginator, PhotoReference};
pub use http::{HttpPhotoService, DEFAULT_API_URL};
pub use service::{ApiError, Credentials, PhotoService, ServiceError, Session};
pub use session::{AuthenticatedSession, SessionConfig, SessionError, SessionManager, Target};
pub use store::{SessionStore, SettingValue, Settings, StoreError};
