//! Feed enumeration: cursor pagination and carousel flattening.

use crate::session::{AuthenticatedSession, SessionError, Target};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_MAX_PAGES: usize = 500;

/// One downloadable image and the post it belongs to. Carousel siblings
/// share a `post_code`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhotoReference {
    pub download_url: String,
    pub post_code: String,
}

fn first_candidate(media: &Value) -> Option<&str> {
    media
        .get("image_versions2")?
        .get("candidates")?
        .as_array()?
        .first()?
        .get("url")?
        .as_str()
        .filter(|url| !url.is_empty())
}

/// References for a single feed item; empty when the item is malformed.
pub fn flatten_item(item: &Value) -> Vec<PhotoReference> {
    let Some(code) = item.get("code").and_then(Value::as_str) else {
        debug!("skipping feed item without a code");
        return Vec::new();
    };
    let reference = |url: &str| PhotoReference {
        download_url: url.to_string(),
        post_code: code.to_string(),
    };

    if item.get("image_versions2").is_some() {
        return match first_candidate(item) {
            Some(url) => vec![reference(url)],
            None => {
                debug!(code, "skipping feed item without image candidates");
                Vec::new()
            }
        };
    }

    match item.get("carousel_media").and_then(Value::as_array) {
        Some(children) => children
            .iter()
            .enumerate()
            .filter_map(|(index, child)| {
                let url = first_candidate(child);
                if url.is_none() {
                    debug!(code, index, "skipping malformed carousel entry");
                }
                url.map(reference)
            })
            .collect(),
        None => {
            debug!(code, "skipping feed item with no image or carousel");
            Vec::new()
        }
    }
}

pub struct FeedPaginator<'a> {
    session: &'a mut AuthenticatedSession,
    max_pages: usize,
}

impl<'a> FeedPaginator<'a> {
    pub fn new(session: &'a mut AuthenticatedSession) -> Self {
        Self {
            session,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Every photo in the target's feed, in feed order, each URL once.
    /// A private account that is not followed yields nothing.
    #[instrument(skip(self, target), fields(target = %target.handle))]
    pub async fn list_photos(&mut self, target: &Target) -> Result<Vec<PhotoReference>, SessionError> {
        if !target.is_visible() {
            warn!("target account is private and not followed, nothing to enumerate");
            return Ok(Vec::new());
        }

        let mut seen_urls = HashSet::new();
        let mut seen_cursors = HashSet::new();
        let mut photos = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.session.user_feed(target.id, cursor.as_deref()).await?;
            pages += 1;
            let before = photos.len();
            for item in &page.items {
                for reference in flatten_item(item) {
                    if seen_urls.insert(reference.download_url.clone()) {
                        photos.push(reference);
                    }
                }
            }
            debug!(page = pages, items = page.items.len(), photos = photos.len() - before, "fetched feed page");

            let next = match page.next_max_id {
                Some(next) if !next.is_empty() => next,
                _ => break,
            };
            if !seen_cursors.insert(next.clone()) {
                warn!(cursor = %next, "feed cursor repeated, stopping");
                break;
            }
            if pages >= self.max_pages {
                warn!(pages, "page limit reached, stopping");
                break;
            }
            cursor = Some(next);
        }

        info!(pages, photos = photos.len(), "enumerated feed");
        Ok(photos)
    }
}
