//! Bluesky (AT Protocol) XRPC client
//!
//! [`BlueskyGateway`] implements the session wire calls (createSession,
//! refreshSession, deleteSession) with the error mapping the session core
//! relies on. [`Agent`] is an immutable handle bound to one account's
//! tokens, carrying the authenticated photo-feed RPCs.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{AtpGateway, CreatedSession, RefreshedSession};
use crate::error::SessionError;
use crate::models::{AccountCredential, PhotoEmbed, PhotoPost};

/// Default PDS URL for Bluesky
pub const DEFAULT_SERVICE: &str = "https://bsky.social";

const IMAGE_EMBED_VIEW: &str = "app.bsky.embed.images#view";

/// HTTPS implementation of the session wire calls
#[derive(Debug, Clone, Default)]
pub struct BlueskyGateway {
    client: Client,
}

impl BlueskyGateway {
    /// Create a gateway with a fresh HTTP client
    pub fn new() -> Self {
        Self::default()
    }
}

impl AtpGateway for BlueskyGateway {
    async fn create_session(
        &self,
        service: &str,
        identifier: &str,
        password: &str,
    ) -> Result<CreatedSession, SessionError> {
        let url = xrpc(service, "com.atproto.server.createSession");
        let request = CreateSessionRequest {
            identifier: identifier.to_string(),
            password: password.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SessionError::ConnectionFailed(Some(e)))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(SessionError::RateLimited {
                retry_after: retry_after(&response),
            }),
            StatusCode::UNAUTHORIZED => Err(SessionError::InvalidCredentials),
            status if !status.is_success() => Err(SessionError::ConnectionFailed(None)),
            _ => {
                let session: CreateSessionResponse = response
                    .json()
                    .await
                    .map_err(|e| SessionError::ConnectionFailed(Some(e)))?;
                Ok(CreatedSession {
                    did: session.did,
                    handle: session.handle,
                    access_jwt: session.access_jwt,
                    refresh_jwt: session.refresh_jwt,
                    active: session.active.unwrap_or(true),
                })
            }
        }
    }

    async fn refresh_session(
        &self,
        service: &str,
        refresh_jwt: &str,
    ) -> Result<RefreshedSession, SessionError> {
        let url = xrpc(service, "com.atproto.server.refreshSession");

        let response = self
            .client
            .post(&url)
            .bearer_auth(refresh_jwt)
            .send()
            .await
            .map_err(|e| SessionError::ConnectionFailed(Some(e)))?;

        match response.status() {
            // The PDS answers 400 ExpiredToken / 401 InvalidToken when the
            // refresh token is dead; both are unrecoverable for the caller.
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                Err(SessionError::RefreshRejected)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(SessionError::RateLimited {
                retry_after: retry_after(&response),
            }),
            status if !status.is_success() => Err(SessionError::ConnectionFailed(None)),
            _ => {
                let session: RefreshSessionResponse = response
                    .json()
                    .await
                    .map_err(|e| SessionError::ConnectionFailed(Some(e)))?;
                Ok(RefreshedSession {
                    access_jwt: session.access_jwt,
                    refresh_jwt: session.refresh_jwt,
                })
            }
        }
    }

    async fn delete_session(
        &self,
        service: &str,
        refresh_jwt: &str,
    ) -> Result<(), SessionError> {
        let url = xrpc(service, "com.atproto.server.deleteSession");

        let response = self
            .client
            .post(&url)
            .bearer_auth(refresh_jwt)
            .send()
            .await
            .map_err(|e| SessionError::ConnectionFailed(Some(e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SessionError::ConnectionFailed(None))
        }
    }
}

fn xrpc(service: &str, method: &str) -> String {
    format!("{}/xrpc/{}", service.trim_end_matches('/'), method)
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Authenticated protocol handle bound to one account's tokens.
///
/// Agents are immutable values: switching account means binding a different
/// agent, never mutating a shared one in place.
pub struct Agent {
    client: Client,
    service: String,
    access_jwt: String,
    did: String,
}

impl Agent {
    /// Bind an agent to a credential; performs no network call.
    pub fn bind(service: &str, credential: &AccountCredential) -> Self {
        Self {
            client: Client::new(),
            service: service.trim_end_matches('/').to_string(),
            access_jwt: credential.access_jwt.clone(),
            did: credential.did.clone(),
        }
    }

    /// The DID this agent acts as
    pub fn did(&self) -> &str {
        &self.did
    }

    async fn get(&self, method: &str, query: &str) -> Result<reqwest::Response> {
        let url = format!("{}?{}", xrpc(&self.service, method), query);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_jwt)
            .send()
            .await
            .with_context(|| format!("Failed to call {method}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("{method} failed ({status}): {error_text}");
        }
        Ok(response)
    }

    /// Fetch the home timeline, keeping only posts with image embeds.
    ///
    /// Over-fetches so that filtering still yields roughly `limit` photos.
    pub async fn photo_timeline(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<PhotoPost>, Option<String>)> {
        let mut query = format!("limit={}", (limit * 2).min(100));
        if let Some(cursor) = cursor {
            query.push_str(&format!("&cursor={}", urlencoding::encode(cursor)));
        }

        let response = self.get("app.bsky.feed.getTimeline", &query).await?;
        let timeline: GetTimelineResponse = response
            .json()
            .await
            .context("Failed to parse timeline response")?;

        let mut posts: Vec<PhotoPost> = timeline
            .feed
            .into_iter()
            .filter_map(|item| item.post.into_photo_post())
            .collect();
        posts.sort_by(|a, b| b.indexed_at.cmp(&a.indexed_at));
        posts.truncate(limit);

        Ok((posts, timeline.cursor))
    }

    /// Fetch an author's feed, keeping only posts with image embeds.
    pub async fn author_photos(
        &self,
        actor: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<PhotoPost>, Option<String>)> {
        let mut query = format!(
            "actor={}&limit={}",
            urlencoding::encode(actor),
            (limit * 2).min(100)
        );
        if let Some(cursor) = cursor {
            query.push_str(&format!("&cursor={}", urlencoding::encode(cursor)));
        }

        let response = self.get("app.bsky.feed.getAuthorFeed", &query).await?;
        let feed: GetTimelineResponse = response
            .json()
            .await
            .context("Failed to parse author feed response")?;

        let mut posts: Vec<PhotoPost> = feed
            .feed
            .into_iter()
            .filter_map(|item| item.post.into_photo_post())
            .collect();
        posts.truncate(limit);

        Ok((posts, feed.cursor))
    }

    /// Search posts, keeping only results with image embeds.
    pub async fn search_photos(
        &self,
        q: &str,
        limit: usize,
        sort: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<PhotoPost>, Option<String>)> {
        let mut query = format!(
            "q={}&limit={}&sort={}",
            urlencoding::encode(q),
            (limit * 2).min(100),
            urlencoding::encode(sort)
        );
        if let Some(cursor) = cursor {
            query.push_str(&format!("&cursor={}", urlencoding::encode(cursor)));
        }

        let response = self.get("app.bsky.feed.searchPosts", &query).await?;
        let results: SearchPostsResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        let mut posts: Vec<PhotoPost> = results
            .posts
            .into_iter()
            .filter_map(PostView::into_photo_post)
            .collect();
        posts.truncate(limit);

        Ok((posts, results.cursor))
    }

    /// Create a post, optionally with one attached image.
    ///
    /// Returns the at:// URI of the created record.
    pub async fn create_post(&self, text: &str, image: Option<ImageUpload>) -> Result<String> {
        let embed = match image {
            Some(image) => Some(self.upload_image(image).await?),
            None => None,
        };

        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let record = PostRecord {
            r#type: "app.bsky.feed.post".to_string(),
            text: text.to_string(),
            created_at: now,
            embed,
        };

        let request = CreateRecordRequest {
            repo: self.did.clone(),
            collection: "app.bsky.feed.post".to_string(),
            record,
        };

        let result = self.create_record(&request).await?;
        Ok(result.uri)
    }

    async fn upload_image(&self, image: ImageUpload) -> Result<ImagesEmbed> {
        let url = xrpc(&self.service, "com.atproto.repo.uploadBlob");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_jwt)
            .header(reqwest::header::CONTENT_TYPE, &image.mime_type)
            .body(image.bytes)
            .send()
            .await
            .context("Failed to upload image")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            bail!("Failed to upload image: {error_text}");
        }

        let uploaded: UploadBlobResponse = response
            .json()
            .await
            .context("Failed to parse upload response")?;

        Ok(ImagesEmbed {
            r#type: "app.bsky.embed.images".to_string(),
            images: vec![EmbedImageRef {
                image: uploaded.blob,
                alt: image.alt.unwrap_or_default(),
            }],
        })
    }

    /// Like a post by its at:// URI and CID
    pub async fn like(&self, uri: &str, cid: &str) -> Result<()> {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let record = LikeRecord {
            r#type: "app.bsky.feed.like".to_string(),
            subject: RecordRef {
                uri: uri.to_string(),
                cid: cid.to_string(),
            },
            created_at: now,
        };

        let request = CreateRecordRequest {
            repo: self.did.clone(),
            collection: "app.bsky.feed.like".to_string(),
            record,
        };

        self.create_record(&request).await?;
        Ok(())
    }

    /// Remove this account's like on a post, if one exists
    pub async fn unlike(&self, uri: &str) -> Result<()> {
        // Find our like record for this post in our own repo.
        let query = format!(
            "repo={}&collection=app.bsky.feed.like&limit=100",
            urlencoding::encode(&self.did)
        );
        let response = self.get("com.atproto.repo.listRecords", &query).await?;
        let records: ListRecordsResponse = response
            .json()
            .await
            .context("Failed to parse like records")?;

        let Some(like) = records
            .records
            .iter()
            .find(|r| r.value.subject.uri == uri)
        else {
            // Already unliked or never liked
            return Ok(());
        };

        let rkey = like
            .uri
            .split('/')
            .next_back()
            .context("Invalid like record URI")?;

        let url = xrpc(&self.service, "com.atproto.repo.deleteRecord");
        let request = DeleteRecordRequest {
            repo: self.did.clone(),
            collection: "app.bsky.feed.like".to_string(),
            rkey: rkey.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_jwt)
            .json(&request)
            .send()
            .await
            .context("Failed to delete like")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            bail!("Failed to unlike: {error_text}");
        }

        Ok(())
    }

    /// Fetch a profile by DID or handle
    pub async fn get_profile(&self, actor: &str) -> Result<Profile> {
        let query = format!("actor={}", urlencoding::encode(actor));
        let response = self.get("app.bsky.actor.getProfile", &query).await?;
        response.json().await.context("Failed to parse profile")
    }

    async fn create_record<T: Serialize>(
        &self,
        request: &CreateRecordRequest<T>,
    ) -> Result<CreateRecordResponse> {
        let url = xrpc(&self.service, "com.atproto.repo.createRecord");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_jwt)
            .json(request)
            .send()
            .await
            .context("Failed to create record")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            bail!("Failed to create record: {error_text}");
        }

        response
            .json()
            .await
            .context("Failed to parse create record response")
    }
}

/// An image to attach to a new post
pub struct ImageUpload {
    /// Raw image bytes
    pub bytes: Vec<u8>,
    /// MIME type (e.g. image/jpeg)
    pub mime_type: String,
    /// Alt text description
    pub alt: Option<String>,
}

/// Actor profile view
#[derive(Debug, Deserialize)]
pub struct Profile {
    /// Account DID
    pub did: String,
    /// Account handle
    pub handle: String,
    /// Display name
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    /// Profile description
    pub description: Option<String>,
    /// Avatar URL
    pub avatar: Option<String>,
    /// Follower count
    #[serde(rename = "followersCount", default)]
    pub followers_count: u32,
    /// Following count
    #[serde(rename = "followsCount", default)]
    pub follows_count: u32,
    /// Post count
    #[serde(rename = "postsCount", default)]
    pub posts_count: u32,
}

// ==================== API Types ====================

#[derive(Debug, Serialize)]
struct CreateSessionRequest {
    identifier: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    did: String,
    handle: String,
    #[serde(rename = "accessJwt")]
    access_jwt: String,
    #[serde(rename = "refreshJwt")]
    refresh_jwt: String,
    #[serde(default)]
    active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RefreshSessionResponse {
    #[serde(rename = "accessJwt")]
    access_jwt: String,
    #[serde(rename = "refreshJwt")]
    refresh_jwt: String,
}

#[derive(Debug, Deserialize)]
struct GetTimelineResponse {
    feed: Vec<FeedViewPost>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchPostsResponse {
    posts: Vec<PostView>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedViewPost {
    post: PostView,
}

#[derive(Debug, Deserialize)]
struct PostView {
    uri: String,
    cid: String,
    author: Author,
    record: PostRecordView,
    #[serde(rename = "likeCount", default)]
    like_count: u32,
    #[serde(rename = "indexedAt")]
    indexed_at: String,
    #[serde(default)]
    embed: Option<EmbedView>,
    #[serde(default)]
    viewer: Option<ViewerState>,
}

#[derive(Debug, Deserialize)]
struct Author {
    did: String,
    handle: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostRecordView {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedView {
    #[serde(rename = "$type")]
    embed_type: String,
    #[serde(default)]
    images: Option<Vec<ImageView>>,
}

#[derive(Debug, Deserialize)]
struct ImageView {
    thumb: String,
    fullsize: String,
    alt: Option<String>,
}

/// Viewer state for a post (whether current user liked it)
#[derive(Debug, Deserialize, Default)]
struct ViewerState {
    /// URI of the like record if liked by viewer
    like: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<T> {
    repo: String,
    collection: String,
    record: T,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
    #[allow(dead_code)]
    cid: String,
}

#[derive(Debug, Serialize)]
struct PostRecord {
    #[serde(rename = "$type")]
    r#type: String,
    text: String,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    embed: Option<ImagesEmbed>,
}

#[derive(Debug, Serialize)]
struct ImagesEmbed {
    #[serde(rename = "$type")]
    r#type: String,
    images: Vec<EmbedImageRef>,
}

#[derive(Debug, Serialize)]
struct EmbedImageRef {
    // The blob ref comes back from uploadBlob; re-embedded untouched.
    image: serde_json::Value,
    alt: String,
}

#[derive(Debug, Serialize)]
struct LikeRecord {
    #[serde(rename = "$type")]
    r#type: String,
    subject: RecordRef,
    #[serde(rename = "createdAt")]
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordRef {
    uri: String,
    cid: String,
}

#[derive(Debug, Deserialize)]
struct UploadBlobResponse {
    blob: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    records: Vec<LikeRecordItem>,
}

#[derive(Debug, Deserialize)]
struct LikeRecordItem {
    uri: String,
    value: LikeRecordValue,
}

#[derive(Debug, Deserialize)]
struct LikeRecordValue {
    subject: LikeSubject,
}

#[derive(Debug, Deserialize)]
struct LikeSubject {
    uri: String,
}

#[derive(Debug, Serialize)]
struct DeleteRecordRequest {
    repo: String,
    collection: String,
    rkey: String,
}

impl PostView {
    /// Project to a photo post; `None` if the post carries no image embed
    fn into_photo_post(self) -> Option<PhotoPost> {
        let embed = self.embed?;
        if embed.embed_type != IMAGE_EMBED_VIEW {
            return None;
        }
        let images = embed.images?;
        if images.is_empty() {
            return None;
        }

        let indexed_at = DateTime::parse_from_rfc3339(&self.indexed_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let liked = self.viewer.as_ref().is_some_and(|v| v.like.is_some());

        Some(PhotoPost {
            uri: self.uri,
            cid: self.cid,
            author_did: self.author.did,
            author_handle: self.author.handle,
            author_name: self.author.display_name,
            author_avatar: self.author.avatar,
            text: self.record.text,
            images: images
                .into_iter()
                .map(|img| PhotoEmbed {
                    thumb: img.thumb,
                    fullsize: img.fullsize,
                    alt: img.alt,
                })
                .collect(),
            like_count: self.like_count,
            liked,
            indexed_at,
        })
    }
}
