//! Photo post model (projection of a Bluesky feed post with image embeds)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A feed post that carries at least one image embed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoPost {
    /// at:// URI of the post record
    pub uri: String,
    /// Content hash of the record (needed for likes)
    pub cid: String,
    /// Author DID
    pub author_did: String,
    /// Author handle
    pub author_handle: String,
    /// Author display name
    pub author_name: Option<String>,
    /// Author avatar URL
    pub author_avatar: Option<String>,
    /// Post text (caption)
    pub text: String,
    /// Embedded images
    pub images: Vec<PhotoEmbed>,
    /// Number of likes
    pub like_count: u32,
    /// Whether the current viewer has liked this post
    pub liked: bool,
    /// When the post was indexed by the network
    pub indexed_at: DateTime<Utc>,
}

/// One embedded image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoEmbed {
    /// Thumbnail URL
    pub thumb: String,
    /// Full-size URL
    pub fullsize: String,
    /// Alt text description
    pub alt: Option<String>,
}

impl PhotoPost {
    /// URL to the post on the web
    pub fn web_url(&self) -> String {
        format!(
            "https://bsky.app/profile/{}/post/{}",
            self.author_handle,
            self.uri.split('/').next_back().unwrap_or("")
        )
    }

    /// Get a short preview of the caption (for list display)
    pub fn preview(&self, max_len: usize) -> String {
        let text = self.text.replace('\n', " ");
        if text.len() <= max_len {
            return text;
        }
        // Back the cut off to a char boundary so multibyte captions never
        // split mid-character.
        let mut cut = max_len.saturating_sub(3);
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }

    /// Get relative time string (e.g., "5m", "2h", "3d")
    pub fn relative_time(&self) -> String {
        let now = Utc::now();
        let duration = now.signed_duration_since(self.indexed_at);

        if duration.num_seconds() < 60 {
            format!("{}s", duration.num_seconds())
        } else if duration.num_minutes() < 60 {
            format!("{}m", duration.num_minutes())
        } else if duration.num_hours() < 24 {
            format!("{}h", duration.num_hours())
        } else if duration.num_days() < 7 {
            format!("{}d", duration.num_days())
        } else {
            self.indexed_at.format("%b %d").to_string()
        }
    }
}
