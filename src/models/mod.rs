//! Data models

mod account;
mod post;

pub use account::AccountCredential;
pub use post::{PhotoEmbed, PhotoPost};
