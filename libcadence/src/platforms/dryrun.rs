//! Dry-run adapter
//!
//! Logs what would have been published and returns a synthetic post id. The
//! server registers one per enabled platform; real platform clients plug in
//! behind the same trait.

use async_trait::async_trait;
use tracing::info;

use crate::error::PlatformError;
use crate::platforms::{Platform, Published};
use crate::types::unix_now;

#[derive(Debug, Clone)]
pub struct DryRunPlatform {
    name: String,
    character_limit: Option<usize>,
}

impl DryRunPlatform {
    /// Uses the well-known limit for the platform id when there is one
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            character_limit: known_limit(name),
        }
    }

    pub fn with_limit(name: &str, limit: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            character_limit: limit,
        }
    }
}

fn known_limit(name: &str) -> Option<usize> {
    match name {
        "mastodon" => Some(500),
        "bluesky" => Some(300),
        "x" | "twitter" => Some(280),
        _ => None,
    }
}

#[async_trait]
impl Platform for DryRunPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn character_limit(&self) -> Option<usize> {
        self.character_limit
    }

    async fn publish(&self, content: &str) -> Result<Published, PlatformError> {
        self.validate_content(content)?;

        let external_post_id = format!("dryrun-{}", uuid::Uuid::new_v4());
        info!(
            platform = %self.name,
            %external_post_id,
            chars = content.chars().count(),
            "Dry run: not sending post"
        );

        Ok(Published {
            external_post_id,
            published_at: unix_now(),
        })
    }
}
