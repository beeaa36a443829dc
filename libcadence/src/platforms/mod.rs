//! Platform abstraction and the adapter registry
//!
//! Every destination a campaign can publish to is a [`Platform`]. The queue
//! never knows which concrete adapter it is talking to: it asks the
//! [`PlatformRegistry`] for the adapter by id and calls `publish`. Adding a
//! platform means registering one more implementation.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcadence::platforms::{PlatformRegistry, dryrun::DryRunPlatform};
//!
//! # async fn example() -> Result<(), libcadence::error::PlatformError> {
//! let registry = PlatformRegistry::new().with(Arc::new(DryRunPlatform::new("mastodon")));
//!
//! if let Some(platform) = registry.resolve("mastodon") {
//!     platform.validate_content("Hello, fediverse!")?;
//!     let published = platform.publish("Hello, fediverse!").await?;
//!     println!("Published as {}", published.external_post_id);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PlatformError;

pub mod dryrun;

// Available outside tests so integration tests and demos can script outcomes
pub mod mock;

/// What a platform hands back for a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Published {
    /// Platform-specific post id (status id, note id, ...)
    pub external_post_id: String,
    /// Unix seconds at which the platform accepted the post
    pub published_at: i64,
}

/// Platform trait for unified publishing
///
/// Implementations must be cheap to share: the registry holds them behind an
/// `Arc` and every worker calls into the same instance.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Lowercase platform id, e.g. "mastodon"
    fn name(&self) -> &str;

    /// Whether the adapter has what it needs (credentials, endpoint) to publish
    fn is_configured(&self) -> bool;

    /// Maximum post length in characters, `None` for no hard limit
    fn character_limit(&self) -> Option<usize>;

    /// Check content against platform rules before publishing
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Validation` for empty content or content longer
    /// than [`Platform::character_limit`].
    fn validate_content(&self, content: &str) -> Result<(), PlatformError> {
        if content.trim().is_empty() {
            return Err(PlatformError::Validation(
                "Content cannot be empty".to_string(),
            ));
        }

        if let Some(limit) = self.character_limit() {
            let length = content.chars().count();
            if length > limit {
                return Err(PlatformError::Validation(format!(
                    "Content exceeds {} character limit (got {} characters)",
                    limit, length
                )));
            }
        }

        Ok(())
    }

    /// Publish content and return the platform's post id
    ///
    /// # Errors
    ///
    /// - `PlatformError::Authentication` when credentials are rejected
    /// - `PlatformError::Network` / `RateLimit` for conditions worth retrying
    /// - `PlatformError::Posting` when the platform refused the post
    async fn publish(&self, content: &str) -> Result<Published, PlatformError>;
}

/// Adapters keyed by platform id
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    platforms: HashMap<String, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous one
    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.name().to_string(), platform);
    }

    pub fn with(mut self, platform: Arc<dyn Platform>) -> Self {
        self.register(platform);
        self
    }

    /// A registry with a [`dryrun::DryRunPlatform`] for each name
    pub fn dry_run<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(Self::new(), |registry, name| {
            registry.with(Arc::new(dryrun::DryRunPlatform::new(name.as_ref())))
        })
    }

    /// The adapter for `name` if it is registered and configured
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.platforms
            .get(name)
            .filter(|platform| platform.is_configured())
            .cloned()
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Names of every adapter that can publish right now, sorted
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .platforms
            .values()
            .filter(|p| p.is_configured())
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("available", &self.available())
            .finish()
    }
}
