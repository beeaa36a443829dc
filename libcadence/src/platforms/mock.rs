//! Mock platform implementation for testing
//!
//! A scriptable adapter that can succeed, fail a fixed number of times before
//! succeeding, fail forever, or stall. Counters and the list of published
//! content are shared through `Arc`s so a test can keep a handle after the
//! platform has been moved into a registry.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PlatformError;
use crate::platforms::{Platform, Published};
use crate::types::unix_now;

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Platform name (e.g., "mastodon", "mock-nostr")
    pub name: String,

    /// Error returned by failing publishes; `None` means publishes succeed
    pub publish_error: Option<PlatformError>,

    /// How many publishes fail before the rest succeed.
    /// `None` with a `publish_error` means every publish fails.
    pub failures_before_success: Option<usize>,

    /// Delay before completing a publish (simulates network latency)
    pub delay: Duration,

    pub character_limit: Option<usize>,

    pub is_configured: bool,

    /// Number of times publish has been called
    pub publish_calls: Arc<AtomicUsize>,

    /// Content of every successful publish, in order
    pub published_content: Arc<Mutex<Vec<String>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            publish_error: None,
            failures_before_success: None,
            delay: Duration::from_millis(0),
            character_limit: None,
            is_configured: true,
            publish_calls: Arc::new(AtomicUsize::new(0)),
            published_content: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock platform for testing
#[derive(Debug, Clone)]
pub struct MockPlatform {
    config: MockConfig,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A mock platform that always publishes
    pub fn success(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// A mock platform whose every publish fails with `PlatformError::Posting`
    pub fn failing(name: &str, error: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            publish_error: Some(PlatformError::Posting(error.to_string())),
            ..Default::default()
        })
    }

    /// Fails the first `failures` publishes with a network error, then succeeds
    pub fn flaky(name: &str, failures: usize) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            publish_error: Some(PlatformError::Network("connection reset".to_string())),
            failures_before_success: Some(failures),
            ..Default::default()
        })
    }

    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            delay,
            ..Default::default()
        })
    }

    pub fn with_limit(name: &str, limit: usize) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            character_limit: Some(limit),
            ..Default::default()
        })
    }

    pub fn not_configured(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            is_configured: false,
            ..Default::default()
        })
    }

    pub fn publish_calls(&self) -> usize {
        self.config.publish_calls.load(Ordering::SeqCst)
    }

    pub fn published_content(&self) -> Vec<String> {
        self.content_log().clone()
    }

    fn content_log(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        // A panicking test thread must not hide what was published before it
        self.config
            .published_content
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn should_fail(&self, call_index: usize) -> Option<PlatformError> {
        let error = self.config.publish_error.clone()?;
        match self.config.failures_before_success {
            Some(failures) if call_index >= failures => None,
            _ => Some(error),
        }
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured
    }

    fn character_limit(&self) -> Option<usize> {
        self.config.character_limit
    }

    async fn publish(&self, content: &str) -> Result<Published, PlatformError> {
        let call_index = self.config.publish_calls.fetch_add(1, Ordering::SeqCst);

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if let Some(error) = self.should_fail(call_index) {
            return Err(error);
        }

        self.content_log().push(content.to_string());

        Ok(Published {
            external_post_id: format!("{}:mock-{}", self.config.name, uuid::Uuid::new_v4()),
            published_at: unix_now(),
        })
    }
}
