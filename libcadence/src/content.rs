//! Content generation
//!
//! Jobs either carry fixed content or a prompt. Prompts are turned into post
//! text by a [`ContentGenerator`]; the call is bounded by a timeout and can be
//! cancelled when the daemon shuts down.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GenerationError;
use crate::types::Job;

/// What a generator knows about the post it is writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationContext {
    pub campaign_id: String,
    pub campaign_name: String,
    pub platform: String,
    pub character_limit: Option<usize>,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<String, GenerationError>;
}

/// Fills `{campaign}`, `{platform}` and `{date}` placeholders in the prompt
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator;

impl TemplateGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<String, GenerationError> {
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let text = prompt
            .replace("{campaign}", &context.campaign_name)
            .replace("{platform}", &context.platform)
            .replace("{date}", &date);
        let text = text.trim();

        if text.is_empty() {
            return Err(GenerationError::Failed(
                "template produced empty content".to_string(),
            ));
        }

        Ok(truncate_chars(text, context.character_limit))
    }
}

/// Cut to at most `limit` characters, marking the cut with an ellipsis
fn truncate_chars(text: &str, limit: Option<usize>) -> String {
    match limit {
        Some(limit) if limit > 0 && text.chars().count() > limit => {
            let mut cut: String = text.chars().take(limit - 1).collect();
            cut.truncate(cut.trim_end().len());
            cut.push('…');
            cut
        }
        _ => text.to_string(),
    }
}

/// Content for a job: its fixed content if present, otherwise generated from
/// its prompt within `timeout`
///
/// # Errors
///
/// `Failed` when the job has neither content nor prompt or the generator
/// fails, `Timeout` when the generator is too slow, `Cancelled` when
/// `cancel` fires first.
pub async fn resolve_content(
    job: &Job,
    generator: &dyn ContentGenerator,
    context: &GenerationContext,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, GenerationError> {
    if let Some(content) = job.content.as_deref().filter(|c| !c.trim().is_empty()) {
        return Ok(content.to_string());
    }

    let prompt = job
        .prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            GenerationError::Failed(format!("job {} has neither content nor prompt", job.id))
        })?;

    debug!(job_id = %job.id, platform = %context.platform, "Generating content");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenerationError::Cancelled),
        result = tokio::time::timeout(timeout, generator.generate(prompt, context)) => {
            result.map_err(|_| GenerationError::Timeout(timeout.as_secs()))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobState;

    fn context(limit: Option<usize>) -> GenerationContext {
        GenerationContext {
            campaign_id: "c-1".to_string(),
            campaign_name: "Spring Launch".to_string(),
            platform: "mastodon".to_string(),
            character_limit: limit,
        }
    }

    fn job(content: Option<&str>, prompt: Option<&str>) -> Job {
        Job {
            id: "job-1".to_string(),
            campaign_id: "c-1".to_string(),
            account_id: "acct".to_string(),
            platform: "mastodon".to_string(),
            content: content.map(str::to_string),
            prompt: prompt.map(str::to_string),
            estimated_cost: 20,
            dedupe_key: "c-1:mastodon:1".to_string(),
            state: JobState::Running,
            attempts: 0,
            max_attempts: 3,
            next_run_at: 0,
            hold_id: None,
            last_error: None,
            dead_reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    struct StalledGenerator;

    #[async_trait]
    impl ContentGenerator for StalledGenerator {
        async fn generate(&self, _: &str, _: &GenerationContext) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
    }

    #[tokio::test]
    async fn test_template_substitutes_placeholders() {
        let text = TemplateGenerator::new()
            .generate("{campaign} is live on {platform}", &context(None))
            .await
            .unwrap();
        assert_eq!(text, "Spring Launch is live on mastodon");
    }

    #[tokio::test]
    async fn test_template_truncates_to_limit() {
        let text = TemplateGenerator::new()
            .generate("abcdefghijklmnop", &context(Some(8)))
            .await
            .unwrap();
        assert_eq!(text.chars().count(), 8);
        assert!(text.ends_with('…'));
    }

    #[tokio::test]
    async fn test_template_rejects_empty_output() {
        let result = TemplateGenerator::new().generate("   ", &context(None)).await;
        assert!(matches!(result, Err(GenerationError::Failed(_))));
    }

    #[tokio::test]
    async fn test_fixed_content_skips_generator() {
        let token = CancellationToken::new();
        let text = resolve_content(
            &job(Some("fixed"), Some("ignored")),
            &StalledGenerator,
            &context(None),
            Duration::from_millis(10),
            &token,
        )
        .await
        .unwrap();
        assert_eq!(text, "fixed");
    }

    #[tokio::test]
    async fn test_generation_times_out() {
        let token = CancellationToken::new();
        let result = resolve_content(
            &job(None, Some("write something")),
            &StalledGenerator,
            &context(None),
            Duration::from_millis(20),
            &token,
        )
        .await;
        assert!(matches!(result, Err(GenerationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_generation_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = resolve_content(
            &job(None, Some("write something")),
            &StalledGenerator,
            &context(None),
            Duration::from_secs(5),
            &token,
        )
        .await;
        assert_eq!(result, Err(GenerationError::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_content_and_prompt() {
        let token = CancellationToken::new();
        let result = resolve_content(
            &job(None, None),
            &TemplateGenerator,
            &context(None),
            Duration::from_secs(1),
            &token,
        )
        .await;
        assert!(matches!(result, Err(GenerationError::Failed(_))));
    }
}
