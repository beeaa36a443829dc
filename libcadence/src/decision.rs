//! Decision engine
//!
//! Given the campaigns, their recent post history and the current time,
//! decides which (campaign, platform) pairs are due and in which order. The
//! engine is pure: it never touches storage, so the same inputs always produce
//! the same [`Decision`].

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::config::CostConfig;
use crate::types::{Campaign, PostRecord};

/// Fixed per-action cost, optionally overridden per platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostTable {
    default: i64,
    overrides: HashMap<String, i64>,
}

impl CostTable {
    pub fn new(default: i64) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, platform: &str, cost: i64) -> Self {
        self.overrides.insert(platform.to_string(), cost);
        self
    }

    pub fn from_config(config: &CostConfig) -> Self {
        Self {
            default: config.default,
            overrides: config.platforms.clone(),
        }
    }

    pub fn cost_for(&self, platform: &str) -> i64 {
        self.overrides.get(platform).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// cadence_secs <= 0
    InvalidCadence,
    /// No registered and configured adapter for the platform
    PlatformUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipped {
    pub campaign_id: String,
    pub platform: Option<String>,
    pub reason: SkipReason,
}

/// One publish the engine wants to happen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAction {
    pub campaign_id: String,
    pub account_id: String,
    pub platform: String,
    pub estimated_cost: i64,
    pub score: i64,
    pub content: Option<String>,
    pub prompt: Option<String>,
    /// Index of the cadence window this action belongs to
    pub occurrence: i64,
    /// Enqueueing the same key twice yields one job
    pub dedupe_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// Highest score first
    pub candidates: Vec<CandidateAction>,
    pub skipped: Vec<Skipped>,
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    costs: CostTable,
    available_platforms: BTreeSet<String>,
}

impl DecisionEngine {
    pub fn new(costs: CostTable, available_platforms: BTreeSet<String>) -> Self {
        Self {
            costs,
            available_platforms,
        }
    }

    pub fn costs(&self) -> &CostTable {
        &self.costs
    }

    pub fn is_available(&self, platform: &str) -> bool {
        self.available_platforms.contains(platform)
    }

    /// Rank every due (campaign, platform) pair
    pub fn decide(&self, campaigns: &[Campaign], recent_posts: &[PostRecord], now: i64) -> Decision {
        let mut latest_post: HashMap<&str, i64> = HashMap::new();
        for post in recent_posts {
            if let Some(posted_at) = post.posted_at {
                latest_post
                    .entry(post.campaign_id.as_str())
                    .and_modify(|t| *t = (*t).max(posted_at))
                    .or_insert(posted_at);
            }
        }

        let mut decision = Decision::default();

        for campaign in campaigns.iter().filter(|c| c.active) {
            if campaign.cadence_secs <= 0 {
                warn!(
                    campaign_id = %campaign.id,
                    cadence_secs = campaign.cadence_secs,
                    "Skipping campaign with invalid cadence"
                );
                decision.skipped.push(Skipped {
                    campaign_id: campaign.id.clone(),
                    platform: None,
                    reason: SkipReason::InvalidCadence,
                });
                continue;
            }

            let last_action = match (campaign.last_action_at, latest_post.get(campaign.id.as_str())) {
                (Some(a), Some(b)) => Some(a.max(*b)),
                (a, b) => a.or(b.copied()),
            };

            let Some(score) = score(campaign, last_action, now) else {
                continue;
            };

            self.expand(campaign, score, now, &mut decision);
        }

        decision.candidates.sort_by(|a, b| {
            (Reverse(a.score), &a.campaign_id, &a.platform).cmp(&(
                Reverse(b.score),
                &b.campaign_id,
                &b.platform,
            ))
        });

        debug!(
            candidates = decision.candidates.len(),
            skipped = decision.skipped.len(),
            "Decision complete"
        );
        decision
    }

    /// One candidate per resolvable platform of a due campaign
    fn expand(&self, campaign: &Campaign, score: i64, now: i64, decision: &mut Decision) {
        let occurrence = now.div_euclid(campaign.cadence_secs);
        let mut seen = BTreeSet::new();

        if campaign.platforms.is_empty() {
            decision.skipped.push(Skipped {
                campaign_id: campaign.id.clone(),
                platform: None,
                reason: SkipReason::PlatformUnavailable,
            });
            return;
        }

        for platform in &campaign.platforms {
            if !seen.insert(platform.as_str()) {
                continue;
            }
            if !self.is_available(platform) {
                warn!(campaign_id = %campaign.id, %platform, "Platform unavailable, skipping");
                decision.skipped.push(Skipped {
                    campaign_id: campaign.id.clone(),
                    platform: Some(platform.clone()),
                    reason: SkipReason::PlatformUnavailable,
                });
                continue;
            }

            decision.candidates.push(self.candidate(
                campaign,
                platform,
                score,
                occurrence,
                format!("{}:{}:{}", campaign.id, platform, occurrence),
            ));
        }
    }

    /// A candidate for a manual run: ignores cadence and gets a fresh dedupe key
    ///
    /// Returns `None` when the platform has no usable adapter.
    pub fn candidate_for(&self, campaign: &Campaign, platform: &str, now: i64) -> Option<CandidateAction> {
        if !self.is_available(platform) {
            return None;
        }

        let occurrence = if campaign.cadence_secs > 0 {
            now.div_euclid(campaign.cadence_secs)
        } else {
            0
        };
        let dedupe_key = format!(
            "{}:{}:manual:{}",
            campaign.id,
            platform,
            uuid::Uuid::new_v4()
        );

        Some(self.candidate(campaign, platform, i64::MAX, occurrence, dedupe_key))
    }

    fn candidate(
        &self,
        campaign: &Campaign,
        platform: &str,
        score: i64,
        occurrence: i64,
        dedupe_key: String,
    ) -> CandidateAction {
        CandidateAction {
            campaign_id: campaign.id.clone(),
            account_id: campaign.account_id.clone(),
            platform: platform.to_string(),
            estimated_cost: self.costs.cost_for(platform),
            score,
            content: campaign.content.clone(),
            prompt: campaign.prompt.clone(),
            occurrence,
            dedupe_key,
        }
    }
}

/// `None` when the campaign is not yet due
fn score(campaign: &Campaign, last_action: Option<i64>, now: i64) -> Option<i64> {
    let Some(last_action) = last_action else {
        return Some(i64::MAX);
    };

    let elapsed = now.saturating_sub(last_action);
    if elapsed < campaign.cadence_secs {
        return None;
    }

    let overdue = elapsed - campaign.cadence_secs;
    Some(overdue.saturating_mul(campaign.priority.max(1)))
}
