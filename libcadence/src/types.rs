//! Core types for Cadence

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Generates the `as_str` / `FromStr` / `Display` trio for a text-stored enum
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub id: String,
    pub account_id: String,
    pub name: String,
    /// Target platform ids, first one is the primary
    pub platforms: Vec<String>,
    /// Minimum seconds between two actions
    pub cadence_secs: i64,
    /// Weight applied to overdue time, 1..=10
    pub priority: i64,
    /// Prompt handed to the content generator when `content` is absent
    pub prompt: Option<String>,
    /// Fixed content reused on every action
    pub content: Option<String>,
    pub active: bool,
    pub last_action_at: Option<i64>,
    pub created_at: i64,
}

impl Campaign {
    pub fn new(account_id: &str, name: &str, platforms: Vec<String>, cadence_secs: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            platforms,
            cadence_secs,
            priority: 1,
            prompt: None,
            content: None,
            active: true,
            last_action_at: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn primary_platform(&self) -> Option<&str> {
        self.platforms.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Queued,
    Posted,
    Failed,
}

text_enum!(PostStatus {
    Queued => "queued",
    Posted => "posted",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostRecord {
    pub id: String,
    pub job_id: String,
    pub campaign_id: String,
    pub platform: String,
    pub content: Option<String>,
    pub status: PostStatus,
    pub external_post_id: Option<String>,
    pub posted_at: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Dead,
    Cancelled,
}

text_enum!(JobState {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Dead => "dead",
    Cancelled => "cancelled",
});

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Dead | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub campaign_id: String,
    pub account_id: String,
    pub platform: String,
    pub content: Option<String>,
    pub prompt: Option<String>,
    pub estimated_cost: i64,
    pub dedupe_key: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: i64,
    pub hold_id: Option<String>,
    pub last_error: Option<String>,
    pub dead_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditAccount {
    pub account_id: String,
    pub balance: i64,
    pub held: i64,
    pub version: i64,
    pub updated_at: i64,
}

impl CreditAccount {
    pub fn spendable(&self) -> i64 {
        self.balance - self.held
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HoldState {
    Held,
    Committed,
    Released,
}

text_enum!(HoldState {
    Held => "held",
    Committed => "committed",
    Released => "released",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditHold {
    pub id: String,
    pub account_id: String,
    pub amount: i64,
    pub state: HoldState,
    pub created_at: i64,
    pub expires_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionReason {
    Grant,
    Spend,
}

text_enum!(TransactionReason {
    Grant => "grant",
    Spend => "spend",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditTransaction {
    pub id: i64,
    pub account_id: String,
    pub delta: i64,
    pub reason: TransactionReason,
    pub hold_id: Option<String>,
    pub balance_after: i64,
    pub memo: Option<String>,
    pub created_at: i64,
}

/// Current Unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current Unix time in milliseconds
pub fn unix_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
