//! `Profile`: a named harness invocation configuration with a concurrency cap.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    Env,
    Stdin,
    Path,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub harness: String,
    pub auth_kind: Option<String>,
    pub auth_home: Option<String>,
    pub prompt_mode: PromptMode,
    pub command_template: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
    pub max_concurrency: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, harness: impl Into<String>, command_template: impl Into<String>) -> Self {
        let now = Utc::now();
        let rec = Self {
            id: id.into(),
            name: name.into(),
            harness: harness.into(),
            auth_kind: None,
            auth_home: None,
            prompt_mode: PromptMode::Stdin,
            command_template: command_template.into(),
            model: None,
            extra_args: Vec::new(),
            env: HashMap::new(),
            max_concurrency: 1,
            cooldown_until: None,
            created_at: now,
            updated_at: now,
        };
        debug!(id = %rec.id, name = %rec.name, "Profile::new: created");
        rec
    }

    pub fn with_prompt_mode(mut self, mode: PromptMode) -> Self {
        self.prompt_mode = mode;
        self.updated_at = Utc::now();
        self
    }

    pub fn with_max_concurrency(mut self, n: u32) -> Self {
        self.max_concurrency = n.max(1);
        self.updated_at = Utc::now();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self.updated_at = Utc::now();
        self
    }

    pub fn set_cooldown_until(&mut self, until: Option<DateTime<Utc>>) {
        debug!(id = %self.id, ?until, "Profile::set_cooldown_until: called");
        self.cooldown_until = until;
        self.updated_at = Utc::now();
    }

    pub fn is_in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}
