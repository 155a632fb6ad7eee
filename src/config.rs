use crate::context::ChannelType;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Channel-name marker inherited from existing deployments: channels whose
/// name contains this substring are never billed. Kept as a substring match
/// for backward compatibility with configured channel names.
pub const FREE_CHANNEL_MARKER: &str = "免费";

const DEFAULT_PRE_CONSUMED_QUOTA: i64 = 500;

/// Flat quota debited before dispatch when the request carries no
/// `max_tokens` to bound the estimate. `RELAYMUX_PRE_CONSUMED_QUOTA`
/// overrides.
pub fn pre_consumed_quota() -> i64 {
    static QUOTA: OnceLock<i64> = OnceLock::new();
    *QUOTA.get_or_init(|| {
        std::env::var("RELAYMUX_PRE_CONSUMED_QUOTA")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PRE_CONSUMED_QUOTA)
    })
}

/// Default upstream base URL per channel type. An empty entry means the
/// channel must configure `base_url` itself (Azure deployments).
pub fn channel_base_url(channel_type: ChannelType) -> &'static str {
    match channel_type {
        ChannelType::OpenAI => "https://api.openai.com",
        ChannelType::Azure => "",
        ChannelType::Anthropic => "https://api.anthropic.com",
        ChannelType::PaLM => "https://generativelanguage.googleapis.com",
        ChannelType::Custom => "",
    }
}

fn model_ratio_table() -> &'static HashMap<&'static str, f64> {
    static TABLE: OnceLock<HashMap<&'static str, f64>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("gpt-3.5-turbo", 1.0),
            ("gpt-3.5-turbo-0301", 1.0),
            ("gpt-3.5-turbo-0613", 1.0),
            ("gpt-3.5-turbo-16k", 2.0),
            ("gpt-3.5-turbo-16k-0613", 2.0),
            ("gpt-4", 15.0),
            ("gpt-4-0314", 15.0),
            ("gpt-4-0613", 15.0),
            ("gpt-4-32k", 30.0),
            ("gpt-4-32k-0314", 30.0),
            ("gpt-4-32k-0613", 30.0),
            ("text-ada-001", 0.2),
            ("text-babbage-001", 0.25),
            ("text-curie-001", 1.0),
            ("text-davinci-002", 10.0),
            ("text-davinci-003", 10.0),
            ("text-davinci-edit-001", 10.0),
            ("code-davinci-edit-001", 10.0),
            ("text-embedding-ada-002", 0.2),
            ("text-moderation-stable", 0.1),
            ("text-moderation-latest", 0.1),
            ("claude-instant-1", 0.75),
            ("claude-2", 3.0),
        ])
    })
}

/// Multiplier converting raw tokens of a model into billable quota.
/// Unknown models are billed at the most expensive known rate.
pub fn model_ratio(model: &str) -> f64 {
    match model_ratio_table().get(model) {
        Some(ratio) => *ratio,
        None => {
            tracing::warn!(model, "model ratio not found, using default");
            30.0
        }
    }
}

/// Models the pricing table knows about, for `/v1/models`.
pub fn known_models() -> Vec<&'static str> {
    let mut models: Vec<&'static str> = model_ratio_table().keys().copied().collect();
    models.sort_unstable();
    models
}

fn group_ratio_table() -> &'static HashMap<String, f64> {
    static TABLE: OnceLock<HashMap<String, f64>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<String, f64> =
            HashMap::from([("default".to_string(), 1.0), ("vip".to_string(), 1.0)]);
        if let Ok(raw) = std::env::var("RELAYMUX_GROUP_RATIO") {
            match serde_json::from_str::<HashMap<String, f64>>(&raw) {
                Ok(overrides) => table.extend(overrides),
                Err(err) => tracing::warn!("invalid RELAYMUX_GROUP_RATIO: {err}"),
            }
        }
        table
    })
}

/// Multiplier for the caller's user group. Unknown groups bill at 1.
pub fn group_ratio(group: &str) -> f64 {
    group_ratio_table().get(group).copied().unwrap_or(1.0)
}
