/// Which OpenAI endpoint family a request targets. Selected by the route
/// the request came in on; drives validation and token counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
}

impl RelayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::Moderations => "moderations",
            RelayMode::Edits => "edits",
        }
    }
}

/// Which upstream dialect the relay must speak for a request. Selected from
/// the (post-remap) model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    OpenAI,
    Claude,
    PaLM,
}

/// Configured upstream flavor of a channel. Only `Azure` (deployment-path
/// URL, `api-key` header) and `PaLM` (body always materialized) change the
/// text pipeline's behavior; everything else is pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    OpenAI,
    Azure,
    Anthropic,
    PaLM,
    Custom,
}

impl ChannelType {
    pub fn from_i64(raw: i64) -> Self {
        match raw {
            1 => ChannelType::Azure,
            2 => ChannelType::Anthropic,
            3 => ChannelType::PaLM,
            4 => ChannelType::Custom,
            _ => ChannelType::OpenAI,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            ChannelType::OpenAI => 0,
            ChannelType::Azure => 1,
            ChannelType::Anthropic => 2,
            ChannelType::PaLM => 3,
            ChannelType::Custom => 4,
        }
    }
}

/// Immutable per-request bundle populated by the auth/distribution layer
/// before the relay core runs. Lives for the duration of one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub channel_type: ChannelType,
    pub channel_id: i64,
    pub channel_name: String,
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub group: String,
    /// Raw JSON `string -> string` mapping, parsed lazily by the planner.
    pub model_mapping: Option<String>,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
    pub consume_quota: bool,
}
