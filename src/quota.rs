//! Quota coordination: the speculative debit taken before dispatch and the
//! deferred settlement that reconciles it after the response has been fully
//! produced or abandoned.

use crate::config;
use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::openai::Usage;
use crate::store::{ConsumeLog, RelayStore};
use crate::token_count::count_token_text;
use axum::http::StatusCode;
use std::sync::Arc;

/// Ratios and the debit already taken for one request. Created after
/// validation, consumed by settlement.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPlan {
    pub pre_consumed_quota: i64,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
}

impl QuotaPlan {
    /// Combined multiplier applied to the final token cost.
    pub fn ratio(&self) -> f64 {
        self.model_ratio * self.group_ratio
    }
}

/// Completion tokens are weighted by model family: chat-turbo output costs
/// a third more than input, GPT-4 output twice as much.
pub fn completion_ratio(model: &str) -> f64 {
    if model.starts_with("gpt-3.5") {
        4.0 / 3.0
    } else if model.starts_with("gpt-4") {
        2.0
    } else {
        1.0
    }
}

fn is_free_channel(ctx: &RequestContext) -> bool {
    ctx.channel_name.contains(config::FREE_CHANNEL_MARKER)
}

/// Computes the pre-consume estimate and debits it. Free channels never
/// pre-consume (and never touch the quota store at all); users whose cached
/// quota dwarfs the estimate skip the debit to cut write amplification.
pub async fn pre_consume(
    store: &Arc<dyn RelayStore>,
    ctx: &RequestContext,
    model: &str,
    prompt_tokens: i64,
    max_tokens: Option<u32>,
) -> AppResult<QuotaPlan> {
    let pre_consumed_tokens = match max_tokens {
        Some(max_tokens) => prompt_tokens + max_tokens as i64,
        None => config::pre_consumed_quota(),
    };
    let model_ratio = config::model_ratio(model);
    let group_ratio = config::group_ratio(&ctx.group);
    let ratio = model_ratio * group_ratio;
    let mut pre_consumed_quota = (pre_consumed_tokens as f64 * ratio) as i64;

    if is_free_channel(ctx) {
        return Ok(QuotaPlan {
            pre_consumed_quota: 0,
            model_ratio,
            group_ratio,
            completion_ratio: completion_ratio(model),
        });
    }

    let user_quota = store
        .cache_get_user_quota(ctx.user_id)
        .await
        .map_err(|err| {
            AppError::wrap("get_user_quota_failed", StatusCode::INTERNAL_SERVER_ERROR, err)
        })?;
    if user_quota > 10 * pre_consumed_quota {
        // The user has plenty of headroom; skip the speculative debit.
        pre_consumed_quota = 0;
    }

    if ctx.consume_quota && pre_consumed_quota > 0 {
        store
            .pre_consume_token_quota(ctx.token_id, pre_consumed_quota)
            .await
            .map_err(|err| {
                AppError::wrap(
                    "pre_consume_token_quota_failed",
                    StatusCode::FORBIDDEN,
                    err,
                )
            })?;
    }

    Ok(QuotaPlan {
        pre_consumed_quota,
        model_ratio,
        group_ratio,
        completion_ratio: completion_ratio(model),
    })
}

/// How the exchange ended, from the settlement's point of view.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// Streamed response; completion tokens are counted from the
    /// accumulated text, prompt tokens keep the pre-dispatch count.
    Streamed { text: String },
    /// Buffered response; the upstream usage is authoritative for both
    /// counts.
    Buffered { usage: Usage },
    /// Nothing usable came back. Zero tokens, zero cost, full refund.
    Failed,
}

/// Deferred settlement hook. Built before dispatch and invoked on every
/// exit path; runs at most once. If a path abandons it without settling,
/// `Drop` settles it as a failed exchange so the pre-consumed debit is
/// returned.
pub struct Settlement {
    inner: Option<SettlementInner>,
}

struct SettlementInner {
    store: Arc<dyn RelayStore>,
    ctx: RequestContext,
    model: String,
    prompt_tokens: i64,
    plan: QuotaPlan,
}

impl Settlement {
    pub fn new(
        store: Arc<dyn RelayStore>,
        ctx: RequestContext,
        model: String,
        prompt_tokens: i64,
        plan: QuotaPlan,
    ) -> Self {
        let inner = ctx.consume_quota.then_some(SettlementInner {
            store,
            ctx,
            model,
            prompt_tokens,
            plan,
        });
        Self { inner }
    }

    pub async fn settle(mut self, outcome: SettleOutcome) {
        if let Some(inner) = self.inner.take() {
            inner.run(outcome).await;
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tokio::spawn(async move {
                inner.run(SettleOutcome::Failed).await;
            });
        }
    }
}

impl SettlementInner {
    async fn run(self, outcome: SettleOutcome) {
        let (prompt_tokens, completion_tokens) = match outcome {
            SettleOutcome::Streamed { text } => {
                (self.prompt_tokens, count_token_text(&text, &self.model))
            }
            SettleOutcome::Buffered { usage } => (usage.prompt_tokens, usage.completion_tokens),
            SettleOutcome::Failed => (0, 0),
        };

        let ratio = self.plan.ratio();
        let weighted =
            prompt_tokens + (completion_tokens as f64 * self.plan.completion_ratio) as i64;
        let mut cost = (weighted as f64 * ratio) as i64;
        if ratio != 0.0 && cost <= 0 {
            // Tokens were consumed; rounding must not make them free.
            cost = 1;
        }
        let total_tokens = prompt_tokens + completion_tokens;
        if total_tokens == 0 {
            cost = 0;
        }

        let content = format!(
            "model ratio {:.2}, group ratio {:.2}",
            self.plan.model_ratio, self.plan.group_ratio
        );
        self.store
            .record_consume_log(ConsumeLog {
                user_id: self.ctx.user_id,
                prompt_tokens,
                completion_tokens,
                model: self.model.clone(),
                token_name: self.ctx.token_name.clone(),
                quota: cost,
                content,
                channel_name: self.ctx.channel_name.clone(),
            })
            .await;

        if !is_free_channel(&self.ctx) {
            let delta = cost - self.plan.pre_consumed_quota;
            if let Err(err) = self
                .store
                .post_consume_token_quota(self.ctx.token_id, delta)
                .await
            {
                tracing::error!("error consuming token remain quota: {err}");
            }
            if let Err(err) = self.store.cache_update_user_quota(self.ctx.user_id).await {
                tracing::error!("error updating user quota cache: {err}");
            }
            if cost != 0 {
                self.store
                    .update_user_used_quota_and_request_count(self.ctx.user_id, cost)
                    .await;
                self.store
                    .update_channel_used_quota(self.ctx.channel_id, cost)
                    .await;
            }
        }
        metrics::counter!("relay_quota_settled_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        pub calls: Mutex<Vec<String>>,
        pub user_quota: i64,
        pub fail_pre_consume: bool,
    }

    #[async_trait]
    impl RelayStore for RecordingStore {
        async fn token_by_key(&self, _key: &str) -> Result<Option<crate::store::TokenRow>, String> {
            Ok(None)
        }
        async fn channel_for_request(
            &self,
            _group: &str,
            _model: &str,
        ) -> Result<Option<crate::store::ChannelRow>, String> {
            Ok(None)
        }
        async fn cache_get_user_quota(&self, _user_id: i64) -> Result<i64, String> {
            self.calls.lock().unwrap().push("get_user_quota".into());
            Ok(self.user_quota)
        }
        async fn pre_consume_token_quota(
            &self,
            _token_id: i64,
            amount: i64,
        ) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("pre_consume:{amount}"));
            if self.fail_pre_consume {
                return Err("token quota is not enough".to_string());
            }
            Ok(())
        }
        async fn post_consume_token_quota(&self, _token_id: i64, delta: i64) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("post_consume:{delta}"));
            Ok(())
        }
        async fn cache_update_user_quota(&self, _user_id: i64) -> Result<(), String> {
            self.calls.lock().unwrap().push("cache_update".into());
            Ok(())
        }
        async fn update_user_used_quota_and_request_count(&self, _user_id: i64, cost: i64) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("user_used:{cost}"));
        }
        async fn update_channel_used_quota(&self, _channel_id: i64, cost: i64) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("channel_used:{cost}"));
        }
        async fn record_consume_log(&self, entry: ConsumeLog) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("log:{}", entry.quota));
        }
    }

    fn ctx(channel_name: &str, consume_quota: bool) -> RequestContext {
        RequestContext {
            channel_type: crate::context::ChannelType::OpenAI,
            channel_id: 7,
            channel_name: channel_name.to_string(),
            token_id: 3,
            token_name: "tok".to_string(),
            user_id: 9,
            group: "default".to_string(),
            model_mapping: None,
            base_url: None,
            api_version: None,
            consume_quota,
        }
    }

    fn plan(pre: i64) -> QuotaPlan {
        QuotaPlan {
            pre_consumed_quota: pre,
            model_ratio: 1.0,
            group_ratio: 1.0,
            completion_ratio: 1.0,
        }
    }

    #[test]
    fn completion_ratio_by_model_family() {
        assert!((completion_ratio("gpt-3.5-turbo") - 4.0 / 3.0).abs() < 1e-9);
        assert_eq!(completion_ratio("gpt-4-32k"), 2.0);
        assert_eq!(completion_ratio("claude-2"), 1.0);
    }

    #[tokio::test]
    async fn pre_consume_debits_estimate() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let plan = pre_consume(&dyn_store, &ctx("paid", true), "gpt-3.5-turbo", 10, Some(90))
            .await
            .unwrap();
        assert_eq!(plan.pre_consumed_quota, 100);
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["get_user_quota", "pre_consume:100"]);
    }

    #[tokio::test]
    async fn wealthy_users_skip_pre_consume() {
        let store = Arc::new(RecordingStore {
            user_quota: 1_000_000,
            ..Default::default()
        });
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let plan = pre_consume(&dyn_store, &ctx("paid", true), "gpt-3.5-turbo", 10, Some(90))
            .await
            .unwrap();
        assert_eq!(plan.pre_consumed_quota, 0);
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["get_user_quota"]);
    }

    #[tokio::test]
    async fn free_channel_never_touches_the_store() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let plan = pre_consume(
            &dyn_store,
            &ctx("免费-claude", true),
            "claude-2",
            10,
            Some(90),
        )
        .await
        .unwrap();
        assert_eq!(plan.pre_consumed_quota, 0);
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn denied_pre_consume_maps_to_forbidden() {
        let store = Arc::new(RecordingStore {
            fail_pre_consume: true,
            ..Default::default()
        });
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let err = pre_consume(&dyn_store, &ctx("paid", true), "gpt-3.5-turbo", 10, Some(90))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.code, "pre_consume_token_quota_failed");
    }

    #[tokio::test]
    async fn settlement_posts_cost_minus_pre_consumed() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let settlement = Settlement::new(
            dyn_store,
            ctx("paid", true),
            "claude-2".to_string(),
            40,
            plan(100),
        );
        settlement
            .settle(SettleOutcome::Buffered {
                usage: Usage {
                    prompt_tokens: 40,
                    completion_tokens: 20,
                    total_tokens: 60,
                },
            })
            .await;
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "log:60",
                "post_consume:-40",
                "cache_update",
                "user_used:60",
                "channel_used:60"
            ]
        );
    }

    #[tokio::test]
    async fn zero_tokens_costs_nothing_and_refunds() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let settlement = Settlement::new(
            dyn_store,
            ctx("paid", true),
            "gpt-4".to_string(),
            40,
            plan(100),
        );
        settlement.settle(SettleOutcome::Failed).await;
        let calls = store.calls.lock().unwrap().clone();
        // cost 0: the whole pre-consumed amount flows back, usage counters
        // are untouched.
        assert_eq!(calls, vec!["log:0", "post_consume:-100", "cache_update"]);
    }

    #[tokio::test]
    async fn rounded_down_cost_is_clamped_to_one() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let settlement = Settlement::new(
            dyn_store,
            ctx("paid", true),
            "text-ada-001".to_string(),
            1,
            QuotaPlan {
                pre_consumed_quota: 0,
                model_ratio: 0.2,
                group_ratio: 1.0,
                completion_ratio: 1.0,
            },
        );
        settlement
            .settle(SettleOutcome::Buffered {
                usage: Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                },
            })
            .await;
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "log:1",
                "post_consume:1",
                "cache_update",
                "user_used:1",
                "channel_used:1"
            ]
        );
    }

    #[tokio::test]
    async fn free_channel_settlement_only_logs() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let settlement = Settlement::new(
            dyn_store,
            ctx("免费-claude", true),
            "claude-2".to_string(),
            10,
            plan(0),
        );
        settlement
            .settle(SettleOutcome::Streamed {
                text: "Hello".to_string(),
            })
            .await;
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("log:"));
    }

    #[tokio::test]
    async fn settlement_without_consume_quota_is_inert() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        let settlement = Settlement::new(
            dyn_store,
            ctx("paid", false),
            "gpt-4".to_string(),
            10,
            plan(0),
        );
        settlement
            .settle(SettleOutcome::Streamed {
                text: "Hello".to_string(),
            })
            .await;
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_an_armed_settlement_refunds() {
        let store = Arc::new(RecordingStore::default());
        let dyn_store: Arc<dyn RelayStore> = store.clone();
        drop(Settlement::new(
            dyn_store,
            ctx("paid", true),
            "gpt-4".to_string(),
            10,
            plan(50),
        ));
        // The drop guard settles on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let calls = store.calls.lock().unwrap().clone();
        assert!(calls.contains(&"post_consume:-50".to_string()));
    }
}
