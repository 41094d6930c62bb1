//! Quota state machine.
//!
//! Each billable request moves through pre-check, pre-consume, the upstream
//! call, and reconciliation. Failures before the upstream call refund the
//! pre-consumed units; reconciliation applies the signed difference between
//! the final bill and the hold, then writes the log row.

use std::sync::Arc;

use crate::config;
use crate::logger;
use crate::metrics::{MetricEvent, Recorder};
use crate::pricing::ModelPricing;
use crate::store::{LogEntry, Store, StoreError};

use super::error::{RelayError, RelayResult};
use super::meta::{RelayMeta, Usage};

/// A user this far above the estimate skips the token hold entirely.
const TRUSTED_BYPASS_FACTOR: i64 = 100;

/// Outcome of the pre-consume phase, fed back into reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct PreConsumed {
    pub estimated: i64,
    /// Units actually held on the token; zero under trusted bypass.
    pub held: i64,
}

/// Estimate the quota a chat-style request may cost before the upstream call.
/// Completion size is unknown, so the estimate covers the prompt plus the
/// requested output ceiling.
pub fn estimate_chat_quota(
    pricing: &ModelPricing,
    prompt_tokens: i64,
    max_tokens: Option<i64>,
    group_ratio: f64,
) -> i64 {
    let completion_guess = max_tokens.unwrap_or(0).max(0);
    let raw = prompt_tokens as f64 * pricing.ratio
        + completion_guess as f64 * pricing.ratio * pricing.completion_ratio;
    ((raw * group_ratio).ceil() as i64).max(1)
}

/// Final bill for reconciled usage: text, cached and completion buckets at
/// their ratios, scaled by the group ratio, plus tool costs.
pub fn final_quota_for_usage(pricing: &ModelPricing, usage: &Usage, group_ratio: f64) -> i64 {
    let cached = usage
        .prompt_tokens_details
        .cached_tokens
        .clamp(0, usage.prompt_tokens);
    let fresh = usage.prompt_tokens - cached;
    let raw = fresh as f64 * pricing.ratio
        + cached as f64 * pricing.ratio * pricing.cached_input_ratio
        + usage.completion_tokens as f64 * pricing.ratio * pricing.completion_ratio;
    let token_quota = (raw * group_ratio).ceil() as i64;
    (token_quota + usage.tools_cost).max(0)
}

/// Per-image / per-second bill:
/// `ceil(usd × quota_per_usd × tier × group_ratio) × billed_count`.
pub fn per_unit_quota(
    usd_per_unit: f64,
    tier: f64,
    group_ratio: f64,
    billed_count: i64,
    quota_per_usd: i64,
) -> i64 {
    let per_unit = (usd_per_unit * quota_per_usd as f64 * tier * group_ratio).ceil() as i64;
    per_unit * billed_count.max(0)
}

/// PreCheck + PreConsumed. Rejects before anything is held when the user
/// balance cannot cover the estimate.
pub fn pre_consume(
    store: &Arc<dyn Store>,
    meta: &RelayMeta,
    estimated: i64,
) -> RelayResult<PreConsumed> {
    let user_quota = store.user_quota(meta.user_id)?;
    if user_quota < estimated {
        return Err(RelayError::QuotaExceeded(format!(
            "user balance {} cannot cover estimated cost {}",
            user_quota, estimated
        )));
    }

    let token = store.token(meta.token_id)?;
    if !token.enabled {
        return Err(RelayError::AuthFailed("token is disabled".into()));
    }

    let trusted = user_quota > TRUSTED_BYPASS_FACTOR * estimated
        && (token.unlimited || token.quota > TRUSTED_BYPASS_FACTOR * estimated);
    if trusted {
        logger::debug(
            "quota",
            &format!(
                "trusted bypass: user={}, token={}, estimated={}",
                meta.user_id, meta.token_id, estimated
            ),
        );
        return Ok(PreConsumed { estimated, held: 0 });
    }

    match store.pre_consume_token(meta.token_id, estimated) {
        Ok(()) => {}
        Err(StoreError::InsufficientQuota) => {
            return Err(RelayError::QuotaExceeded(format!(
                "token balance cannot cover estimated cost {}",
                estimated
            )))
        }
        Err(e) => return Err(e.into()),
    }
    store.upsert_request_cost(&meta.request_id, meta.user_id, estimated)?;
    Ok(PreConsumed {
        estimated,
        held: estimated,
    })
}

/// Return the hold after a failure that happened before (or instead of) a
/// billable response. The request-cost row is zeroed and no log row exists.
pub fn refund(store: &Arc<dyn Store>, meta: &RelayMeta, pre: PreConsumed) {
    if pre.held > 0 {
        if let Err(e) = store.post_consume_token(meta.token_id, -pre.held, 0) {
            logger::error(
                "quota",
                &format!(
                    "refund failed: token={}, amount={}, error={}",
                    meta.token_id, pre.held, e
                ),
            );
        }
    }
    if let Err(e) = store.zero_request_cost(&meta.request_id) {
        logger::error(
            "quota",
            &format!("failed to zero request cost {}: {}", meta.request_id, e),
        );
    }
}

/// Reconcile + Done, synchronously. Applies `final_quota - held` to the
/// token (clamped non-negative when nothing was held), settles the user and
/// channel counters, reconciles the request-cost row and writes the log row.
pub fn reconcile(
    store: &Arc<dyn Store>,
    recorder: &Arc<dyn Recorder>,
    meta: &RelayMeta,
    usage: &Usage,
    pre: PreConsumed,
    final_quota: i64,
    log_content: String,
) -> RelayResult<()> {
    let mut delta = final_quota - pre.held;
    if pre.held == 0 && delta < 0 {
        delta = 0;
    }

    store.post_consume_token(meta.token_id, delta, final_quota)?;
    store.decrement_user_quota(meta.user_id, final_quota)?;
    store.increment_user_used(meta.user_id, final_quota)?;
    store.increment_channel_used(meta.channel_id, final_quota)?;
    store.upsert_request_cost(&meta.request_id, meta.user_id, final_quota)?;

    let entry = LogEntry {
        user_id: meta.user_id,
        channel_id: meta.channel_id,
        model_name: meta.origin_model.clone(),
        token_name: meta.token_name.clone(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        quota: final_quota,
        content: log_content,
        is_stream: meta.is_stream,
        elapsed_ms: meta.elapsed_ms(),
        request_id: meta.request_id.clone(),
        trace_id: meta.trace_id.clone(),
        created_at: chrono::Utc::now().timestamp(),
    };
    store.record_log(&entry)?;

    recorder.emit(MetricEvent::RequestCompleted {
        model: meta.origin_model.clone(),
        channel_id: meta.channel_id,
        user_id: meta.user_id,
        quota: final_quota,
        elapsed_ms: entry.elapsed_ms,
        is_stream: meta.is_stream,
    });
    Ok(())
}

/// Human-readable billing breakdown for the log row.
pub fn describe_bill(
    pricing: &ModelPricing,
    usage: &Usage,
    group_ratio: f64,
    final_quota: i64,
) -> String {
    let cfg = config::load();
    let amount = if cfg.display_in_currency {
        format!("${:.6}", final_quota as f64 / cfg.quota_per_usd as f64)
    } else {
        format!("{} quota", final_quota)
    };
    let mut parts = vec![format!(
        "model ratio {:.4}, completion ratio {:.2}, group ratio {:.2}",
        pricing.ratio, pricing.completion_ratio, group_ratio
    )];
    if usage.prompt_tokens_details.cached_tokens > 0 {
        parts.push(format!(
            "cached tokens {} at ratio {:.2}",
            usage.prompt_tokens_details.cached_tokens, pricing.cached_input_ratio
        ));
    }
    if usage.tools_cost > 0 {
        parts.push(format!("tool cost {}", usage.tools_cost));
    }
    format!("{} ({})", amount, parts.join(", "))
}

/// Detached Reconcile: runs post-consume under the billing deadline. On
/// timeout the pre-consumed units stay committed (no double refund) and a
/// `BillingTimeout` metric fires.
pub fn spawn_post_consume(
    store: Arc<dyn Store>,
    recorder: Arc<dyn Recorder>,
    meta: RelayMeta,
    pricing: ModelPricing,
    usage: Usage,
    pre: PreConsumed,
) {
    spawn_post_consume_inner(store, recorder, meta, pricing, usage, pre, None)
}

/// Variant for per-call / per-second billed endpoints where the final bill
/// is known up front instead of derived from token usage.
pub fn spawn_post_consume_fixed(
    store: Arc<dyn Store>,
    recorder: Arc<dyn Recorder>,
    meta: RelayMeta,
    pricing: ModelPricing,
    usage: Usage,
    pre: PreConsumed,
    final_quota: i64,
) {
    spawn_post_consume_inner(store, recorder, meta, pricing, usage, pre, Some(final_quota))
}

fn spawn_post_consume_inner(
    store: Arc<dyn Store>,
    recorder: Arc<dyn Recorder>,
    meta: RelayMeta,
    pricing: ModelPricing,
    usage: Usage,
    pre: PreConsumed,
    fixed_quota: Option<i64>,
) {
    let deadline = std::time::Duration::from_secs(config::load().billing_timeout_secs.max(1));
    tokio::spawn(async move {
        let final_quota = fixed_quota
            .unwrap_or_else(|| final_quota_for_usage(&pricing, &usage, meta.group_ratio));
        let content = describe_bill(&pricing, &usage, meta.group_ratio, final_quota);
        let store_for_task = Arc::clone(&store);
        let recorder_for_task = Arc::clone(&recorder);
        let meta_for_task = meta.clone();
        let usage_for_task = usage.clone();

        let work = tokio::task::spawn_blocking(move || {
            reconcile(
                &store_for_task,
                &recorder_for_task,
                &meta_for_task,
                &usage_for_task,
                pre,
                final_quota,
                content,
            )
        });

        match tokio::time::timeout(deadline, work).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => logger::error(
                "quota",
                &format!(
                    "post-consume failed: request={}, error={}",
                    meta.request_id, e
                ),
            ),
            Ok(Err(join_err)) => logger::error(
                "quota",
                &format!("post-consume task panicked: {}", join_err),
            ),
            Err(_) => {
                recorder.emit(MetricEvent::BillingTimeout {
                    user_id: meta.user_id,
                    channel_id: meta.channel_id,
                    model: meta.origin_model.clone(),
                    estimated_quota: pre.estimated,
                    elapsed_ms: meta.elapsed_ms(),
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_support::CapturingRecorder;
    use crate::relay::meta::{ApiType, ChannelType};
    use crate::store::{ChannelRow, MemStore, TokenRow, UserRow};
    use std::time::Instant;

    fn test_meta() -> RelayMeta {
        RelayMeta {
            api_type: ApiType::OpenAI,
            channel_type: ChannelType::OpenAI,
            channel_id: 1,
            user_id: 1,
            token_id: 1,
            token_name: "test".into(),
            group: "default".into(),
            origin_model: "gpt-4o".into(),
            actual_model: "gpt-4o".into(),
            model_mapping: vec![],
            request_path: "/v1/chat/completions".into(),
            is_stream: false,
            start_time: Instant::now(),
            prompt_tokens: 3,
            base_url: None,
            key: String::new(),
            group_ratio: 1.0,
            response_api_fallback: false,
            claude_conversion: false,
            claude_native: false,
            request_id: "req-1".into(),
            trace_id: "trace-1".into(),
        }
    }

    fn seeded_store(user_quota: i64, token_quota: i64, unlimited: bool) -> Arc<dyn Store> {
        let store = MemStore::new();
        store.insert_user(UserRow {
            id: 1,
            quota: user_quota,
            used_quota: 0,
            group: "default".into(),
            role: "common".into(),
            enabled: true,
        });
        store.insert_token(
            TokenRow {
                id: 1,
                user_id: 1,
                name: "test".into(),
                quota: token_quota,
                used_quota: 0,
                unlimited,
                enabled: true,
            },
            "sk-test",
        );
        store.insert_channel(ChannelRow {
            id: 1,
            channel_type: ChannelType::OpenAI,
            status: crate::store::ChannelStatus::Enabled,
            priority: 0,
            weight: 1,
            base_url: None,
            key: String::new(),
            models: vec!["gpt-4o".into()],
            groups: vec![],
            model_mapping: vec![],
            model_configs: Default::default(),
            tooling: None,
            used_quota: 0,
        });
        Arc::new(store)
    }

    fn flat_pricing() -> ModelPricing {
        ModelPricing {
            ratio: 1.0,
            cached_input_ratio: 1.0,
            completion_ratio: 1.0,
            ..ModelPricing::default()
        }
    }

    #[test]
    fn final_quota_matches_scenario_one() {
        // usage 3 prompt / 2 completion at unit ratios -> ceil(3 + 2) = 5.
        let usage = Usage::new(3, 2);
        assert_eq!(final_quota_for_usage(&flat_pricing(), &usage, 1.0), 5);
    }

    #[test]
    fn cached_tokens_bill_at_cached_ratio() {
        let pricing = ModelPricing {
            ratio: 1.0,
            cached_input_ratio: 0.5,
            completion_ratio: 1.0,
            ..ModelPricing::default()
        };
        let mut usage = Usage::new(10, 0);
        usage.prompt_tokens_details.cached_tokens = 4;
        // 6 fresh + 4 * 0.5 = 8.
        assert_eq!(final_quota_for_usage(&pricing, &usage, 1.0), 8);
    }

    #[test]
    fn pre_check_rejects_poor_user() {
        let store = seeded_store(10, 1000, false);
        let err = pre_consume(&store, &test_meta(), 50).unwrap_err();
        assert!(matches!(err, RelayError::QuotaExceeded(_)));
        // Nothing was held.
        assert_eq!(store.token(1).unwrap().quota, 1000);
    }

    #[test]
    fn pre_consume_holds_tokens() {
        let store = seeded_store(10_000, 1000, false);
        let pre = pre_consume(&store, &test_meta(), 100).unwrap();
        assert_eq!(pre.held, 100);
        assert_eq!(store.token(1).unwrap().quota, 900);
        assert_eq!(store.request_cost("req-1").unwrap(), Some(100));
    }

    #[test]
    fn trusted_bypass_skips_hold() {
        // Scenario 6: huge user balance, unlimited token.
        let store = seeded_store(10_000_000, 0, true);
        let pre = pre_consume(&store, &test_meta(), 50).unwrap();
        assert_eq!(pre.held, 0);
        assert_eq!(store.token(1).unwrap().quota, 0);
    }

    #[test]
    fn refund_restores_hold_and_zeroes_cost() {
        // Scenario 5: upstream 502 after a 100-unit hold.
        let store = seeded_store(10_000, 1000, false);
        let meta = test_meta();
        let pre = pre_consume(&store, &meta, 100).unwrap();
        refund(&store, &meta, pre);
        assert_eq!(store.token(1).unwrap().quota, 1000);
        assert_eq!(store.request_cost("req-1").unwrap(), Some(0));
    }

    #[test]
    fn reconcile_conserves_quota() {
        // I1: user and token used_quota grow by the same final amount.
        let store = seeded_store(10_000, 1000, false);
        let recorder: Arc<dyn Recorder> = Arc::new(CapturingRecorder::default());
        let meta = test_meta();
        let pre = pre_consume(&store, &meta, 100).unwrap();

        let usage = Usage::new(3, 2);
        let final_quota = final_quota_for_usage(&flat_pricing(), &usage, 1.0);
        reconcile(&store, &recorder, &meta, &usage, pre, final_quota, "test".into()).unwrap();

        let token = store.token(1).unwrap();
        let user = store.user(1).unwrap();
        assert_eq!(token.used_quota, 5);
        assert_eq!(user.used_quota, 5);
        // Hold of 100 refunded down to the 5 actually billed.
        assert_eq!(token.quota, 1000 - 5);
        assert_eq!(store.request_cost("req-1").unwrap(), Some(5));
    }

    #[test]
    fn reconcile_after_bypass_never_refunds() {
        let store = seeded_store(10_000_000, 0, true);
        let recorder: Arc<dyn Recorder> = Arc::new(CapturingRecorder::default());
        let meta = test_meta();
        let pre = pre_consume(&store, &meta, 50).unwrap();
        assert_eq!(pre.held, 0);

        let usage = Usage::new(20, 17);
        let final_quota = final_quota_for_usage(&flat_pricing(), &usage, 1.0);
        reconcile(&store, &recorder, &meta, &usage, pre, final_quota, "test".into()).unwrap();
        let token = store.token(1).unwrap();
        assert_eq!(token.used_quota, 37);
        // Unlimited token balance reduced by exactly the final amount.
        assert_eq!(token.quota, -37);
    }

    #[test]
    fn reconcile_is_idempotent_on_request_cost() {
        // I2: re-running the upsert nets the same stored total.
        let store = seeded_store(10_000, 1000, false);
        store.upsert_request_cost("req-9", 1, 100).unwrap();
        store.upsert_request_cost("req-9", 1, 37).unwrap();
        store.upsert_request_cost("req-9", 1, 37).unwrap();
        assert_eq!(store.request_cost("req-9").unwrap(), Some(37));
    }

    #[test]
    fn per_unit_quota_rounds_up_per_unit() {
        // 0.04 USD/image, tier 2.0, group 1.0, 3 images at 500k/USD.
        assert_eq!(per_unit_quota(0.04, 2.0, 1.0, 3, 500_000), 120_000);
        // Fractional per-unit cost rounds up before multiplying.
        assert_eq!(per_unit_quota(0.0000001, 1.0, 1.0, 2, 500_000), 2);
    }

    #[test]
    fn estimate_covers_prompt_and_ceiling() {
        let est = estimate_chat_quota(&flat_pricing(), 10, Some(20), 1.0);
        assert_eq!(est, 30);
        // Never zero, so the hold always exists for non-bypass users.
        assert_eq!(estimate_chat_quota(&flat_pricing(), 0, None, 1.0), 1);
    }
}
