//! Chat Execution (4.E) — interceptors, history reduction, budget guard,
//! prompt-prefix compilation, provider transport, and telemetry, wired
//! into the 8-step `chat` operation.

pub mod cache;
pub mod events;
pub mod interceptors;
pub mod provider;
pub mod telemetry;

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::error::ChatError;
use crate::hashing::sha256_hex;
use crate::reducer::{self, ChatMessage, ReducerOptions};

use cache::PromptPrefixCache;
use events::{EventSink, EventType};
use interceptors::{HookDecision, InterceptorChain};
use provider::{ProviderRequest, ProviderTransport};
use telemetry::{TelemetryMeter, TelemetrySnapshot, Usage};

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Accept,
    Deny(String),
    Queue,
}

/// A concurrency-based budget guard: requests beyond `max_in_flight` are
/// queued (and, per the spec, any non-accept decision is terminal for
/// this `chat` call rather than actually awaited).
pub struct BudgetGuard {
    max_in_flight: usize,
    in_flight: AtomicUsize,
}

impl BudgetGuard {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn try_accept(&self) -> BudgetDecision {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if current < self.max_in_flight {
            BudgetDecision::Accept
        } else {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            BudgetDecision::Queue
        }
    }

    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub json_mode: bool,
    pub max_output_tokens: u32,
    pub reduce_history: bool,
    pub reducer_options: ReducerOptions,
    pub dynamic_tail_messages: usize,
    pub idempotency_key: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: "capable".to_string(),
            json_mode: false,
            max_output_tokens: 1024,
            reduce_history: true,
            reducer_options: ReducerOptions::default(),
            dynamic_tail_messages: 2,
            idempotency_key: "chat".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResult {
    pub content: String,
    pub cache_key: String,
    pub stable_prefix_hash: String,
    pub dynamic_tail_hash: String,
    pub downgraded: bool,
    pub telemetry: TelemetrySnapshot,
}

pub struct ChatContext {
    pub interceptors: InterceptorChain,
    pub budget: BudgetGuard,
    pub cache: PromptPrefixCache,
    pub provider: ProviderTransport,
    pub events: EventSink,
    pub telemetry: TelemetryMeter,
}

impl ChatContext {
    pub fn new(config: &Config, max_in_flight: usize) -> Self {
        Self {
            interceptors: InterceptorChain::new(),
            budget: BudgetGuard::new(max_in_flight),
            cache: PromptPrefixCache::default(),
            provider: ProviderTransport::new(&config.provider),
            events: EventSink::new(),
            telemetry: TelemetryMeter::new(),
        }
    }
}

fn compile_cache_key(model: &str, messages: &[ChatMessage], json_mode: bool, dynamic_tail_messages: usize) -> (String, String, String) {
    let split_at = messages.len().saturating_sub(dynamic_tail_messages);
    let (stable, dynamic) = messages.split_at(split_at);

    let stable_repr: String = stable.iter().map(|m| format!("{}:{}", m.role, m.content)).collect();
    let dynamic_repr: String = dynamic.iter().map(|m| format!("{}:{}", m.role, m.content)).collect();

    let stable_prefix_hash = sha256_hex(stable_repr.as_bytes());
    let dynamic_tail_hash = sha256_hex(dynamic_repr.as_bytes());
    let cache_key = sha256_hex(format!("{model}|{json_mode}|{stable_prefix_hash}").as_bytes());
    (cache_key, stable_prefix_hash, dynamic_tail_hash)
}

/// The 8-step chat operation (4.E). `ctx`'s fields are each individually
/// synchronized, so the context itself is shared by plain reference —
/// no outer lock needs to be held across the provider request's `.await`.
pub async fn chat(
    ctx: &ChatContext,
    mut messages: Vec<ChatMessage>,
    options: &ChatOptions,
) -> Result<ChatResult, ChatError> {
    // 1. on_ingress
    if let HookDecision::Drop(reason) = ctx.interceptors.run_ingress(&messages) {
        ctx.events.emit(
            &options.idempotency_key,
            EventType::InterceptorDecision,
            json!({"hook": "on_ingress", "dropped": true, "reason": reason}),
        );
        return Err(ChatError::InterceptorDropped("on_ingress"));
    }

    // 2. on_send_pre_cache_key
    if let HookDecision::Drop(reason) = ctx.interceptors.run_pre_cache_key(&messages) {
        ctx.events.emit(
            &options.idempotency_key,
            EventType::InterceptorDecision,
            json!({"hook": "on_send_pre_cache_key", "dropped": true, "reason": reason}),
        );
        return Err(ChatError::InterceptorDropped("on_send_pre_cache_key"));
    }

    // 3. history reduction
    if options.reduce_history {
        let reduced = reducer::reduce(&messages, &options.reducer_options);
        messages = reduced.messages;
    }

    // 4. budget guard
    let decision = ctx.budget.try_accept();
    ctx.events.emit(
        &options.idempotency_key,
        EventType::BudgetDecision,
        json!({"decision": format!("{decision:?}")}),
    );
    if decision != BudgetDecision::Accept {
        return Err(ChatError::BudgetExceeded(format!("{decision:?}")));
    }

    let result = run_request(ctx, &messages, options).await;
    ctx.budget.release();
    result
}

async fn run_request(
    ctx: &ChatContext,
    messages: &[ChatMessage],
    options: &ChatOptions,
) -> Result<ChatResult, ChatError> {
    // 5. prompt-prefix compiler
    let (cache_key, stable_prefix_hash, dynamic_tail_hash) =
        compile_cache_key(&options.model, messages, options.json_mode, options.dynamic_tail_messages);
    ctx.cache.insert(cache_key.clone(), stable_prefix_hash.clone(), dynamic_tail_hash.clone());

    // 6. on_send_post_route
    if let HookDecision::Drop(reason) = ctx.interceptors.run_post_route(&cache_key) {
        ctx.events.emit(
            &options.idempotency_key,
            EventType::InterceptorDecision,
            json!({"hook": "on_send_post_route", "dropped": true, "reason": reason}),
        );
        return Err(ChatError::InterceptorDropped("on_send_post_route"));
    }

    ctx.events.emit(
        &options.idempotency_key,
        EventType::LlmRequest,
        json!({"model": options.model, "cache_key": cache_key}),
    );

    // 7. provider request (downgrade-then-retry-once lives inside the transport)
    let request = ProviderRequest {
        model: options.model.clone(),
        messages: messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect(),
        json_mode: options.json_mode,
        max_output_tokens: options.max_output_tokens,
        reasoning: None,
        prompt_cache_retention: None,
        prompt_cache_key: Some(cache_key.clone()),
    };

    let response = match ctx.provider.send(request).await {
        Ok(r) => r,
        Err(e) => {
            ctx.events.emit(
                &options.idempotency_key,
                EventType::Error,
                json!({"message": e.to_string()}),
            );
            return Err(e);
        }
    };

    if response.downgraded {
        ctx.events.emit(
            &options.idempotency_key,
            EventType::StateDelta,
            json!({"downgrade": true}),
        );
    }

    ctx.events.emit(
        &options.idempotency_key,
        EventType::LlmResponse,
        json!({"chars": response.content.chars().count()}),
    );

    // 8. telemetry
    ctx.telemetry.record(&response.usage, response.latency_ms);

    Ok(ChatResult {
        content: response.content,
        cache_key,
        stable_prefix_hash,
        dynamic_tail_hash,
        downgraded: response.downgraded,
        telemetry: ctx.telemetry.snapshot(),
    })
}

#[allow(dead_code)]
fn zero_usage() -> Usage {
    Usage::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_guard_accepts_up_to_limit_then_queues() {
        let guard = BudgetGuard::new(1);
        assert_eq!(guard.try_accept(), BudgetDecision::Accept);
        assert_eq!(guard.try_accept(), BudgetDecision::Queue);
        guard.release();
        assert_eq!(guard.try_accept(), BudgetDecision::Accept);
    }

    #[test]
    fn cache_key_is_stable_across_dynamic_tail_changes() {
        let msg = |role: &str, content: &str| ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            name: None,
            tool_call_id: None,
            pair_id: None,
            pair_role: None,
            tags: vec![],
        };
        let messages_a = vec![msg("system", "sys"), msg("user", "turn A")];
        let messages_b = vec![msg("system", "sys"), msg("user", "turn B")];
        let (_, stable_a, _) = compile_cache_key("m", &messages_a, false, 1);
        let (_, stable_b, _) = compile_cache_key("m", &messages_b, false, 1);
        assert_eq!(stable_a, stable_b);
    }

    #[test]
    fn cache_key_changes_with_stable_prefix() {
        let msg = |role: &str, content: &str| ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            name: None,
            tool_call_id: None,
            pair_id: None,
            pair_role: None,
            tags: vec![],
        };
        let messages_a = vec![msg("system", "sys-1"), msg("user", "turn A")];
        let messages_b = vec![msg("system", "sys-2"), msg("user", "turn A")];
        let (key_a, _, _) = compile_cache_key("m", &messages_a, false, 1);
        let (key_b, _, _) = compile_cache_key("m", &messages_b, false, 1);
        assert_ne!(key_a, key_b);
    }
}
