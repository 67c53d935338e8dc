//! Interceptor hooks — a pure callback list run at three fixed points in
//! the chat pipeline, per the Design Notes' preference for an explicit
//! ordered list over an event-emitter free-for-all.

use crate::reducer::ChatMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    Continue,
    Drop(String),
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_ingress(&self, _messages: &[ChatMessage]) -> HookDecision {
        HookDecision::Continue
    }

    fn on_send_pre_cache_key(&self, _messages: &[ChatMessage]) -> HookDecision {
        HookDecision::Continue
    }

    fn on_send_post_route(&self, _cache_key: &str) -> HookDecision {
        HookDecision::Continue
    }
}

#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn run_ingress(&self, messages: &[ChatMessage]) -> HookDecision {
        for i in &self.interceptors {
            if let HookDecision::Drop(reason) = i.on_ingress(messages) {
                return HookDecision::Drop(reason);
            }
        }
        HookDecision::Continue
    }

    pub fn run_pre_cache_key(&self, messages: &[ChatMessage]) -> HookDecision {
        for i in &self.interceptors {
            if let HookDecision::Drop(reason) = i.on_send_pre_cache_key(messages) {
                return HookDecision::Drop(reason);
            }
        }
        HookDecision::Continue
    }

    pub fn run_post_route(&self, cache_key: &str) -> HookDecision {
        for i in &self.interceptors {
            if let HookDecision::Drop(reason) = i.on_send_post_route(cache_key) {
                return HookDecision::Drop(reason);
            }
        }
        HookDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDrops;
    impl Interceptor for AlwaysDrops {
        fn name(&self) -> &'static str {
            "always-drops"
        }
        fn on_ingress(&self, _messages: &[ChatMessage]) -> HookDecision {
            HookDecision::Drop("nope".to_string())
        }
    }

    struct NeverDrops;
    impl Interceptor for NeverDrops {
        fn name(&self) -> &'static str {
            "never-drops"
        }
    }

    #[test]
    fn empty_chain_continues() {
        let chain = InterceptorChain::new();
        assert_eq!(chain.run_ingress(&[]), HookDecision::Continue);
    }

    #[test]
    fn first_drop_short_circuits() {
        let mut chain = InterceptorChain::new();
        chain.push(Box::new(NeverDrops));
        chain.push(Box::new(AlwaysDrops));
        assert_eq!(chain.run_ingress(&[]), HookDecision::Drop("nope".to_string()));
    }

    #[test]
    fn other_hooks_default_to_continue() {
        let mut chain = InterceptorChain::new();
        chain.push(Box::new(AlwaysDrops));
        assert_eq!(chain.run_pre_cache_key(&[]), HookDecision::Continue);
        assert_eq!(chain.run_post_route("key"), HookDecision::Continue);
    }
}
