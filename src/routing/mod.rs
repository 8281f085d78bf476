//! Content-based routing rules
//!
//! Rules are kept in insertion order and evaluated first-match-wins. The rule
//! list is an immutable snapshot swapped atomically on every change, so query
//! evaluation never takes a lock.

use arc_swap::ArcSwap;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::ReplicaId;
use crate::error::{RouterError, RouterResult};

/// Identifier assigned to a rule when it is added
pub type RuleId = u64;

/// Pattern-to-preference rule
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pattern: Regex,
    pub preferred: Vec<ReplicaId>,
    /// When no preferred replica is healthy, send the caller to the primary
    /// instead of falling through to weighted selection
    pub fallback_to_primary: bool,
    /// Informational; result caching is left to the caller
    pub cache_ttl: Option<Duration>,
}

impl RoutingRule {
    pub fn new(pattern: &str, preferred: Vec<ReplicaId>) -> RouterResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| RouterError::invalid_rule(format!("bad pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            pattern,
            preferred,
            fallback_to_primary: false,
            cache_ttl: None,
        })
    }

    pub fn with_fallback_to_primary(mut self, fallback: bool) -> Self {
        self.fallback_to_primary = fallback;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, query: &str) -> bool {
        self.pattern.is_match(query)
    }
}

/// A rule as stored by the engine
#[derive(Debug, Clone)]
pub struct RegisteredRule {
    pub id: RuleId,
    pub rule: RoutingRule,
}

/// Result of evaluating a query against the rules
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_id: RuleId,
    /// Preferred replicas that are currently healthy, in rule order
    pub candidates: Vec<ReplicaId>,
    pub fallback_to_primary: bool,
    pub cache_ttl: Option<Duration>,
}

/// Ordered rule list with lock-free evaluation
pub struct RuleEngine {
    rules: ArcSwap<Vec<Arc<RegisteredRule>>>,
    next_id: AtomicU64,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a rule; it is consulted after every rule added before it
    pub fn add_rule(&self, rule: RoutingRule) -> RuleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registered = Arc::new(RegisteredRule { id, rule });

        self.rules.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&registered));
            next
        });
        id
    }

    /// Remove a rule, keeping the order of the rest; false when unknown
    pub fn remove_rule(&self, rule_id: RuleId) -> bool {
        let previous = self.rules.rcu(|current| {
            current
                .iter()
                .filter(|r| r.id != rule_id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|r| r.id == rule_id)
    }

    /// Replace the whole list atomically, returning the new ids in order
    pub fn replace_rules(&self, rules: Vec<RoutingRule>) -> Vec<RuleId> {
        let registered: Vec<Arc<RegisteredRule>> = rules
            .into_iter()
            .map(|rule| {
                Arc::new(RegisteredRule {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    rule,
                })
            })
            .collect();
        let ids = registered.iter().map(|r| r.id).collect();
        self.rules.store(Arc::new(registered));
        ids
    }

    /// Evaluate `query`; only the first matching rule is consulted
    ///
    /// Returns `None` when no rule matches. A match whose preferred replicas
    /// are all unhealthy yields an empty candidate list.
    pub fn evaluate(&self, query: &str, is_healthy: impl Fn(&ReplicaId) -> bool) -> Option<RuleMatch> {
        let rules = self.rules.load();
        let matched = rules.iter().find(|r| r.rule.matches(query))?;

        Some(RuleMatch {
            rule_id: matched.id,
            candidates: matched
                .rule
                .preferred
                .iter()
                .filter(|id| is_healthy(*id))
                .cloned()
                .collect(),
            fallback_to_primary: matched.rule.fallback_to_primary,
            cache_ttl: matched.rule.cache_ttl,
        })
    }

    /// Current rules in evaluation order
    pub fn rules(&self) -> Vec<RegisteredRule> {
        self.rules.load().iter().map(|r| RegisteredRule::clone(r)).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.load().is_empty()
    }

    pub fn clear(&self) {
        self.rules.store(Arc::new(Vec::new()));
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ReplicaId> {
        names.iter().map(|n| ReplicaId::from(*n)).collect()
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = RoutingRule::new("analytics_(", ids(&["b"]));
        assert!(matches!(result, Err(RouterError::InvalidRule { .. })));
    }

    #[test]
    fn test_no_rules_no_match() {
        let engine = RuleEngine::new();
        assert!(engine.evaluate("SELECT * FROM tickets", |_| true).is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let engine = RuleEngine::new();
        let first = engine.add_rule(RoutingRule::new("analytics_", ids(&["b"])).unwrap());
        engine.add_rule(RoutingRule::new("SELECT", ids(&["a"])).unwrap());

        let matched = engine.evaluate("SELECT * FROM analytics_events", |_| true).unwrap();
        assert_eq!(matched.rule_id, first);
        assert_eq!(matched.candidates, ids(&["b"]));

        let other = engine.evaluate("SELECT * FROM tickets", |_| true).unwrap();
        assert_eq!(other.candidates, ids(&["a"]));
    }

    #[test]
    fn test_later_rule_not_consulted_when_candidates_unhealthy() {
        let engine = RuleEngine::new();
        engine.add_rule(RoutingRule::new("analytics_", ids(&["b"])).unwrap());
        engine.add_rule(RoutingRule::new("analytics_", ids(&["a"])).unwrap());

        let matched = engine
            .evaluate("SELECT * FROM analytics_events", |id| id.as_str() != "b")
            .unwrap();
        assert!(matched.candidates.is_empty());
    }

    #[test]
    fn test_candidates_keep_rule_order_and_drop_unhealthy() {
        let engine = RuleEngine::new();
        engine.add_rule(RoutingRule::new("^SELECT", ids(&["c", "a", "b"])).unwrap());

        let matched = engine.evaluate("SELECT 1", |id| id.as_str() != "a").unwrap();
        assert_eq!(matched.candidates, ids(&["c", "b"]));
    }

    #[test]
    fn test_rule_flags_are_reported() {
        let engine = RuleEngine::new();
        engine.add_rule(
            RoutingRule::new("sla_", ids(&["a"]))
                .unwrap()
                .with_fallback_to_primary(true)
                .with_cache_ttl(Duration::from_secs(300)),
        );

        let matched = engine.evaluate("SELECT * FROM sla_policies", |_| true).unwrap();
        assert!(matched.fallback_to_primary);
        assert_eq!(matched.cache_ttl, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_remove_and_replace_rules() {
        let engine = RuleEngine::new();
        let a = engine.add_rule(RoutingRule::new("a", ids(&["a"])).unwrap());
        let b = engine.add_rule(RoutingRule::new("b", ids(&["b"])).unwrap());

        assert!(engine.remove_rule(a));
        assert!(!engine.remove_rule(a));
        assert_eq!(engine.rules().iter().map(|r| r.id).collect::<Vec<_>>(), vec![b]);

        let replaced = engine.replace_rules(vec![
            RoutingRule::new("x", ids(&["x"])).unwrap(),
            RoutingRule::new("y", ids(&["y"])).unwrap(),
        ]);
        assert_eq!(replaced.len(), 2);
        assert_eq!(engine.len(), 2);
        assert!(engine.evaluate("b", |_| true).is_none());
        assert_eq!(engine.rules()[0].rule.pattern(), "x");

        engine.clear();
        assert!(engine.is_empty());
    }

    #[test]
    fn test_concurrent_appends_keep_every_rule() {
        let engine = Arc::new(RuleEngine::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        let pattern = format!("t{}_{}", i, j);
                        engine.add_rule(RoutingRule::new(&pattern, Vec::new()).unwrap());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 200);
    }
}
