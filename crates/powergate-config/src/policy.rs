//! Right-grant policy: decides which rights the authorization broker may
//! place into a freshly minted capability token.
//!
//! Rules map `(role, right)` pairs to an [`Effect`]. The [`GrantPolicy`]
//! evaluates them in priority order; the first matching rule wins and no
//! match means the right is withheld.

use std::collections::BTreeSet;

/// The effect of a grant rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The right may be granted.
    Allow,
    /// The right must not be granted.
    Deny,
}

/// A single grant rule.
#[derive(Debug, Clone)]
pub struct GrantRule {
    /// Role this rule applies to (e.g. "admin", "staff", "*").
    pub role: String,
    /// Right name this rule controls (e.g. "powergate.power.manage", "*").
    pub right: String,
    /// Whether to grant or withhold.
    pub effect: Effect,
    /// Priority (higher = evaluated first). Rules with equal priority
    /// are evaluated in insertion order.
    pub priority: u32,
}

impl GrantRule {
    pub fn allow(role: &str, right: &str) -> Self {
        Self {
            role: role.to_string(),
            right: right.to_string(),
            effect: Effect::Allow,
            priority: 0,
        }
    }

    pub fn deny(role: &str, right: &str) -> Self {
        Self {
            role: role.to_string(),
            right: right.to_string(),
            effect: Effect::Deny,
            priority: 0,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    fn matches(&self, role: &str, right: &str) -> bool {
        (self.role == "*" || self.role == role) && (self.right == "*" || self.right == right)
    }
}

/// The result of a grant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantDecision {
    Granted,
    Withheld,
    /// No rule matched; treated as withheld.
    NoMatch,
}

/// Evaluates grant requests against an ordered rule set.
///
/// Rules are kept sorted by priority (descending, stable) so evaluation
/// takes `&self` and the policy can be shared across connections.
#[derive(Debug, Clone, Default)]
pub struct GrantPolicy {
    rules: Vec<GrantRule>,
}

impl GrantPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, keeping the priority order.
    pub fn add_rule(&mut self, rule: GrantRule) {
        let at = self
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(at, rule);
    }

    pub fn evaluate(&self, role: &str, right: &str) -> GrantDecision {
        self.rules
            .iter()
            .find(|rule| rule.matches(role, right))
            .map(|rule| match rule.effect {
                Effect::Allow => GrantDecision::Granted,
                Effect::Deny => GrantDecision::Withheld,
            })
            .unwrap_or(GrantDecision::NoMatch)
    }

    /// Returns `true` only if a rule explicitly grants the right.
    pub fn is_granted(&self, role: &str, right: &str) -> bool {
        self.evaluate(role, right) == GrantDecision::Granted
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Roles referenced by at least one non-wildcard rule.
    pub fn roles(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.role != "*")
            .map(|r| r.role.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Create a policy from a list of rules.
pub fn build_policy(rules: Vec<GrantRule>) -> GrantPolicy {
    let mut policy = GrantPolicy::new();
    for rule in rules {
        policy.add_rule(rule);
    }
    policy
}
