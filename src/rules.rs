//! Declarative rule engine and system-state detector.
//!
//! The engine holds the compiled rule set from the configuration document and
//! exposes two pure functions over a [`StateSnapshot`]: `evaluate`, which
//! gates a single relay action, and `detect_state`, which names the plant
//! state. Neither mutates anything and neither touches the device link, so
//! both are testable with synthetic snapshots.

use serde::{Deserialize, Serialize};

use crate::channel::StateSnapshot;
use crate::config::SystemConfig;
use crate::expr::{EvalEnv, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Predicate true means the action must not proceed.
    Forbidden,
    /// Predicate must be true for the action to proceed.
    Required,
    /// Analog limit, enforced like `Forbidden` but reported separately.
    Threshold,
    /// Plant-level emergency. Evaluated in every mode, including Override.
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Notice,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub kind: RuleKind,
    pub when: Expr,
    pub severity: Severity,
    pub message: String,
    /// Relay roles this rule gates. Empty means every relay.
    pub scope: Vec<String>,
    /// Downgrade a block to a confirmation prompt.
    pub confirm: bool,
}

impl Rule {
    fn applies_to(&self, relay_role: &str) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|r| r == relay_role)
    }

    /// Whether this rule objects to the action under `env`.
    fn violated(&self, env: &EvalEnv<'_>) -> bool {
        match self.kind {
            RuleKind::Forbidden | RuleKind::Threshold | RuleKind::Emergency => self.when.eval(env),
            RuleKind::Required => !self.when.eval(env),
        }
    }
}

/// One named plant state, detected when its predicate fully matches.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDefinition {
    pub name: String,
    /// Higher wins when several definitions match at once.
    pub priority: i32,
    pub when: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Normal,
    Manual,
    Override,
}

/// Operator permission policy consumed when switching modes and by the
/// Normal-mode manual allow-list. No authentication lives here; the console
/// passes a role level it already established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModePolicy {
    /// Relay roles an operator may toggle manually in Normal mode.
    #[serde(default)]
    pub normal_allow: Vec<String>,
    /// Minimum role level to enter Manual mode.
    #[serde(default = "default_manual_level")]
    pub manual_level: u8,
    /// Minimum role level to enter Override mode.
    #[serde(default = "default_override_level")]
    pub override_level: u8,
}

fn default_manual_level() -> u8 {
    1
}

fn default_override_level() -> u8 {
    2
}

impl Default for ModePolicy {
    fn default() -> Self {
        Self {
            normal_allow: Vec::new(),
            manual_level: default_manual_level(),
            override_level: default_override_level(),
        }
    }
}

impl ModePolicy {
    pub fn mode_allowed(&self, mode: EnforcementMode, role_level: u8) -> bool {
        match mode {
            EnforcementMode::Normal => true,
            EnforcementMode::Manual => role_level >= self.manual_level,
            EnforcementMode::Override => role_level >= self.override_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOrigin {
    /// Console button press.
    Manual,
    /// Step of a running procedure.
    Procedure,
}

/// The action being gated: which relay, and who is asking.
#[derive(Debug, Clone, Copy)]
pub struct ActionScope<'a> {
    pub relay_role: &'a str,
    pub origin: ActionOrigin,
}

/// Per-evaluation context. `grants` are scoped exceptions handed out by a
/// running procedure (e.g. gas valves enabled for the duration of a sputter
/// run); they widen the Normal-mode allow-list and nothing else.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub mode: EnforcementMode,
    pub confirmed: bool,
    pub grants: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(String),
    RequireConfirmation(String),
    Emergency(String),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

pub struct RuleEngine {
    rules: Vec<Rule>,
    /// Sorted by priority, highest first; config order breaks ties.
    states: Vec<StateDefinition>,
    thresholds: std::collections::BTreeMap<String, f64>,
}

impl RuleEngine {
    pub fn new(config: &SystemConfig) -> Self {
        let mut states = config.states.clone();
        states.sort_by_key(|s| std::cmp::Reverse(s.priority));
        Self {
            rules: config.rules.clone(),
            states,
            thresholds: config.thresholds.clone(),
        }
    }

    fn lookup_threshold(&self, name: &str) -> Option<f64> {
        self.thresholds.get(name).copied()
    }

    /// Name the current plant state: the highest-priority definition whose
    /// predicate fully matches, or `"unknown"`. Pure and idempotent for a
    /// given snapshot.
    pub fn detect_state(&self, snapshot: &StateSnapshot) -> &str {
        let thresholds = |name: &str| self.lookup_threshold(name);
        // State definitions may not reference the detected state (enforced at
        // load), so the env carries an empty one.
        let env = EvalEnv {
            snapshot,
            thresholds: &thresholds,
            detected_state: "",
        };
        self.states
            .iter()
            .find(|s| s.when.eval(&env))
            .map(|s| s.name.as_str())
            .unwrap_or("unknown")
    }

    /// Gate one relay action. Precedence, in order:
    /// emergency rules (every mode) > Override allows everything else >
    /// Normal-mode manual allow-list > forbidden/threshold > required >
    /// confirmation prompts.
    pub fn evaluate(
        &self,
        snapshot: &StateSnapshot,
        policy: &ModePolicy,
        action: &ActionScope<'_>,
        ctx: &EvalContext<'_>,
    ) -> Decision {
        let detected = self.detect_state(snapshot).to_string();
        let thresholds = |name: &str| self.lookup_threshold(name);
        let env = EvalEnv {
            snapshot,
            thresholds: &thresholds,
            detected_state: &detected,
        };

        for rule in self.rules.iter().filter(|r| r.kind == RuleKind::Emergency) {
            if rule.applies_to(action.relay_role) && rule.violated(&env) {
                return Decision::Emergency(rule.message.clone());
            }
        }

        if ctx.mode == EnforcementMode::Override {
            return Decision::Allow;
        }

        if ctx.mode == EnforcementMode::Normal && action.origin == ActionOrigin::Manual {
            let allowed = policy.normal_allow.iter().any(|r| r == action.relay_role)
                || ctx.grants.iter().any(|r| r == action.relay_role);
            if !allowed {
                return Decision::Block(format!(
                    "relay `{}` is not operator-controllable in normal mode",
                    action.relay_role
                ));
            }
        }

        // Hard blocks before prompts: a confirmable rule never masks a firm
        // one. Forbidden and threshold rules outrank required rules, so the
        // reported reason does not depend on document order.
        for kinds in [
            &[RuleKind::Forbidden, RuleKind::Threshold][..],
            &[RuleKind::Required][..],
        ] {
            for rule in self.rules.iter().filter(|r| !r.confirm) {
                if kinds.contains(&rule.kind)
                    && rule.applies_to(action.relay_role)
                    && rule.violated(&env)
                {
                    return Decision::Block(rule.message.clone());
                }
            }
        }

        if !ctx.confirmed {
            for rule in self.rules.iter().filter(|r| r.confirm) {
                if rule.kind != RuleKind::Emergency
                    && rule.applies_to(action.relay_role)
                    && rule.violated(&env)
                {
                    return Decision::RequireConfirmation(rule.message.clone());
                }
            }
        }

        Decision::Allow
    }

    /// Evaluate a compiled condition against a snapshot. Procedure wait and
    /// branch steps go through here so they share the threshold table and the
    /// detected state.
    pub fn eval_condition(&self, expr: &Expr, snapshot: &StateSnapshot) -> bool {
        let detected = self.detect_state(snapshot).to_string();
        let thresholds = |name: &str| self.lookup_threshold(name);
        let env = EvalEnv {
            snapshot,
            thresholds: &thresholds,
            detected_state: &detected,
        };
        expr.eval(&env)
    }

    /// Emergency rules matching the snapshot regardless of any action, used
    /// by the monitor task to raise plant-level alarms.
    pub fn active_emergencies(&self, snapshot: &StateSnapshot) -> Vec<String> {
        let detected = self.detect_state(snapshot).to_string();
        let thresholds = |name: &str| self.lookup_threshold(name);
        let env = EvalEnv {
            snapshot,
            thresholds: &thresholds,
            detected_state: &detected,
        };
        self.rules
            .iter()
            .filter(|r| r.kind == RuleKind::Emergency && r.when.eval(&env))
            .map(|r| r.message.clone())
            .collect()
    }
}
