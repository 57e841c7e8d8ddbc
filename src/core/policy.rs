//! Policy rules and the policy engine.
//!
//! A rule set is compiled as a whole before it can be installed: every
//! regex is built up front and any bad rule rejects the entire set, so
//! evaluation never sees an invalid rule. Evaluation is first-match-wins
//! in ascending priority, and a command no rule matches is denied.
//!
//! The engine holds the active set behind an `Arc` snapshot. Swapping in
//! a new set never disturbs evaluations already holding the old one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a matching rule decides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::Deny => "DENY",
            Decision::RequireApproval => "REQUIRE_APPROVAL",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule matches command text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RulePattern {
    /// Whole command equals the value
    Exact(String),
    /// Command starts with the value
    Prefix(String),
    /// Regex matches somewhere in the command
    Regex(String),
}

impl RulePattern {
    /// Tie-break rank among rules of equal priority
    fn kind_rank(&self) -> u8 {
        match self {
            RulePattern::Exact(_) => 0,
            RulePattern::Prefix(_) => 1,
            RulePattern::Regex(_) => 2,
        }
    }

    fn value(&self) -> &str {
        match self {
            RulePattern::Exact(v) | RulePattern::Prefix(v) | RulePattern::Regex(v) => v,
        }
    }
}

/// A pattern-to-decision mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique id within the rule set
    pub id: String,

    pub pattern: RulePattern,

    pub decision: Decision,

    /// Lower values are evaluated first
    #[serde(default)]
    pub priority: u32,

    #[serde(default)]
    pub rationale: String,

    /// Requester ids this rule applies to (empty means everyone)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requesters: Vec<String>,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, pattern: RulePattern, decision: Decision, priority: u32) -> Self {
        Self {
            id: id.into(),
            pattern,
            decision,
            priority,
            rationale: String::new(),
            requesters: Vec::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn for_requesters<I, S>(mut self, requesters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requesters = requesters.into_iter().map(Into::into).collect();
        self
    }
}

/// Caller-supplied context for evaluation
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub requester: String,
    pub working_dir: PathBuf,
}

impl PolicyContext {
    pub fn new(requester: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            requester: requester.into(),
            working_dir: working_dir.into(),
        }
    }
}

/// Result of evaluating a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    /// Matching rule, or None when the default DENY applied
    pub rule_id: Option<String>,
    pub rationale: String,
    pub ruleset_version: String,
}

/// Errors from rule-set loading and evaluation
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("rule '{rule_id}' has an invalid regex: {source}")]
    InvalidPattern {
        rule_id: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule '{0}' has an empty pattern")]
    EmptyPattern(String),

    #[error("rule id '{0}' is defined more than once")]
    DuplicateRuleId(String),

    #[error("failed to parse rule set: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read rule set {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A versioned, uncompiled rule set as stored on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl RuleSet {
    pub fn new(version: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        Self {
            version: version.into(),
            rules,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Compile every rule; any failure rejects the whole set
    pub fn compile(self) -> Result<CompiledRuleSet, PolicyError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(self.rules.len());

        for (order, rule) in self.rules.into_iter().enumerate() {
            if !seen.insert(rule.id.clone()) {
                return Err(PolicyError::DuplicateRuleId(rule.id));
            }
            if rule.pattern.value().trim().is_empty() {
                return Err(PolicyError::EmptyPattern(rule.id));
            }

            let matcher = match rule.pattern {
                RulePattern::Exact(ref v) => Matcher::Exact(v.trim().to_string()),
                RulePattern::Prefix(ref v) => Matcher::Prefix(v.trim_start().to_string()),
                RulePattern::Regex(ref v) => {
                    let regex = Regex::new(v).map_err(|source| PolicyError::InvalidPattern {
                        rule_id: rule.id.clone(),
                        source,
                    })?;
                    Matcher::Regex(regex)
                }
            };

            compiled.push(CompiledRule {
                rule,
                matcher,
                order,
            });
        }

        compiled.sort_by_key(|c| (c.rule.priority, c.rule.pattern.kind_rank(), c.order));

        Ok(CompiledRuleSet {
            version: self.version,
            rules: compiled,
        })
    }
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, command: &str) -> bool {
        match self {
            Matcher::Exact(v) => command == v,
            Matcher::Prefix(v) => command.starts_with(v.as_str()),
            Matcher::Regex(r) => r.is_match(command),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: PolicyRule,
    matcher: Matcher,
    order: usize,
}

impl CompiledRule {
    fn applies_to(&self, requester: &str) -> bool {
        self.rule.requesters.is_empty() || self.rule.requesters.iter().any(|r| r == requester)
    }
}

/// A rule set that compiled successfully, in evaluation order
#[derive(Debug)]
pub struct CompiledRuleSet {
    version: String,
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    /// A set with no rules (everything denied)
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            rules: Vec::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in the order they are evaluated
    pub fn rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// Decide on a command
    ///
    /// Pure: the result depends only on this set and the inputs.
    pub fn evaluate(&self, command: &str, ctx: &PolicyContext) -> Result<PolicyDecision, PolicyError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(PolicyError::EmptyCommand);
        }

        for compiled in &self.rules {
            if compiled.applies_to(&ctx.requester) && compiled.matcher.matches(command) {
                return Ok(PolicyDecision {
                    decision: compiled.rule.decision,
                    rule_id: Some(compiled.rule.id.clone()),
                    rationale: compiled.rule.rationale.clone(),
                    ruleset_version: self.version.clone(),
                });
            }
        }

        Ok(PolicyDecision {
            decision: Decision::Deny,
            rule_id: None,
            rationale: "no policy rule matched".to_string(),
            ruleset_version: self.version.clone(),
        })
    }

    /// Default rule set
    ///
    /// Destructive and privilege-escalating commands are denied, package
    /// installs need approval, and plain read-only inspection is allowed.
    /// Everything else falls through to the default DENY.
    pub fn standard() -> Result<Self, PolicyError> {
        let deny = |id: &str, pattern: &str, rationale: &str| {
            PolicyRule::new(id, RulePattern::Regex(pattern.to_string()), Decision::Deny, 0)
                .with_rationale(rationale)
        };

        let rules = vec![
            deny(
                "deny-recursive-rm",
                r"\brm\s+(-[a-zA-Z]*[rRf][a-zA-Z]*|--recursive|--force)\b.*/",
                "recursive or forced delete touching a path",
            ),
            deny(
                "deny-pipe-to-shell",
                r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
                "downloaded content piped into a shell",
            ),
            deny(
                "deny-device-write",
                r"\b(dd|fdisk|mkfs(\.\w+)?|mount)\b.*(/dev|/sys)",
                "raw device or system mount manipulation",
            ),
            deny(
                "deny-sudo-su",
                r"\bsudo\s+su\b",
                "switching to root",
            ),
            deny("deny-su-login", r"\bsu\s+-", "switching user with a login shell"),
            deny(
                "deny-find-actions",
                r"\bfind\b.*\s-(delete|exec|execdir|ok|okdir|fprint0?|fprintf|fls)\b",
                "find that deletes, writes files, or runs commands",
            ),
            deny(
                "deny-setuid",
                r"\bchmod\s+.*(u\+s|[0-7]?4[0-7]{3}\b)",
                "setting the setuid bit",
            ),
            PolicyRule::new(
                "approve-sudo",
                RulePattern::Regex(r"^sudo\s".to_string()),
                Decision::RequireApproval,
                20,
            )
            .with_rationale("privileged command"),
            PolicyRule::new(
                "approve-package-install",
                RulePattern::Regex(
                    r"^(sudo\s+)?(apt(-get)?|yum|dnf|brew|pip3?|npm|cargo)\s+install\b".to_string(),
                ),
                Decision::RequireApproval,
                10,
            )
            .with_rationale("package installation changes the host"),
            PolicyRule::new(
                "allow-read-only",
                RulePattern::Regex(
                    r"^(cat|less|head|tail|grep|find|ls|pwd|file|wc|echo)(\s[^;&|`$<>]*)?$".to_string(),
                ),
                Decision::Allow,
                100,
            )
            .with_rationale("read-only inspection"),
            PolicyRule::new(
                "allow-git-read",
                RulePattern::Regex(r"^git\s+(status|log|diff)(\s[^;&|`$<>]*)?$".to_string()),
                Decision::Allow,
                100,
            )
            .with_rationale("read-only git query"),
        ];

        RuleSet::new("standard-1", rules).compile()
    }
}

/// Holds the active rule set as an atomically swappable snapshot
#[derive(Debug)]
pub struct PolicyEngine {
    active: RwLock<Arc<CompiledRuleSet>>,
}

impl PolicyEngine {
    pub fn new(rules: CompiledRuleSet) -> Self {
        Self {
            active: RwLock::new(Arc::new(rules)),
        }
    }

    /// Engine with the default rule set installed
    pub fn standard() -> Result<Self, PolicyError> {
        Ok(Self::new(CompiledRuleSet::standard()?))
    }

    /// Current rule set; stays valid even if a new set is installed later
    pub fn snapshot(&self) -> Arc<CompiledRuleSet> {
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the active set, returning the previous one
    pub fn install(&self, rules: CompiledRuleSet) -> Arc<CompiledRuleSet> {
        let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(rules))
    }

    /// Compile a YAML rule set and install it; on error nothing changes
    pub fn load_yaml(&self, yaml: &str) -> Result<String, PolicyError> {
        let compiled = RuleSet::from_yaml(yaml)?.compile()?;
        let version = compiled.version().to_string();
        self.install(compiled);
        Ok(version)
    }

    pub fn load_file(&self, path: &Path) -> Result<String, PolicyError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_yaml(&yaml)
    }

    pub fn evaluate(&self, command: &str, ctx: &PolicyContext) -> Result<PolicyDecision, PolicyError> {
        self.snapshot().evaluate(command, ctx)
    }
}
