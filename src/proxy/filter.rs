//! Rule-based request filtering.
//!
//! Rules are evaluated in declared order against a request fingerprint
//! (host, path, full URL); the first matching rule wins. When nothing
//! matches, the configured default action applies. Evaluation itself is
//! pure; ask-mode adds a pluggable [`Asker`] consulted with a deadline and
//! an optional per-session decision cache.
//!
//! # Pattern types
//!
//! - **exact**: string equality against the scoped haystack
//! - **glob**: `*` matches any run (including `/`), `?` matches one
//!   character; a glob without wildcards behaves like exact
//! - **regex**: anchored match over the whole haystack
//!
//! Untyped patterns containing any of `^$|()[]{}+\` are treated as regex,
//! everything else as glob.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;
use wildmatch::WildMatch;

/// Default deadline for ask-mode decisions, in seconds.
pub const DEFAULT_ASK_TIMEOUT_SECS: u64 = 30;

/// Action to take for a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    /// Let the request through.
    Allow,
    /// Reject the request with HTTP 403.
    Block,
    /// Suspend the request pending an out-of-band decision.
    Ask,
}

/// Which part of the request a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    /// The request host only.
    #[default]
    Host,
    /// The request path only.
    Path,
    /// The full URL.
    Url,
}

/// How a rule's pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Exact string equality.
    Exact,
    /// Glob with `*` and `?` wildcards.
    Glob,
    /// Regular expression, matched against the whole haystack.
    Regex,
}

/// A single declarative filter rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    /// Pattern to match.
    pub pattern: String,
    /// Action when the rule matches.
    pub action: FilterAction,
    /// Part of the request to match. Defaults to host.
    #[serde(default)]
    pub scope: FilterScope,
    /// Explicit pattern type. Auto-detected when absent.
    #[serde(default, rename = "type")]
    pub pattern_type: Option<PatternType>,
    /// Human-readable explanation, shown in block responses.
    #[serde(default)]
    pub reason: Option<String>,
}

impl FilterRule {
    /// The effective pattern type: explicit, or detected from the pattern.
    pub fn effective_type(&self) -> PatternType {
        if let Some(t) = self.pattern_type {
            return t;
        }
        const REGEX_CHARS: &[char] = &['^', '$', '|', '(', ')', '[', ']', '{', '}', '+', '\\'];
        if self.pattern.contains(REGEX_CHARS) {
            PatternType::Regex
        } else {
            PatternType::Glob
        }
    }

    /// Check the rule for validity: non-empty pattern, compilable regex.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.pattern.is_empty() {
            return Err(FilterError::EmptyPattern);
        }
        if self.effective_type() == PatternType::Regex {
            anchored(&self.pattern).map_err(|e| FilterError::BadRegex {
                pattern: self.pattern.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Filter configuration. Filtering is enabled iff `default_action` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Action when no rule matches. Setting this enables filtering.
    #[serde(default)]
    pub default_action: Option<FilterAction>,
    /// Deadline for ask-mode decisions, in seconds.
    #[serde(default = "default_ask_timeout")]
    pub ask_timeout: u64,
    /// Cache ask-mode decisions for the session.
    #[serde(default = "default_true")]
    pub cache_decisions: bool,
    /// Ordered rule list; first match wins.
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

fn default_ask_timeout() -> u64 {
    DEFAULT_ASK_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            default_action: None,
            ask_timeout: DEFAULT_ASK_TIMEOUT_SECS,
            cache_decisions: true,
            rules: Vec::new(),
        }
    }
}

impl FilterConfig {
    /// Whether filtering is enabled.
    pub fn is_enabled(&self) -> bool {
        self.default_action.is_some()
    }

    /// Validate every rule.
    pub fn validate(&self) -> Result<(), FilterError> {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate().map_err(|e| FilterError::Rule {
                index: i + 1,
                source: Box::new(e),
            })?;
        }
        Ok(())
    }
}

/// Errors from rule compilation.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A rule has an empty pattern.
    #[error("pattern is required")]
    EmptyPattern,

    /// A regex pattern failed to compile.
    #[error("invalid regex pattern {pattern:?}: {message}")]
    BadRegex {
        /// The offending pattern.
        pattern: String,
        /// Compiler error message.
        message: String,
    },

    /// A rule at a given (1-based) position is invalid.
    #[error("rule {index}: {source}")]
    Rule {
        /// 1-based rule position.
        index: usize,
        /// The underlying rule error.
        source: Box<FilterError>,
    },
}

/// The request fingerprint a rule set is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct RequestFingerprint<'a> {
    /// Request host.
    pub host: &'a str,
    /// Request path.
    pub path: &'a str,
    /// Full request URL.
    pub url: &'a str,
}

/// Result of evaluating one request.
#[derive(Debug, Clone)]
pub struct FilterDecision {
    /// The determined action (never `Ask`; ask is resolved by [`FilterEngine::decide`]).
    pub action: FilterAction,
    /// Pattern of the matched rule, if any.
    pub matched_pattern: Option<String>,
    /// Human-readable explanation.
    pub reason: String,
    /// Whether the default action was used.
    pub is_default: bool,
}

/// A question posed to the operator for an ask-mode request.
#[derive(Debug, Clone)]
pub struct AskPrompt {
    /// Unique id for this prompt.
    pub id: Uuid,
    /// Request host.
    pub host: String,
    /// Full request URL.
    pub url: String,
    /// Reason attached to the matching rule, if any.
    pub rule_reason: Option<String>,
}

/// Out-of-band decision source for ask-mode rules.
///
/// Implementations return a receiver that resolves to the operator's
/// decision; dropping the sender (or exceeding the deadline) falls back to
/// the engine's fail-safe action.
pub trait Asker: Send + Sync {
    /// Pose a question; the engine awaits the returned channel.
    fn ask(&self, prompt: AskPrompt) -> oneshot::Receiver<FilterAction>;
}

enum Matcher {
    Exact(String),
    Glob(WildMatch),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, haystack: &str) -> bool {
        match self {
            Matcher::Exact(s) => s == haystack,
            Matcher::Glob(g) => g.matches(haystack),
            Matcher::Regex(r) => r.is_match(haystack),
        }
    }
}

struct CompiledRule {
    matcher: Matcher,
    scope: FilterScope,
    action: FilterAction,
    pattern: String,
    reason: Option<String>,
}

/// Compiled rule set plus ask-mode machinery.
pub struct FilterEngine {
    rules: Vec<CompiledRule>,
    default_action: FilterAction,
    ask_timeout: Duration,
    cache_enabled: bool,
    /// Session decision cache for resolved asks.
    cache: Mutex<HashMap<String, FilterAction>>,
    /// Per-key guard so at most one ask is in flight per cache key.
    ask_guards: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    asker: Option<Arc<dyn Asker>>,
}

impl FilterEngine {
    /// Compile a configuration into an engine.
    ///
    /// A disabled configuration (no default action) compiles to an engine
    /// that allows everything.
    pub fn from_config(
        config: &FilterConfig,
        asker: Option<Arc<dyn Asker>>,
    ) -> Result<Self, FilterError> {
        config.validate()?;

        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let matcher = match rule.effective_type() {
                    PatternType::Exact => Matcher::Exact(rule.pattern.clone()),
                    PatternType::Glob => Matcher::Glob(WildMatch::new(&rule.pattern)),
                    PatternType::Regex => Matcher::Regex(
                        anchored(&rule.pattern).expect("validated above"),
                    ),
                };
                CompiledRule {
                    matcher,
                    scope: rule.scope,
                    action: rule.action,
                    pattern: rule.pattern.clone(),
                    reason: rule.reason.clone(),
                }
            })
            .collect();

        Ok(Self {
            rules,
            default_action: config.default_action.unwrap_or(FilterAction::Allow),
            ask_timeout: Duration::from_secs(config.ask_timeout),
            cache_enabled: config.cache_decisions,
            cache: Mutex::new(HashMap::new()),
            ask_guards: tokio::sync::Mutex::new(HashMap::new()),
            asker,
        })
    }

    /// Evaluate the rule list. Pure: identical inputs produce identical
    /// decisions. `Ask` actions are returned as-is; use [`Self::decide`] to
    /// resolve them.
    pub fn evaluate(&self, req: RequestFingerprint<'_>) -> (FilterAction, FilterDecision) {
        for rule in &self.rules {
            let haystack = match rule.scope {
                FilterScope::Host => req.host,
                FilterScope::Path => req.path,
                FilterScope::Url => req.url,
            };
            if rule.matcher.matches(haystack) {
                let reason = rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("matched rule {:?}", rule.pattern));
                return (
                    rule.action,
                    FilterDecision {
                        action: rule.action,
                        matched_pattern: Some(rule.pattern.clone()),
                        reason,
                        is_default: false,
                    },
                );
            }
        }

        (
            self.default_action,
            FilterDecision {
                action: self.default_action,
                matched_pattern: None,
                reason: "default action".to_string(),
                is_default: true,
            },
        )
    }

    /// Evaluate and resolve ask-mode: consult the cache, then the asker
    /// with the configured deadline. Timeout, a missing asker, and a closed
    /// channel all fall back to the fail-safe action.
    pub async fn decide(&self, req: RequestFingerprint<'_>) -> FilterDecision {
        let (action, mut decision) = self.evaluate(req);
        if action != FilterAction::Ask {
            return decision;
        }

        let key = self.cache_key(&decision, req);

        // One in-flight ask per key; later arrivals wait and hit the cache.
        let guard = {
            let mut guards = self.ask_guards.lock().await;
            guards
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        if self.cache_enabled {
            if let Some(&cached) = self.cache.lock().unwrap().get(&key) {
                debug!("Cached ask decision for {}: {:?}", key, cached);
                decision.action = cached;
                decision.reason = format!("{} (cached decision)", decision.reason);
                return decision;
            }
        }

        let resolved = self.run_ask(req, &decision).await;
        match resolved {
            Some(action) => {
                if self.cache_enabled {
                    self.cache.lock().unwrap().insert(key, action);
                }
                decision.action = action;
                decision
            }
            None => {
                info!("Ask timed out for {}; falling back", req.url);
                decision.action = self.fallback_action();
                decision.reason = "ask timeout".to_string();
                decision.is_default = true;
                decision
            }
        }
    }

    async fn run_ask(
        &self,
        req: RequestFingerprint<'_>,
        decision: &FilterDecision,
    ) -> Option<FilterAction> {
        let asker = self.asker.as_ref()?;
        let prompt = AskPrompt {
            id: Uuid::new_v4(),
            host: req.host.to_string(),
            url: req.url.to_string(),
            rule_reason: decision.matched_pattern.as_ref().map(|_| decision.reason.clone()),
        };
        let rx = asker.ask(prompt);
        match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(Ok(action)) if action != FilterAction::Ask => Some(action),
            _ => None,
        }
    }

    /// The fail-safe action when an ask cannot be resolved: the configured
    /// default, with block standing in when the default is itself ask.
    fn fallback_action(&self) -> FilterAction {
        match self.default_action {
            FilterAction::Allow => FilterAction::Allow,
            _ => FilterAction::Block,
        }
    }

    fn cache_key(&self, decision: &FilterDecision, req: RequestFingerprint<'_>) -> String {
        let scope = decision
            .matched_pattern
            .as_ref()
            .and_then(|p| {
                self.rules
                    .iter()
                    .find(|r| &r.pattern == p)
                    .map(|r| r.scope)
            })
            .unwrap_or(FilterScope::Url);
        match scope {
            FilterScope::Host => req.host.to_string(),
            FilterScope::Path => format!("{}|{}", req.host, req.path),
            FilterScope::Url => req.url.to_string(),
        }
    }
}

/// Compile a regex with whole-haystack anchoring.
fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}
