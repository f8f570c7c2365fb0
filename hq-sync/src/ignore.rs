//! Ignore engine
//!
//! Gitignore-style pattern matching shared by the watcher, the uploader
//! path, and the change detector. Supports `*`, `**`, `?`, leading `!`
//! negation, `/` anchoring, and trailing `/` directory-only rules. The
//! last matching rule wins; a negated match re-includes the path.
//!
//! Rule sets are hot-swappable: `update_patterns` replaces the compiled
//! set atomically and in-flight checks keep matching against the set they
//! started with.

use std::sync::{Arc, RwLock};

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{Result, SyncError};

/// Patterns every engine instance carries, ahead of user patterns.
/// The `.hq-*` entries are reserved for the sync system itself.
pub const DEFAULT_PATTERNS: &[&str] = &[
    ".git/",
    ".svn/",
    ".hg/",
    ".DS_Store",
    "Thumbs.db",
    "node_modules/",
    "target/",
    "dist/",
    "build/",
    "__pycache__/",
    "*.tmp",
    "*.swp",
    "*.part",
    ".hq-sync-state.json",
    ".hq-sync-state.json.*",
    ".hq-trash/",
];

/// Outcome of a single ignore check.
#[derive(Debug, Clone)]
pub struct IgnoreDecision {
    pub ignored: bool,
    pub matched_rule: Option<String>,
    pub reason: String,
}

struct CompiledRule {
    raw: String,
    negated: bool,
    dir_only: bool,
    /// Matches the path named by the pattern itself.
    self_matcher: GlobMatcher,
    /// Matches anything nested below a path named by the pattern.
    children_matcher: GlobMatcher,
}

impl CompiledRule {
    fn compile(raw: &str) -> Result<Option<Self>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let (negated, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (dir_only, body) = match body.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, body),
        };
        // A slash anywhere in the body anchors the pattern to the root;
        // otherwise it matches at any depth.
        let anchored = body.starts_with('/') || body.contains('/');
        let body = body.strip_prefix('/').unwrap_or(body);
        if body.is_empty() {
            return Ok(None);
        }

        let self_pattern = if anchored {
            body.to_string()
        } else {
            format!("**/{body}")
        };
        let children_pattern = format!("{self_pattern}/**");

        let build = |pattern: &str| -> Result<GlobMatcher> {
            GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map(|glob| glob.compile_matcher())
                .map_err(|e| {
                    SyncError::Config(vec![format!("invalid ignore pattern '{raw}': {e}")])
                })
        };

        Ok(Some(Self {
            raw: trimmed.to_string(),
            negated,
            dir_only,
            self_matcher: build(&self_pattern)?,
            children_matcher: build(&children_pattern)?,
        }))
    }

    fn matches(&self, relative_path: &str, is_dir: bool) -> bool {
        if self.children_matcher.is_match(relative_path) {
            // Anything under a named directory matches regardless of the
            // trailing-slash restriction on the directory itself.
            return true;
        }
        if self.self_matcher.is_match(relative_path) {
            return !self.dir_only || is_dir;
        }
        false
    }
}

pub struct IgnoreEngine {
    rules: RwLock<Arc<Vec<CompiledRule>>>,
}

impl IgnoreEngine {
    /// Compile the bundled defaults plus `user_patterns`, in that order,
    /// so user rules can re-include defaulted paths with `!`.
    pub fn new(user_patterns: &[String]) -> Result<Self> {
        let rules = Self::compile_all(user_patterns)?;
        Ok(Self {
            rules: RwLock::new(Arc::new(rules)),
        })
    }

    pub fn with_defaults() -> Self {
        // The bundled defaults are known-valid.
        Self::new(&[]).expect("default ignore patterns compile")
    }

    fn compile_all(user_patterns: &[String]) -> Result<Vec<CompiledRule>> {
        let mut rules = Vec::new();
        for pattern in DEFAULT_PATTERNS {
            if let Some(rule) = CompiledRule::compile(pattern)? {
                rules.push(rule);
            }
        }
        for pattern in user_patterns {
            if let Some(rule) = CompiledRule::compile(pattern)? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    /// Atomically replace the user portion of the rule set. In-flight
    /// checks keep the set they started with.
    pub fn update_patterns(&self, user_patterns: &[String]) -> Result<()> {
        let rules = Arc::new(Self::compile_all(user_patterns)?);
        *self.rules.write().expect("ignore rules lock poisoned") = rules;
        Ok(())
    }

    pub fn check(&self, relative_path: &str, is_dir: bool) -> IgnoreDecision {
        let rules = Arc::clone(&self.rules.read().expect("ignore rules lock poisoned"));

        let mut last_match: Option<&CompiledRule> = None;
        for rule in rules.iter() {
            if rule.matches(relative_path, is_dir) {
                last_match = Some(rule);
            }
        }

        match last_match {
            Some(rule) if rule.negated => IgnoreDecision {
                ignored: false,
                matched_rule: Some(rule.raw.clone()),
                reason: format!("re-included by rule '{}'", rule.raw),
            },
            Some(rule) => IgnoreDecision {
                ignored: true,
                matched_rule: Some(rule.raw.clone()),
                reason: format!("matched rule '{}'", rule.raw),
            },
            None => IgnoreDecision {
                ignored: false,
                matched_rule: None,
                reason: "no rule matched".to_string(),
            },
        }
    }
}
