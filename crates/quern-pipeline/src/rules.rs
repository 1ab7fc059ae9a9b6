//! Job eligibility rules.
//!
//! Job definitions carry declarative rules evaluated against the node
//! that triggered scheduling. List rules share one grammar: an entry is
//! `name`, `name:branch`, or either form prefixed with `!` to deny. A
//! rule list allows a value iff no negative entry matches and either no
//! positive entry exists or at least one positive entry matches.

use chrono::Duration;
use regex::Regex;

use quern_core::config::{JobRules, VersionBound};
use quern_core::{Error as CoreError, Node};

use crate::error::Result;

/// One parsed rule entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    negated: bool,
    first: String,
    second: Option<String>,
}

impl RuleEntry {
    /// Parses `name`, `name:branch`, `!name` or `!name:branch`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (negated, rest) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        match rest.split_once(':') {
            Some((first, second)) => Self {
                negated,
                first: first.to_string(),
                second: Some(second.to_string()),
            },
            None => Self {
                negated,
                first: rest.to_string(),
                second: None,
            },
        }
    }

    fn matches_tree(&self, tree: &str, branch: &str) -> bool {
        self.first == tree && self.second.as_deref().is_none_or(|b| b == branch)
    }

    fn matches_branch(&self, tree: &str, branch: &str) -> bool {
        match &self.second {
            Some(second) => self.first == tree && second == branch,
            None => self.first == branch,
        }
    }

    fn matches_value(&self, value: &str) -> bool {
        self.first == value
    }
}

fn list_allows(entries: &[RuleEntry], matches: impl Fn(&RuleEntry) -> bool) -> bool {
    let mut has_positive = false;
    let mut positive_hit = false;
    for entry in entries {
        let hit = matches(entry);
        if entry.negated {
            if hit {
                return false;
            }
        } else {
            has_positive = true;
            positive_hit = positive_hit || hit;
        }
    }
    !has_positive || positive_hit
}

/// Parses a frequency window of the form `[Nd][Nh][Nm]`.
///
/// # Errors
///
/// Returns an invalid-rule error when the string has no recognized
/// component.
pub fn parse_frequency(raw: &str) -> Result<Duration> {
    let re = Regex::new(r"^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?$").expect("static regex");
    let captures = re
        .captures(raw)
        .filter(|c| c.get(1).is_some() || c.get(2).is_some() || c.get(3).is_some())
        .ok_or_else(|| CoreError::invalid_rule(raw, "expected [Nd][Nh][Nm]"))?;

    let component = |index: usize| -> i64 {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    Ok(Duration::days(component(1))
        + Duration::hours(component(2))
        + Duration::minutes(component(3)))
}

/// Extracts `(version, patchlevel)` from a `git describe` string such as
/// `v6.1-rc3-1234-gdeadbeef`.
#[must_use]
pub fn parse_version(describe: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"^v?(\d+)\.(\d+)").expect("static regex");
    let captures = re.captures(describe)?;
    let version = captures.get(1)?.as_str().parse().ok()?;
    let patchlevel = captures.get(2)?.as_str().parse().ok()?;
    Some((version, patchlevel))
}

fn version_within(describe: &str, min: Option<VersionBound>, max: Option<VersionBound>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some((version, patchlevel)) = parse_version(describe) else {
        // A revision without a parseable version cannot satisfy a bound.
        return false;
    };
    if let Some(min) = min {
        if (version, patchlevel) < (min.version, min.patchlevel) {
            return false;
        }
    }
    if let Some(max) = max {
        if (version, patchlevel) > (max.version, max.patchlevel) {
            return false;
        }
    }
    true
}

/// Compiled form of [`JobRules`], parsed once per job definition.
#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    tree: Vec<RuleEntry>,
    branch: Vec<RuleEntry>,
    arch: Vec<RuleEntry>,
    defconfig: Vec<RuleEntry>,
    fragments: Vec<RuleEntry>,
    min_version: Option<VersionBound>,
    max_version: Option<VersionBound>,
    frequency: Option<Duration>,
}

impl CompiledRules {
    /// Compiles the declarative rules.
    ///
    /// # Errors
    ///
    /// Returns an invalid-rule error for an unparseable frequency window.
    pub fn compile(rules: &JobRules) -> Result<Self> {
        let parse_list = |raw: &[String]| raw.iter().map(|s| RuleEntry::parse(s)).collect();
        Ok(Self {
            tree: parse_list(&rules.tree),
            branch: parse_list(&rules.branch),
            arch: parse_list(&rules.arch),
            defconfig: parse_list(&rules.defconfig),
            fragments: parse_list(&rules.fragments),
            min_version: rules.min_version,
            max_version: rules.max_version,
            frequency: rules
                .frequency
                .as_deref()
                .map(parse_frequency)
                .transpose()?,
        })
    }

    /// Returns the frequency window, when one is configured.
    #[must_use]
    pub fn frequency(&self) -> Option<Duration> {
        self.frequency
    }

    /// Evaluates every rule except frequency against the triggering node.
    ///
    /// Frequency needs a store query for prior runs, so the scheduler
    /// checks it separately.
    #[must_use]
    pub fn eligible(&self, node: &Node) -> bool {
        let Some(revision) = node.data.kernel_revision.as_ref() else {
            // Rules are only defined relative to a revision.
            return self.tree.is_empty()
                && self.branch.is_empty()
                && self.min_version.is_none()
                && self.max_version.is_none();
        };

        if !list_allows(&self.tree, |e| e.matches_tree(&revision.tree, &revision.branch)) {
            return false;
        }
        if !list_allows(&self.branch, |e| {
            e.matches_branch(&revision.tree, &revision.branch)
        }) {
            return false;
        }

        let describe = revision
            .describe
            .as_deref()
            .unwrap_or(revision.commit.as_str());
        if !version_within(describe, self.min_version, self.max_version) {
            return false;
        }

        if let Some(arch) = node.data.arch.as_deref() {
            if !list_allows(&self.arch, |e| e.matches_value(arch)) {
                return false;
            }
        } else if self.arch.iter().any(|e| !e.negated) {
            return false;
        }

        if let Some(defconfig) = node.data.defconfig.as_deref() {
            if !list_allows(&self.defconfig, |e| e.matches_value(defconfig)) {
                return false;
            }
        } else if self.defconfig.iter().any(|e| !e.negated) {
            return false;
        }

        if !list_allows(&self.fragments, |e| {
            node.data.fragments.iter().any(|f| e.matches_value(f))
        }) {
            return false;
        }

        true
    }
}

/// Returns true if `job_name` matches any glob pattern in `patterns`.
///
/// Patterns support `*` (any run) and `?` (any single character). An
/// absent filter means "all jobs"; that case is handled by the caller.
#[must_use]
pub fn jobfilter_matches(patterns: &[String], job_name: &str) -> bool {
    patterns.iter().any(|pattern| {
        let mut regex = String::with_capacity(pattern.len() + 8);
        regex.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => regex.push_str(".*"),
                '?' => regex.push('.'),
                other => regex.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex.push('$');
        Regex::new(&regex).is_ok_and(|re| re.is_match(job_name))
    })
}
