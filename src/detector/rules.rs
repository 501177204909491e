use anyhow::{Context, Result};
use regex::Regex;

/// The closed set of attack classifications, in evaluation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackKind {
    Sqli,
    PathTraversal,
    AuthBruteforce,
    RateAbuse,
}

impl AttackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackKind::Sqli => "sqli",
            AttackKind::PathTraversal => "path_traversal",
            AttackKind::AuthBruteforce => "auth_bruteforce",
            AttackKind::RateAbuse => "rate_abuse",
        }
    }

    /// Fixed severity mapping.
    pub fn severity(&self) -> &'static str {
        match self {
            AttackKind::Sqli => "critical",
            AttackKind::PathTraversal => "high",
            AttackKind::AuthBruteforce => "high",
            AttackKind::RateAbuse => "medium",
        }
    }
}

/// Compiled detection rules. Construction is the only fallible step —
/// a pattern that fails to compile aborts startup.
pub struct RuleSet {
    sqli: Vec<Regex>,
    path_traversal: Regex,
    auth_failure: Regex,
    dotted_quad: Regex,
}

impl RuleSet {
    pub fn new() -> Result<Self> {
        // Keyword sequences tolerate URL-encoded (%20) and '+' spaces so
        // request paths logged verbatim still match.
        let sqli_patterns = [
            r"(?i)union(?:\s|%20|\+)+select",
            r"(?i)select(?:\s|%20|\+)+.+(?:\s|%20|\+)+from",
            r"(?i)insert(?:\s|%20|\+)+into",
            r"(?i)delete(?:\s|%20|\+)+from",
            r"(?i)drop(?:\s|%20|\+)+(?:table|database)",
            r"(?i)'\s*or\s*'1'\s*=\s*'1",
            r"(?i)\bor\b(?:\s|%20|\+)+1\s*=\s*1",
            r"(?i)exec\s*\(",
            r"(?i)execute(?:\s|%20|\+)+immediate",
            r"(?:--|;--|/\*|\*/)",
        ];
        let sqli = sqli_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("sqli pattern '{}'", p)))
            .collect::<Result<Vec<_>>>()?;

        let path_traversal = Regex::new(r"(?i)(?:\.\./|\.\.\\|%2e%2e%2f|%2e%2e/|\.\.%2f)")
            .context("path traversal pattern")?;

        let auth_failure = Regex::new(
            r"(?i)(?:\b401\b|unauthorized|authentication failed|invalid credentials|login failed)",
        )
        .context("auth failure pattern")?;

        let dotted_quad =
            Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").context("dotted quad pattern")?;

        Ok(Self {
            sqli,
            path_traversal,
            auth_failure,
            dotted_quad,
        })
    }

    pub fn is_sqli(&self, line: &str) -> bool {
        self.sqli.iter().any(|re| re.is_match(line))
    }

    pub fn is_path_traversal(&self, line: &str) -> bool {
        self.path_traversal.is_match(line)
    }

    pub fn is_auth_failure(&self, line: &str) -> bool {
        self.auth_failure.is_match(line)
    }

    /// Extract the source address from a log line: a structured `source_ip`
    /// field wins, then the first dotted-quad anywhere in the line. Returns
    /// `None` for lines carrying no address — those lines are dropped
    /// without touching attacker state.
    pub fn extract_source_ip(&self, line: &str) -> Option<String> {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(ip) = value.get("source_ip").and_then(|v| v.as_str()) {
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
        self.dotted_quad
            .find(line)
            .map(|m| m.as_str().to_string())
    }
}
