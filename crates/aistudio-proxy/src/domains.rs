//! Intercept domain rules.
//!
//! Decides which CONNECT targets get TLS-terminated and inspected. Every
//! other host is tunneled through untouched.

use std::fmt;

use crate::error::{ProxyError, Result};

/// One intercept rule: an exact hostname or a `*.` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptRule {
    /// Matches the hostname exactly.
    Exact(String),
    /// Matches any proper subdomain of the stored base, at any depth.
    /// `*.google.com` is stored as `.google.com` and does not match
    /// `google.com` itself.
    Wildcard(String),
}

impl InterceptRule {
    /// Parses a rule from its textual form. Case is normalized.
    ///
    /// Blank patterns and a wildcard with nothing after `*.` are rejected.
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();
        let rule = match pattern.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => Self::Wildcard(suffix.to_string()),
            _ => Self::Exact(pattern),
        };

        match &rule {
            Self::Exact(name) if name.is_empty() => {
                Err(ProxyError::Config("empty intercept domain".to_string()))
            }
            Self::Wildcard(suffix) if suffix.len() < 2 => Err(ProxyError::Config(
                "intercept wildcard has no domain after \"*.\"".to_string(),
            )),
            _ => Ok(rule),
        }
    }

    /// Checks if a lowercase hostname matches this rule.
    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(name) => host == name,
            Self::Wildcard(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }
}

impl fmt::Display for InterceptRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Wildcard(suffix) => write!(f, "*{}", suffix),
        }
    }
}

/// Immutable set of intercept rules, parsed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptRules {
    rules: Vec<InterceptRule>,
}

impl InterceptRules {
    /// Parses a list of exact hostnames and `*.` wildcards.
    pub fn parse<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .map(|p| InterceptRule::parse(p.as_ref()))
            .collect::<Result<_>>()?;
        Ok(Self { rules })
    }

    /// Checks if connections to `host` should be intercepted.
    ///
    /// # Examples
    ///
    /// ```
    /// use aistudio_proxy::InterceptRules;
    ///
    /// let rules = InterceptRules::parse(["*.google.com", "example.org"]).unwrap();
    /// assert!(rules.should_intercept("aistudio.google.com"));
    /// assert!(rules.should_intercept("example.org"));
    /// assert!(!rules.should_intercept("google.com"));
    /// assert!(!rules.should_intercept("github.com"));
    /// ```
    pub fn should_intercept(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.rules.iter().any(|rule| rule.matches(&host))
    }

    /// Returns the parsed rules.
    pub fn rules(&self) -> &[InterceptRule] {
        &self.rules
    }

    /// Returns true if nothing is intercepted.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
