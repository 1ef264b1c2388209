//! Duplicate detection and minimal quality checks for extracted candidates.
//!
//! A candidate already present in the known-key set is a [`Verdict::DuplicateSkip`],
//! which is an expected steady-state outcome and not a failure. A candidate that is new
//! but fails a quality rule is a [`Verdict::ValidationReject`] and counts as a failure.

use std::collections::HashSet;
use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::config::Config;
use crate::models::{ArticleKey, Candidate, NewArticle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    ContentTooShort { chars: usize, min: usize },
    ErrorPageTitle(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentTooShort { chars, min } => {
                write!(f, "content has {chars} characters, minimum is {min}")
            }
            Self::ErrorPageTitle(title) => write!(f, "title looks like an error page: {title}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept(NewArticle),
    DuplicateSkip(ArticleKey),
    ValidationReject(RejectReason),
}

#[derive(Debug, Clone)]
pub struct Validator {
    min_content_chars: usize,
    error_titles: Vec<Regex>,
}

impl Validator {
    pub fn new(min_content_chars: usize, error_title_patterns: &[String]) -> Result<Self, regex::Error> {
        let error_titles = error_title_patterns
            .iter()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            min_content_chars,
            error_titles,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, regex::Error> {
        Self::new(config.min_content_chars, &config.error_title_patterns)
    }

    /// Classify `candidate` against the keys already stored.
    pub fn check(&self, candidate: Candidate, existing_keys: &HashSet<ArticleKey>) -> Verdict {
        let key = ArticleKey::derive(&candidate.title, candidate.date);
        if existing_keys.contains(&key) {
            return Verdict::DuplicateSkip(key);
        }

        if let Some(pattern) = self.error_titles.iter().find(|re| re.is_match(&candidate.title)) {
            tracing::debug!(title = %candidate.title, pattern = %pattern, "Rejected error-page title");
            return Verdict::ValidationReject(RejectReason::ErrorPageTitle(candidate.title));
        }

        let chars = candidate.content.trim().chars().count();
        if chars < self.min_content_chars {
            return Verdict::ValidationReject(RejectReason::ContentTooShort {
                chars,
                min: self.min_content_chars,
            });
        }

        Verdict::Accept(NewArticle::from_candidate(key, candidate))
    }
}
