//! Banned-term filter
//!
//! Terms are compiled once per guild policy revision into regexes that run
//! over normalized text. Each run of `k` identical chars in a term becomes
//! `c{k,}`, so stretched spellings still match while distinct words that only
//! differ by a doubled letter do not.

pub mod normalize;
pub mod prebuilt;

use crate::moderation::{ConfigError, TenantPolicy};
use dashmap::DashMap;
use normalize::{DEFAULT_REPEAT_THRESHOLD, normalize};
use poise::serenity_prelude::GuildId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifies which list a match came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilterId {
    /// The guild's own term list
    Server,
    /// A built-in list, by id
    Prebuilt(String),
}

impl FilterId {
    /// Name shown in audit records
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::Server => "Server Filter".to_string(),
            Self::Prebuilt(id) => prebuilt::display_name(id),
        }
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Prebuilt(id) => write!(f, "{id}"),
        }
    }
}

/// Result of running the filter over one text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResponse {
    /// Whether anything matched
    pub censor: bool,
    /// Lists that matched, in order of first match
    pub filters: Vec<FilterId>,
    /// Non-overlapping, sorted byte ranges into the original text
    pub ranges: Vec<Range<usize>>,
}

#[derive(Debug)]
struct CompiledTerm {
    filter: FilterId,
    regex: Regex,
}

/// A guild's terms compiled for one policy revision
#[derive(Debug)]
pub struct CompiledFilter {
    revision: u64,
    repeat_threshold: usize,
    terms: Vec<CompiledTerm>,
    allowed: Vec<Regex>,
}

/// Build the pattern for a term, or `None` when nothing is left after normalization
fn term_pattern(term: &str, repeat_threshold: usize, whole_word: bool) -> Option<String> {
    let normalized = normalize(term, repeat_threshold);
    let chars: Vec<char> = normalized.as_str().chars().collect();
    if chars.is_empty() {
        return None;
    }

    let mut pattern = String::new();
    if whole_word {
        pattern.push_str(r"\b");
    }
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        pattern.push_str(&regex::escape(&c.to_string()));
        if run == 1 {
            pattern.push('+');
        } else {
            pattern.push_str(&format!("{{{run},}}"));
        }
        i += run;
    }
    if whole_word {
        pattern.push_str(r"\b");
    }
    Some(pattern)
}

impl CompiledFilter {
    /// Compile the custom, built-in and allowed terms of a policy
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if a term produces an unusable pattern
    pub fn compile(policy: &TenantPolicy, default_repeat: usize) -> Result<Self, ConfigError> {
        let repeat_threshold = policy.repeat_threshold.unwrap_or(default_repeat).max(2);
        let compile = |term: &str, whole_word: bool| -> Result<Option<Regex>, ConfigError> {
            term_pattern(term, repeat_threshold, whole_word)
                .map(|pattern| {
                    Regex::new(&pattern).map_err(|e| {
                        ConfigError::Invalid(format!("term {term:?} cannot be compiled: {e}"))
                    })
                })
                .transpose()
        };

        let mut terms = Vec::new();
        for term in &policy.custom_terms {
            if let Some(regex) = compile(term, false)? {
                terms.push(CompiledTerm {
                    filter: FilterId::Server,
                    regex,
                });
            }
        }
        for id in &policy.prebuilt_filters {
            let Some(list) = prebuilt::get(id) else {
                warn!(filter = %id, "Policy references unknown pre-built filter");
                continue;
            };
            for entry in &list.terms {
                if let Some(regex) = compile(&entry.term, entry.word)? {
                    terms.push(CompiledTerm {
                        filter: FilterId::Prebuilt(list.id.clone()),
                        regex,
                    });
                }
            }
        }

        let mut allowed = Vec::new();
        for term in &policy.allowed_terms {
            if let Some(regex) = compile(term, true)? {
                allowed.push(regex);
            }
        }

        Ok(Self {
            revision: policy.revision,
            repeat_threshold,
            terms,
            allowed,
        })
    }

    /// Policy revision these terms were compiled from
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Run every term over `text`
    #[must_use]
    pub fn test(&self, text: &str) -> FilterResponse {
        if self.terms.is_empty() || text.is_empty() {
            return FilterResponse::default();
        }

        let normalized = normalize(text, self.repeat_threshold);
        let haystack = normalized.as_str();

        let allowed: Vec<Range<usize>> = self
            .allowed
            .iter()
            .flat_map(|regex| regex.find_iter(haystack).map(|m| m.range()))
            .collect();

        let mut candidates: Vec<(Range<usize>, &FilterId)> = self
            .terms
            .iter()
            .flat_map(|term| {
                term.regex
                    .find_iter(haystack)
                    .map(move |m| (m.range(), &term.filter))
            })
            .filter(|(range, _)| {
                !allowed
                    .iter()
                    .any(|a| a.start <= range.start && range.end <= a.end)
            })
            .collect();

        candidates.sort_by_key(|(range, _)| (range.start, Reverse(range.end)));

        let mut response = FilterResponse::default();
        let mut covered_until = 0;
        for (range, filter) in candidates {
            // Overlapped matches still name their list
            if !response.filters.contains(filter) {
                response.filters.push(filter.clone());
            }
            if range.start < covered_until {
                continue;
            }
            covered_until = range.end;
            if let Some(original) = normalized.original_range(range) {
                response.ranges.push(original);
            }
        }
        response.censor = !response.filters.is_empty();

        if response.censor {
            debug!(
                matches = response.ranges.len(),
                filters = ?response.filters,
                "Filter matched"
            );
        }
        response
    }
}

/// The pattern filter with a per-guild cache of compiled terms
#[derive(Debug, Clone)]
pub struct PatternFilter {
    compiled: Arc<DashMap<GuildId, Arc<CompiledFilter>>>,
    default_repeat: usize,
}

impl Default for PatternFilter {
    fn default() -> Self {
        Self::new(DEFAULT_REPEAT_THRESHOLD)
    }
}

impl PatternFilter {
    /// Create a filter using `default_repeat` for policies that do not set one
    #[must_use]
    pub fn new(default_repeat: usize) -> Self {
        Self {
            compiled: Arc::new(DashMap::new()),
            default_repeat,
        }
    }

    /// Compiled terms for a policy, rebuilt when the revision changed
    fn compiled_for(&self, policy: &TenantPolicy) -> Option<Arc<CompiledFilter>> {
        if let Some(cached) = self.compiled.get(&policy.guild_id) {
            if cached.revision() == policy.revision {
                return Some(Arc::clone(cached.value()));
            }
        }

        match CompiledFilter::compile(policy, self.default_repeat) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                self.compiled.insert(policy.guild_id, Arc::clone(&compiled));
                Some(compiled)
            }
            Err(e) => {
                warn!(guild_id = %policy.guild_id, error = %e, "Failed to compile guild filter");
                None
            }
        }
    }

    /// Test `text` against the guild's terms
    #[must_use]
    pub fn test(&self, text: &str, policy: &TenantPolicy) -> FilterResponse {
        self.compiled_for(policy)
            .map(|compiled| compiled.test(text))
            .unwrap_or_default()
    }

    /// Drop the cached terms of a guild
    pub fn invalidate(&self, guild_id: GuildId) {
        self.compiled.remove(&guild_id);
    }

    /// Wrap every range of `text` in `marker`, merging overlapping or adjacent ranges
    ///
    /// Ranges that are out of bounds or do not fall on char boundaries are skipped.
    #[must_use]
    pub fn surround(text: &str, ranges: &[Range<usize>], marker: &str) -> String {
        let mut sorted: Vec<Range<usize>> = ranges
            .iter()
            .filter(|r| {
                r.start < r.end
                    && r.end <= text.len()
                    && text.is_char_boundary(r.start)
                    && text.is_char_boundary(r.end)
            })
            .cloned()
            .collect();
        sorted.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<usize>> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }

        let mut out = String::with_capacity(text.len() + merged.len() * marker.len() * 2);
        let mut cursor = 0;
        for range in merged {
            out.push_str(&text[cursor..range.start]);
            out.push_str(marker);
            out.push_str(&text[range.clone()]);
            out.push_str(marker);
            cursor = range.end;
        }
        out.push_str(&text[cursor..]);
        out
    }
}
