//! Identifier files and job matching.
//!
//! An identifier file holds one identifier per line. Lines carrying one or
//! more hex-address tokens contribute those tokens to the address set; any
//! other non-comment line contributes itself, trimmed, to the pattern set.
//! Jobs match on address membership (case-insensitive) or name substring
//! containment (case-sensitive). Duplicates are counted, never fatal.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::Job;

const COMMENT_MARKER: char = '#';

fn address_regex() -> &'static Regex {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    ADDRESS.get_or_init(|| {
        // 32-byte feed ids first, then 20-byte contract addresses.
        Regex::new(r"\b0x(?:[0-9a-fA-F]{64}|[0-9a-fA-F]{40})\b").expect("valid address pattern")
    })
}

/// All hex-address tokens in `text`, lower-cased, in order of appearance.
pub fn address_tokens(text: &str) -> Vec<String> {
    address_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// First hex-address token in `text`, lower-cased.
pub fn first_address(text: &str) -> Option<String> {
    address_regex()
        .find(text)
        .map(|m| m.as_str().to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Duplicate {
    pub identifier: String,
    pub count: usize,
}

/// Classified identifiers derived from a line-oriented input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierSet {
    addresses: Vec<String>,
    patterns: Vec<String>,
    counts: BTreeMap<String, usize>,
    line_count: usize,
    diagnostics: Vec<String>,
}

impl IdentifierSet {
    pub fn parse(text: &str) -> Self {
        let mut set = IdentifierSet::default();
        for (idx, raw) in text.lines().enumerate() {
            set.line_count += 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(COMMENT_MARKER) {
                continue;
            }
            let tokens = address_tokens(line);
            if tokens.is_empty() {
                if line.contains("0x") {
                    set.diagnostics.push(format!(
                        "line {}: '0x' present but no 40- or 64-digit hex address, treated as a name pattern",
                        idx + 1
                    ));
                }
                set.insert_pattern(line.to_string());
            } else {
                for token in tokens {
                    set.insert_address(token);
                }
            }
        }
        set
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Validation(format!("cannot read identifier file {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&text))
    }

    fn insert_address(&mut self, address: String) {
        let count = self.counts.entry(address.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.addresses.push(address);
        }
    }

    fn insert_pattern(&mut self, pattern: String) {
        let count = self.counts.entry(pattern.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.patterns.push(pattern);
        }
    }

    /// Adds a free-text pattern given outside the file (e.g. `--name` on the command line).
    pub fn add_pattern(&mut self, pattern: &str) {
        let pattern = pattern.trim();
        if !pattern.is_empty() {
            self.insert_pattern(pattern.to_string());
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.patterns.is_empty()
    }

    /// One entry per distinct identifier that occurred more than once.
    pub fn duplicates(&self) -> Vec<Duplicate> {
        self.counts
            .iter()
            .filter(|(_, &count)| count > 1)
            .map(|(identifier, &count)| Duplicate {
                identifier: identifier.clone(),
                count,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Address,
    Pattern,
    JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedJob {
    pub job: Job,
    /// The identifier that claimed this job.
    pub identifier: String,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    pub matched: Vec<MatchedJob>,
    pub unmatched: Vec<String>,
    pub duplicates: Vec<Duplicate>,
}

impl MatchResult {
    /// Folds `other` into `self`, keeping each job once.
    pub fn merge(&mut self, other: MatchResult) {
        let seen: HashSet<String> = self.matched.iter().map(|m| m.job.id.clone()).collect();
        self.matched
            .extend(other.matched.into_iter().filter(|m| !seen.contains(&m.job.id)));
        self.unmatched.extend(other.unmatched);
        self.duplicates.extend(other.duplicates);
        self.matched.sort_by(|a, b| a.job.name.cmp(&b.job.name));
    }
}

/// Applies `set` to `jobs`. Address membership is checked before patterns;
/// the first identifier that matches a job claims it.
pub fn match_jobs(jobs: &[Job], set: &IdentifierSet) -> MatchResult {
    let addresses: HashSet<&str> = set.addresses.iter().map(String::as_str).collect();
    let mut satisfied: HashSet<&str> = HashSet::new();
    let mut seen_jobs: HashSet<&str> = HashSet::new();
    let mut matched = Vec::new();

    for job in jobs {
        if !seen_jobs.insert(job.id.as_str()) {
            continue;
        }
        let by_address = job
            .address
            .as_deref()
            .map(str::to_lowercase)
            .and_then(|a| addresses.get(a.as_str()).copied());

        let claim = match by_address {
            Some(address) => Some((address, MatchReason::Address)),
            None => set
                .patterns
                .iter()
                .find(|p| job.name.contains(p.as_str()))
                .map(|p| (p.as_str(), MatchReason::Pattern)),
        };

        if let Some((identifier, reason)) = claim {
            satisfied.insert(identifier);
            matched.push(MatchedJob {
                job: job.clone(),
                identifier: identifier.to_string(),
                reason,
            });
        }
    }

    matched.sort_by(|a, b| a.job.name.cmp(&b.job.name));

    let mut unmatched: Vec<String> = set
        .addresses
        .iter()
        .chain(set.patterns.iter())
        .filter(|id| !satisfied.contains(id.as_str()))
        .cloned()
        .collect();
    unmatched.sort();

    MatchResult {
        matched,
        unmatched,
        duplicates: set.duplicates(),
    }
}

/// Exact job-id lookup, bypassing identifier classification.
pub fn match_job_id(jobs: &[Job], job_id: &str) -> Result<MatchResult> {
    let job_id = job_id.trim();
    if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(format!("job id must be numeric, got '{job_id}'")));
    }
    let result = match jobs.iter().find(|j| j.id == job_id) {
        Some(job) => MatchResult {
            matched: vec![MatchedJob {
                job: job.clone(),
                identifier: job_id.to_string(),
                reason: MatchReason::JobId,
            }],
            ..Default::default()
        },
        None => MatchResult {
            unmatched: vec![job_id.to_string()],
            ..Default::default()
        },
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;

    const FEED_A: &str = "0x000359843a543ee2fe414dc14c7e7920ef10f4372990b79d6361cdc0dd1ba782";
    const FEED_B: &str = "0x0003c317fec7fad514c67aacc6366bf2f007ce37100e3cddcacd0ccaa1f3746d";

    fn job(id: &str, name: &str) -> Job {
        Job {
            id: id.into(),
            name: name.into(),
            status: JobStatus::Approved,
            address: first_address(name),
            spec_id: Some(format!("{id}0")),
            latest_spec_status: None,
            pending_update: false,
            manager: None,
        }
    }

    #[test]
    fn classifies_addresses_and_patterns() {
        let text = format!(
            "# comment\n\n{FEED_A}\nBTC/USD {FEED_B} verifier\ncron-capabilities\n   \n"
        );
        let set = IdentifierSet::parse(&text);
        assert_eq!(set.addresses(), &[FEED_A.to_string(), FEED_B.to_string()]);
        assert_eq!(set.patterns(), &["cron-capabilities".to_string()]);
        assert_eq!(set.line_count(), 6);
        assert!(set.duplicates().is_empty());
    }

    #[test]
    fn addresses_are_case_insensitive_and_deduplicated() {
        let upper = FEED_A.to_uppercase().replacen("0X", "0x", 1);
        let text = format!("{FEED_A}\n{upper}\n{FEED_A}\n");
        let set = IdentifierSet::parse(&text);
        assert_eq!(set.addresses().len(), 1);
        assert_eq!(
            set.duplicates(),
            vec![Duplicate {
                identifier: FEED_A.to_string(),
                count: 3
            }]
        );
    }

    #[test]
    fn duplicate_reported_once_per_value() {
        let set = IdentifierSet::parse("alpha\nalpha\nalpha\nbeta\nbeta\ngamma\n");
        let dups = set.duplicates();
        assert_eq!(dups.len(), 2);
        assert_eq!(dups[0].identifier, "alpha");
        assert_eq!(dups[0].count, 3);
        assert_eq!(dups[1].identifier, "beta");
        assert_eq!(dups[1].count, 2);
    }

    #[test]
    fn short_hex_becomes_pattern_with_diagnostic() {
        let set = IdentifierSet::parse("0xdeadbeef\n");
        assert!(set.addresses().is_empty());
        assert_eq!(set.patterns(), &["0xdeadbeef".to_string()]);
        assert_eq!(set.diagnostics().len(), 1);
    }

    #[test]
    fn address_match_and_pattern_match() {
        let jobs = vec![
            job("1", &format!("ETH/USD | {FEED_A}")),
            job("2", "cron-capabilities-v2"),
            job("3", "other-job"),
        ];
        let mut set = IdentifierSet::parse(&format!("{FEED_A}\n"));
        set.add_pattern("cron-capabilities");
        set.add_pattern("missing-pattern");

        let result = match_jobs(&jobs, &set);
        let ids: Vec<&str> = result.matched.iter().map(|m| m.job.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(result.matched[0].reason, MatchReason::Address);
        assert_eq!(result.matched[1].reason, MatchReason::Pattern);
        assert_eq!(result.unmatched, vec!["missing-pattern".to_string()]);
    }

    #[test]
    fn pattern_matching_is_case_sensitive() {
        let jobs = vec![job("1", "Cron-Capabilities")];
        let set = IdentifierSet::parse("cron-capabilities\n");
        let result = match_jobs(&jobs, &set);
        assert!(result.matched.is_empty());
        assert_eq!(result.unmatched, vec!["cron-capabilities".to_string()]);
    }

    #[test]
    fn job_is_reported_once_even_if_many_identifiers_match() {
        let jobs = vec![job("1", &format!("cron-feed {FEED_A}"))];
        let set = IdentifierSet::parse(&format!("{FEED_A}\ncron\ncron-feed\n"));
        let result = match_jobs(&jobs, &set);
        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].identifier, FEED_A);
        // the patterns were never responsible for a match
        assert_eq!(result.unmatched, vec!["cron".to_string(), "cron-feed".to_string()]);
    }

    #[test]
    fn every_match_is_justified_and_identifiers_are_partitioned() {
        let jobs = vec![
            job("1", &format!("a {FEED_A}")),
            job("2", &format!("b {FEED_B}")),
            job("3", "stream-x"),
            job("4", "stream-y"),
            job("5", "unrelated"),
        ];
        let set = IdentifierSet::parse(&format!("{FEED_B}\nstream\nnope\n{FEED_B}\n"));
        let result = match_jobs(&jobs, &set);

        for m in &result.matched {
            let by_address = m
                .job
                .address
                .as_ref()
                .is_some_and(|a| set.addresses().contains(a));
            let by_pattern = set.patterns().iter().any(|p| m.job.name.contains(p.as_str()));
            assert!(by_address || by_pattern);
        }
        let satisfied: HashSet<&str> =
            result.matched.iter().map(|m| m.identifier.as_str()).collect();
        for id in &result.unmatched {
            assert!(!satisfied.contains(id.as_str()));
        }
        assert_eq!(result.unmatched, vec!["nope".to_string()]);
        assert_eq!(result.duplicates.len(), 1);
    }

    #[test]
    fn job_id_path() {
        let jobs = vec![job("5", "a"), job("6", "b")];
        let found = match_job_id(&jobs, "6").unwrap();
        assert_eq!(found.matched[0].job.name, "b");
        let missing = match_job_id(&jobs, "7").unwrap();
        assert_eq!(missing.unmatched, vec!["7".to_string()]);
        assert!(matches!(match_job_id(&jobs, "abc"), Err(Error::Validation(_))));
    }
}
