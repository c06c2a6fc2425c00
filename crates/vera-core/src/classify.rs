//! Derived dimensions of a tool call: the primary URL's domain, the
//! canonicalized query family, the source class, and the move type relative
//! to the previous move. These feed the move/query ledgers and every policy
//! gate that watches for semantic repetition.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

/// Coarse taxonomy of a URL's authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceClass {
    Official,
    Regulatory,
    Registry,
    PrimaryLiterature,
    Commentary,
    Unknown,
}

impl SourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceClass::Official => "official",
            SourceClass::Regulatory => "regulatory",
            SourceClass::Registry => "registry",
            SourceClass::PrimaryLiterature => "primary_literature",
            SourceClass::Commentary => "commentary",
            SourceClass::Unknown => "unknown",
        }
    }
}

/// How a tool call relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    Initial,
    Retry,
    Reformulate,
    SameDomain,
    SourceShift,
    DomainShift,
    NonSearch,
}

impl MoveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveType::Initial => "initial",
            MoveType::Retry => "retry",
            MoveType::Reformulate => "reformulate",
            MoveType::SameDomain => "same_domain",
            MoveType::SourceShift => "source_shift",
            MoveType::DomainShift => "domain_shift",
            MoveType::NonSearch => "non_search",
        }
    }
}

pub fn normalize_domain(domain: &str) -> String {
    let d = domain.to_lowercase();
    d.strip_prefix("www.").unwrap_or(&d).to_string()
}

pub fn extract_urls(text: &str) -> Vec<String> {
    let re = Regex::new(r#"https?://[^\s"'<>]+"#).expect("url regex");
    re.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

pub fn extract_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(normalize_domain(host))
}

const QUERY_KEYS: &[&str] = &["q", "query", "search", "s", "text", "keyword", "term"];
const PATH_MARKERS: &[&str] = &["/search/", "/query/", "/name/", "/compound/name/", "/wiki/"];

/// Pull the human query out of a URL: first from the well-known query
/// parameters, then from path markers like `/wiki/` or `/search/`.
pub fn extract_query_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    for key in QUERY_KEYS {
        for (k, v) in parsed.query_pairs() {
            if k == *key && !v.is_empty() {
                return Some(v.into_owned());
            }
        }
    }
    let path = urlencoding::decode(parsed.path()).ok()?.into_owned();
    for marker in PATH_MARKERS {
        if let Some(idx) = path.find(marker) {
            let tail = path[idx + marker.len()..].trim_matches('/');
            if !tail.is_empty() && tail.len() < 120 {
                return Some(tail.replace('_', " "));
            }
        }
    }
    None
}

const QUERY_STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "for", "and", "to", "in", "on", "with", "by", "from",
];

/// Canonical query family: percent-decoded, lowercased, alphanumeric tokens
/// with stop-words dropped, sorted so reorderings of the same keywords land
/// in one family.
pub fn normalize_query(q: &str) -> String {
    let decoded = urlencoding::decode(q).map(|c| c.into_owned()).unwrap_or_else(|_| q.to_string());
    let lower = decoded.to_lowercase();
    let re = Regex::new(r"[a-z0-9]+").expect("token regex");
    let mut tokens: Vec<&str> = re
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| !QUERY_STOP_WORDS.contains(t))
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

const SEARCH_DOMAIN_SUFFIXES: &[&str] = &[
    "google.com",
    "bing.com",
    "duckduckgo.com",
    "search.brave.com",
    "yahoo.com",
];

/// Search engines do not count as independent sources.
pub fn is_search_domain(domain: &str) -> bool {
    let d = normalize_domain(domain);
    SEARCH_DOMAIN_SUFFIXES.iter().any(|s| d.ends_with(s))
}

const TASK_STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "for", "and", "to", "in", "on", "with", "by", "from",
    "official", "launch", "released", "release", "version", "report", "true",
    "false", "yet", "still", "actually", "already",
];

/// Tokens from the task wording used to recognize first-party domains.
pub fn task_domain_tokens(task: &str) -> HashSet<String> {
    let re = Regex::new(r"[A-Za-z0-9]{3,}").expect("task token regex");
    re.find_iter(task)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| !TASK_STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Does the task wording indicate a non-existence / non-occurrence answer?
/// Negative-claim tasks get stricter source-diversity minima.
pub fn is_negative_claim_task(task: &str) -> bool {
    let t = task.to_lowercase();
    let negation = Regex::new(r"\b(not|no|never|false|yet|still|actually|really)\b").expect("negation regex");
    let launch = Regex::new(r"\b(has\s+.*\s+launched|released)\b").expect("launch regex");
    let is_out = Regex::new(r"\b(is|are)\s+.*\b(out|launched|released)\b").expect("is-out regex");
    negation.is_match(&t) || launch.is_match(&t) || is_out.is_match(&t)
}

/// Classifier context that evolves over a task: tokens from the task wording
/// plus domains promoted into the official-hint set along the way.
#[derive(Debug, Clone, Default)]
pub struct DomainLens {
    pub task_tokens: HashSet<String>,
    pub official_hints: HashSet<String>,
}

impl DomainLens {
    pub fn new(task: &str) -> Self {
        Self {
            task_tokens: task_domain_tokens(task),
            official_hints: HashSet::new(),
        }
    }

    pub fn is_official(&self, domain: &str) -> bool {
        let d = normalize_domain(domain);
        if self.official_hints.contains(&d) {
            return true;
        }
        if d.ends_with(".gov") || d.ends_with(".int") || d.ends_with(".eu") {
            return true;
        }
        self.task_tokens.iter().any(|tok| !tok.is_empty() && d.contains(tok))
    }

    /// First-party signals (hints, task tokens) classify as Official;
    /// government TLDs as Regulatory. `is_official` deliberately covers
    /// both for the negative-claim domain tallies.
    pub fn classify_source(&self, url: Option<&str>, domain: Option<&str>) -> SourceClass {
        let Some(domain) = domain else {
            return SourceClass::Unknown;
        };
        let d = normalize_domain(domain);
        let first_party = self.official_hints.contains(&d)
            || self.task_tokens.iter().any(|tok| !tok.is_empty() && d.contains(tok));
        if first_party {
            return SourceClass::Official;
        }
        if d.ends_with(".gov") || d.ends_with(".eu") || d.ends_with(".int") {
            return SourceClass::Regulatory;
        }
        if ["pubchem", "chemspider", "drugbank", "clinicaltrials", "who.int"]
            .iter()
            .any(|k| d.contains(k))
        {
            return SourceClass::Registry;
        }
        if ["ncbi.nlm.nih.gov", "nih.gov", "pubmed", "pmc"].iter().any(|k| d.contains(k)) {
            return SourceClass::PrimaryLiterature;
        }
        if ["arxiv.org", "biorxiv.org", "medrxiv.org", "doi.org"].iter().any(|k| d.contains(k)) {
            return SourceClass::PrimaryLiterature;
        }
        if ["wikipedia.org", "stackexchange.com", "reddit.com"].iter().any(|k| d.contains(k)) {
            return SourceClass::Commentary;
        }
        if let Some(u) = url {
            let pdf = Regex::new(r"(?i)\.pdf(\?|$)").expect("pdf regex");
            if pdf.is_match(u) {
                return SourceClass::PrimaryLiterature;
            }
        }
        SourceClass::Commentary
    }
}

/// The previous move's dimensions, as tracked by the policy engine. Each
/// field only advances when the corresponding dimension was present on a
/// move, so a URL-less command does not erase the comparison baseline.
#[derive(Debug, Clone, Default)]
pub struct MoveContext {
    pub last_domain: Option<String>,
    pub last_query_family: Option<String>,
    pub last_source_class: Option<SourceClass>,
}

pub fn classify_move(
    ctx: &MoveContext,
    domain: Option<&str>,
    query_family: Option<&str>,
    source_class: SourceClass,
) -> MoveType {
    if domain.is_none() && query_family.is_none() {
        return MoveType::NonSearch;
    }
    let Some(last_domain) = ctx.last_domain.as_deref() else {
        return MoveType::Initial;
    };
    if domain == Some(last_domain) {
        if let Some(qf) = query_family {
            if Some(qf) == ctx.last_query_family.as_deref() {
                return MoveType::Retry;
            }
            return MoveType::Reformulate;
        }
        return MoveType::SameDomain;
    }
    if let Some(last_sc) = ctx.last_source_class {
        if source_class != last_sc {
            return MoveType::SourceShift;
        }
    }
    MoveType::DomainShift
}

pub fn move_sig(move_type: MoveType, domain: Option<&str>, query_family: Option<&str>) -> String {
    format!(
        "{}:{}:{}",
        move_type.as_str(),
        domain.unwrap_or("-"),
        query_family.unwrap_or("-"),
    )
}
