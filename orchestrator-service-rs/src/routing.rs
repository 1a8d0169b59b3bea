// orchestrator-service-rs/src/routing.rs
//
// Rule-based request classification.
//
// A routing table is an ordered list of rules, each a set of matchers and a
// fixed worker sequence. The first rule with a matching matcher wins; the
// first worker of its sequence is the primary worker and the rest run as
// follow-up steps. Classification is a pure function of the table and the
// request text.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::worker::{WorkerError, WorkerRegistry};

/// Default share of a phrase's trigrams that must appear in the request.
pub const DEFAULT_SIMILARITY: f64 = 0.6;

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Any of the words or phrases, on word boundaries, case-insensitive
    Keywords(Regex),
    Pattern(Regex),
    /// Any phrase whose trigrams are mostly contained in the request
    Trigram { phrases: Vec<String>, threshold: f64 },
}

impl Matcher {
    pub fn keywords<I, S>(words: I) -> Result<Self, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alternatives: Vec<String> = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .map(|w| regex::escape(&w).replace(' ', r"\s+"))
            .collect();
        if alternatives.is_empty() {
            return Err(WorkerError::InvalidRule {
                rule: "keywords".to_string(),
                reason: "keyword list is empty".to_string(),
            });
        }
        let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
        Regex::new(&pattern)
            .map(Matcher::Keywords)
            .map_err(|e| WorkerError::InvalidRule {
                rule: "keywords".to_string(),
                reason: e.to_string(),
            })
    }

    pub fn regex(pattern: &str) -> Result<Self, WorkerError> {
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|e| WorkerError::InvalidRule {
                rule: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn trigram<I, S>(phrases: I, threshold: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Trigram {
            phrases: phrases.into_iter().map(Into::into).collect(),
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Keywords(re) | Matcher::Pattern(re) => re.is_match(text),
            Matcher::Trigram { phrases, threshold } => phrases
                .iter()
                .any(|phrase| trigram_similarity(phrase, text) >= *threshold),
        }
    }
}

// Per-word trigrams, each word padded with two leading spaces and one
// trailing space.
fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        set.extend(padded.windows(3).map(|w| [w[0], w[1], w[2]]));
    }
    set
}

/// Fraction of `phrase`'s trigrams that also occur in `text` (0.0 - 1.0).
///
/// Containment rather than symmetric similarity, so a short phrase can match
/// inside a long request.
pub fn trigram_similarity(phrase: &str, text: &str) -> f64 {
    let wanted = trigrams(phrase);
    if wanted.is_empty() {
        return 0.0;
    }
    let present = trigrams(text);
    let shared = wanted.intersection(&present).count();
    shared as f64 / wanted.len() as f64
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub matchers: Vec<Matcher>,
    /// Primary worker first, then follow-up steps in order
    pub workers: Vec<String>,
}

impl RoutingRule {
    pub fn new<I, S>(name: impl Into<String>, matchers: Vec<Matcher>, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            matchers,
            workers: workers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(text))
    }
}

/// Declarative form of a rule, as read from a routes file.
///
/// ```toml
/// [[rule]]
/// name = "schedule"
/// keywords = ["schedule", "calendar"]
/// workers = ["scheduler"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub phrases: Vec<String>,
    #[serde(default)]
    pub similarity: Option<f64>,
    pub workers: Vec<String>,
}

impl RuleSpec {
    pub fn compile(&self) -> Result<RoutingRule, WorkerError> {
        let mut matchers = Vec::new();
        if !self.keywords.is_empty() {
            matchers.push(Matcher::keywords(&self.keywords).map_err(|e| self.invalid(e))?);
        }
        for pattern in &self.patterns {
            matchers.push(Matcher::regex(pattern).map_err(|e| self.invalid(e))?);
        }
        if !self.phrases.is_empty() {
            matchers.push(Matcher::trigram(
                self.phrases.iter().cloned(),
                self.similarity.unwrap_or(DEFAULT_SIMILARITY),
            ));
        }
        if matchers.is_empty() {
            return Err(WorkerError::InvalidRule {
                rule: self.name.clone(),
                reason: "rule has no matchers".to_string(),
            });
        }
        Ok(RoutingRule::new(
            self.name.clone(),
            matchers,
            self.workers.iter().cloned(),
        ))
    }

    fn invalid(&self, err: WorkerError) -> WorkerError {
        match err {
            WorkerError::InvalidRule { reason, .. } => WorkerError::InvalidRule {
                rule: self.name.clone(),
                reason,
            },
            other => other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoutesFile {
    default_worker: String,
    #[serde(default)]
    rule: Vec<RuleSpec>,
}

/// Outcome of classifying one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    /// Matching rule, `None` when the default worker was chosen
    pub rule: Option<String>,
    pub workers: Vec<String>,
}

impl RouteDecision {
    pub fn is_default(&self) -> bool {
        self.rule.is_none()
    }

    pub fn label(&self) -> &str {
        self.rule.as_deref().unwrap_or("default")
    }
}

/// Ordered rule table. Read-only once built.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
    default_worker: String,
}

impl RoutingTable {
    pub fn new(default_worker: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_worker: default_worker.into(),
        }
    }

    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn from_specs(
        default_worker: impl Into<String>,
        specs: &[RuleSpec],
    ) -> Result<Self, WorkerError> {
        let mut table = Self::new(default_worker);
        for spec in specs {
            table.rules.push(spec.compile()?);
        }
        Ok(table)
    }

    /// Reads a TOML routes file with `default_worker` and `[[rule]]` entries
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::Load(format!("{}: {}", path.display(), e)))?;
        let file: RoutesFile = toml::from_str(&content)
            .map_err(|e| WorkerError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_specs(file.default_worker, &file.rule)
    }

    /// Rules used when no routes file is configured
    pub fn standard() -> Result<Self, WorkerError> {
        Self::from_specs("general", &standard_rules())
    }

    pub fn default_worker(&self) -> &str {
        &self.default_worker
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn classify(&self, request: &str) -> RouteDecision {
        match self.rules.iter().find(|rule| rule.matches(request)) {
            Some(rule) => RouteDecision {
                rule: Some(rule.name.clone()),
                workers: rule.workers.clone(),
            },
            None => RouteDecision {
                rule: None,
                workers: vec![self.default_worker.clone()],
            },
        }
    }

    /// Every rule needs at least one worker and every named worker must exist.
    pub fn validate(&self, registry: &WorkerRegistry) -> Result<(), WorkerError> {
        if !registry.contains(&self.default_worker) {
            return Err(WorkerError::UnknownWorker(self.default_worker.clone()));
        }
        for rule in &self.rules {
            if rule.workers.is_empty() {
                return Err(WorkerError::InvalidRule {
                    rule: rule.name.clone(),
                    reason: "no workers".to_string(),
                });
            }
            if let Some(missing) = rule.workers.iter().find(|w| !registry.contains(w)) {
                return Err(WorkerError::InvalidRule {
                    rule: rule.name.clone(),
                    reason: format!("unknown worker {}", missing),
                });
            }
        }
        Ok(())
    }
}

fn rule(name: &str, keywords: &[&str], workers: &[&str]) -> RuleSpec {
    RuleSpec {
        name: name.to_string(),
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        workers: workers.iter().map(|s| s.to_string()).collect(),
        ..RuleSpec::default()
    }
}

fn standard_rules() -> Vec<RuleSpec> {
    let mut research_workflow = rule("research_workflow", &[], &["researcher", "organizer", "scheduler"]);
    research_workflow.patterns = vec![r"(?i)\bresearch\b.*\b(?:plan|schedule)\b".to_string()];

    let mut code = rule(
        "code",
        &["code", "function", "bug", "compile", "refactor", "rust", "python"],
        &["coder"],
    );
    code.phrases = vec!["write a program".to_string(), "fix this script".to_string()];

    vec![
        research_workflow,
        rule("video", &["video", "clip", "trim", "footage"], &["video_editor"]),
        code,
        rule(
            "schedule",
            &["schedule", "calendar", "remind me", "meeting", "deadline", "appointment"],
            &["scheduler"],
        ),
        rule(
            "research",
            &["research", "look up", "find out", "investigate", "compare"],
            &["researcher"],
        ),
        rule(
            "organize",
            &["organize", "summarize", "notes", "outline", "tidy"],
            &["organizer"],
        ),
    ]
}

/// Worker names the standard table refers to
pub const STANDARD_WORKERS: &[&str] = &[
    "general",
    "researcher",
    "organizer",
    "scheduler",
    "coder",
    "video_editor",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_respect_word_boundaries() {
        let matcher = Matcher::keywords(["code", "remind me"]).unwrap();
        assert!(matcher.matches("Can you CODE this?"));
        assert!(matcher.matches("please remind   me tomorrow"));
        assert!(!matcher.matches("what is the zip codec"));
        assert!(!matcher.matches("barcode scanner"));
    }

    #[test]
    fn test_keywords_escape_metacharacters() {
        let matcher = Matcher::keywords(["a.b"]).unwrap();
        assert!(matcher.matches("see a.b now"));
        assert!(!matcher.matches("see axb now"));
        assert!(Matcher::keywords(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_trigram_similarity() {
        assert_eq!(trigram_similarity("write a program", "write a program"), 1.0);
        assert!(trigram_similarity("write a program", "could you write me a small program") > 0.6);
        assert!(trigram_similarity("write a program", "book a table for two") < 0.3);
        assert_eq!(trigram_similarity("", "anything"), 0.0);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let table = RoutingTable::standard().unwrap();

        let decision = table.classify("research flights to Lisbon and schedule the trip");
        assert_eq!(decision.rule.as_deref(), Some("research_workflow"));
        assert_eq!(decision.workers, vec!["researcher", "organizer", "scheduler"]);

        let decision = table.classify("Schedule a meeting with Ana on Friday");
        assert_eq!(decision.rule.as_deref(), Some("schedule"));
        assert_eq!(decision.workers, vec!["scheduler"]);

        let decision = table.classify("could you write me a small program for invoices");
        assert_eq!(decision.rule.as_deref(), Some("code"));
    }

    #[test]
    fn test_unmatched_request_goes_to_default() {
        let table = RoutingTable::standard().unwrap();
        let decision = table.classify("tell me a joke");
        assert!(decision.is_default());
        assert_eq!(decision.label(), "default");
        assert_eq!(decision.workers, vec!["general"]);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let table = RoutingTable::standard().unwrap();
        let request = "summarize my notes from the offsite";
        assert_eq!(table.classify(request), table.classify(request));
    }

    #[test]
    fn test_spec_without_matchers_is_rejected() {
        let spec = RuleSpec {
            name: "empty".to_string(),
            workers: vec!["general".to_string()],
            ..RuleSpec::default()
        };
        assert!(matches!(
            spec.compile(),
            Err(WorkerError::InvalidRule { rule, .. }) if rule == "empty"
        ));
    }

    #[test]
    fn test_bad_pattern_names_the_rule() {
        let spec = RuleSpec {
            name: "broken".to_string(),
            patterns: vec!["(unclosed".to_string()],
            workers: vec!["general".to_string()],
            ..RuleSpec::default()
        };
        assert!(matches!(
            spec.compile(),
            Err(WorkerError::InvalidRule { rule, .. }) if rule == "broken"
        ));
    }

    #[test]
    fn test_load_routes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.toml");
        std::fs::write(
            &path,
            r#"
default_worker = "general"

[[rule]]
name = "travel"
keywords = ["flight", "hotel"]
workers = ["researcher", "scheduler"]

[[rule]]
name = "poems"
phrases = ["write a poem"]
similarity = 0.8
workers = ["writer"]
"#,
        )
        .unwrap();

        let table = RoutingTable::load(&path).unwrap();
        assert_eq!(table.rules().len(), 2);
        assert_eq!(table.default_worker(), "general");
        assert_eq!(
            table.classify("find me a hotel in Porto").workers,
            vec!["researcher", "scheduler"]
        );
        assert_eq!(table.classify("please write a poem").rule.as_deref(), Some("poems"));
    }

    #[test]
    fn test_missing_routes_file_is_load_error() {
        let err = RoutingTable::load(Path::new("/nonexistent/routes.toml")).unwrap_err();
        assert!(matches!(err, WorkerError::Load(_)));
    }
}
