//! Query operator normalization.
//!
//! Parses the shared operator syntax (`site:`, `filetype:`, `intitle:`,
//! `"exact phrase"`, `-exclude`, `after:YYYY-MM-DD`) and re-renders a query
//! for a target engine using its declared templates. Operators the engine
//! does not support are dropped silently; the base query always survives.

use std::sync::Arc;

use crate::service::engine_registry::{EngineConfig, QueryOperator, RegistrySnapshot};

/// One parsed operator occurrence, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorToken {
    pub operator: QueryOperator,
    pub value: String,
}

/// A query split into its base text and operator occurrences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    pub base_query: String,
    pub operators: Vec<OperatorToken>,
}

impl ParsedQuery {
    pub fn values_for(&self, operator: QueryOperator) -> Vec<&str> {
        self.operators
            .iter()
            .filter(|t| t.operator == operator)
            .map(|t| t.value.as_str())
            .collect()
    }

    /// Operator multiset as (operator, value) pairs, order-insensitive.
    fn operator_set(&self) -> std::collections::BTreeSet<(QueryOperator, &str)> {
        self.operators
            .iter()
            .map(|t| (t.operator, t.value.as_str()))
            .collect()
    }

    pub fn same_operators(&self, other: &ParsedQuery) -> bool {
        self.operator_set() == other.operator_set()
    }
}

/// Tokenize a raw query. Unrecognized tokens join the base query; quoted
/// phrases become `exact` operators; multiple occurrences are preserved.
pub fn parse_query(query: &str) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();
    let mut base_terms: Vec<String> = Vec::new();

    for token in tokenize(query) {
        match token {
            RawToken::Quoted(phrase) => {
                if !phrase.is_empty() {
                    parsed.operators.push(OperatorToken {
                        operator: QueryOperator::Exact,
                        value: phrase,
                    });
                }
            }
            RawToken::Plain(word) => match classify(&word) {
                Some(op) => parsed.operators.push(op),
                None => base_terms.push(word),
            },
        }
    }

    parsed.base_query = base_terms.join(" ");
    parsed
}

enum RawToken {
    Plain(String),
    Quoted(String),
}

/// Whitespace tokenizer that keeps quoted phrases together.
fn tokenize(query: &str) -> Vec<RawToken> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();
    let mut current = String::new();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if !current.is_empty() {
                    tokens.push(RawToken::Plain(std::mem::take(&mut current)));
                }
                let mut phrase = String::new();
                for q in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                    phrase.push(q);
                }
                tokens.push(RawToken::Quoted(phrase.trim().to_string()));
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(RawToken::Plain(std::mem::take(&mut current)));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(RawToken::Plain(current));
    }
    tokens
}

fn classify(word: &str) -> Option<OperatorToken> {
    let prefixed = |prefix: &str| {
        word.strip_prefix(prefix)
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    };

    if let Some(value) = prefixed("site:") {
        return Some(OperatorToken {
            operator: QueryOperator::Site,
            value,
        });
    }
    if let Some(value) = prefixed("filetype:") {
        return Some(OperatorToken {
            operator: QueryOperator::Filetype,
            value,
        });
    }
    if let Some(value) = prefixed("intitle:") {
        return Some(OperatorToken {
            operator: QueryOperator::Intitle,
            value,
        });
    }
    if let Some(value) = prefixed("after:") {
        if is_iso_date(&value) {
            return Some(OperatorToken {
                operator: QueryOperator::DateAfter,
                value,
            });
        }
        return None;
    }
    if let Some(value) = word.strip_prefix('-') {
        // A lone dash or "-1.5" style numbers are query text, not exclusion.
        if !value.is_empty() && !value.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Some(OperatorToken {
                operator: QueryOperator::Exclude,
                value: value.to_string(),
            });
        }
    }
    None
}

fn is_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && s.chars()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

/// Render a parsed query for an engine. Pure and idempotent for a fixed
/// registry: supported operators are emitted through the engine's template,
/// unsupported ones vanish, the base query is always preserved.
pub fn render_for_engine(parsed: &ParsedQuery, engine: &EngineConfig) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !parsed.base_query.is_empty() {
        parts.push(parsed.base_query.clone());
    }

    for token in &parsed.operators {
        if let Some(template) = engine.operator_syntax.get(&token.operator) {
            parts.push(template.replace("{value}", &token.value));
        }
    }

    parts.join(" ")
}

/// Transform a raw query for a target engine; unknown engines leave the
/// query untouched (absent from the registry means "not available", not an
/// error).
pub fn transform_query_for_engine(
    query: &str,
    engine_name: &str,
    snapshot: &Arc<RegistrySnapshot>,
) -> String {
    match snapshot.get(engine_name) {
        Some(engine) => render_for_engine(&parse_query(query), &engine),
        None => query.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::engine_registry::EngineRegistry;
    use std::io::Write;

    const ENGINES: &str = r#"
engines:
  google:
    base_url: "https://www.google.com/search"
    weight: 1.0
    qps: 0.05
    operators:
      site: "site:{value}"
      filetype: "filetype:{value}"
      intitle: "intitle:{value}"
      exact: "\"{value}\""
      exclude: "-{value}"
      date_after: "after:{value}"
  duckduckgo:
    base_url: "https://duckduckgo.com/html"
    weight: 0.7
    qps: 0.2
    operators:
      site: "site:{value}"
      filetype: "filetype:{value}"
      intitle: "intitle:{value}"
      exact: "\"{value}\""
      exclude: "-{value}"
  marginalia:
    base_url: "https://search.marginalia.nu"
    weight: 0.3
    qps: 0.5
    operators:
      intitle: "title:{value}"
"#;

    fn registry() -> EngineRegistry {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ENGINES.as_bytes()).unwrap();
        file.flush().unwrap();
        EngineRegistry::load(file.path())
    }

    #[test]
    fn parses_each_operator_kind() {
        let parsed = parse_query("AI研究 site:go.jp filetype:pdf intitle:重要 after:2024-01-01");
        assert_eq!(parsed.base_query, "AI研究");
        assert_eq!(parsed.values_for(QueryOperator::Site), vec!["go.jp"]);
        assert_eq!(parsed.values_for(QueryOperator::Filetype), vec!["pdf"]);
        assert_eq!(parsed.values_for(QueryOperator::Intitle), vec!["重要"]);
        assert_eq!(parsed.values_for(QueryOperator::DateAfter), vec!["2024-01-01"]);
    }

    #[test]
    fn parses_exact_phrase_and_multiple_excludes() {
        let parsed = parse_query("\"人工知能の発展\" AI -広告 -スパム");
        assert_eq!(parsed.base_query, "AI");
        assert_eq!(parsed.values_for(QueryOperator::Exact), vec!["人工知能の発展"]);
        assert_eq!(parsed.values_for(QueryOperator::Exclude), vec!["広告", "スパム"]);
    }

    #[test]
    fn malformed_after_and_numeric_dash_join_base_query() {
        let parsed = parse_query("temperature -1.5 after:notadate");
        assert!(parsed.operators.is_empty());
        assert_eq!(parsed.base_query, "temperature -1.5 after:notadate");
    }

    #[test]
    fn transform_keeps_supported_operators() {
        let registry = registry();
        let snapshot = registry.snapshot();

        let out = transform_query_for_engine("AI site:go.jp filetype:pdf", "google", &snapshot);
        assert!(out.contains("site:go.jp"));
        assert!(out.contains("filetype:pdf"));
        assert!(out.contains("AI"));
    }

    #[test]
    fn transform_drops_unsupported_operators_silently() {
        let registry = registry();
        let snapshot = registry.snapshot();

        let out =
            transform_query_for_engine("AI site:go.jp after:2024-01-01", "duckduckgo", &snapshot);
        assert!(out.contains("site:go.jp"));
        assert!(!out.contains("after:"));
        assert!(out.contains("AI"));
    }

    #[test]
    fn transform_uses_engine_alternative_syntax() {
        let registry = registry();
        let snapshot = registry.snapshot();

        let out = transform_query_for_engine("rust intitle:tokio", "marginalia", &snapshot);
        assert_eq!(out, "rust title:tokio");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let registry = registry();
        let snapshot = registry.snapshot();
        assert_eq!(transform_query_for_engine("", "duckduckgo", &snapshot), "");
    }

    #[test]
    fn only_unsupported_operators_yield_base_query() {
        let registry = registry();
        let snapshot = registry.snapshot();
        // marginalia supports only intitle; everything else drops away.
        let out = transform_query_for_engine("site:go.jp filetype:pdf", "marginalia", &snapshot);
        assert_eq!(out, "");
    }

    #[test]
    fn unknown_engine_returns_query_unchanged() {
        let registry = registry();
        let snapshot = registry.snapshot();
        let q = "AI site:go.jp";
        assert_eq!(transform_query_for_engine(q, "unknown_engine", &snapshot), q);
    }

    #[test]
    fn transform_is_idempotent_per_engine() {
        let registry = registry();
        let snapshot = registry.snapshot();

        for engine in ["google", "duckduckgo", "marginalia"] {
            let q = "AI研究 site:go.jp filetype:pdf \"exact phrase\" -ads after:2024-01-01";
            let once = transform_query_for_engine(q, engine, &snapshot);
            let twice = transform_query_for_engine(&once, engine, &snapshot);
            assert_eq!(once, twice, "engine={}", engine);
        }
    }

    #[test]
    fn round_trip_preserves_operator_set_when_all_supported() {
        let registry = registry();
        let snapshot = registry.snapshot();

        let q = "AI site:go.jp filetype:pdf \"exact phrase\" -ads after:2024-01-01";
        let transformed = transform_query_for_engine(q, "google", &snapshot);
        let original = parse_query(q);
        let reparsed = parse_query(&transformed);

        assert!(original.same_operators(&reparsed));
        assert_eq!(original.base_query, reparsed.base_query);
    }
}
