//! Claim decomposition.
//!
//! Turns a research question into an ordered list of atomic claims, either
//! through the local LLM (structured JSON-array prompt) or through the
//! rule-based splitter. Both paths are total: an empty question yields an
//! unsuccessful empty result, and a question that defies splitting yields
//! exactly one composite claim covering the whole input at confidence 0.5.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ClaimGranularity, ClaimPolarity, ClaimType};
use crate::service::llm::LlmClient;

/// A decomposed claim before persistence.
#[derive(Debug, Clone, Serialize)]
pub struct AtomicClaim {
    pub text: String,
    pub expected_polarity: ClaimPolarity,
    pub granularity: ClaimGranularity,
    pub claim_type: ClaimType,
    pub keywords: Vec<String>,
    pub verification_hints: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecompositionResult {
    pub original_question: String,
    pub claims: Vec<AtomicClaim>,
    pub method: &'static str,
    pub success: bool,
    pub error: Option<String>,
}

const DECOMPOSE_PROMPT: &str = r#"You are an information analyst. Decompose the research question below into independently verifiable atomic claims.

Research question:
{question}

Output a JSON array; each element must contain:
- "text": the claim, phrased verifiably
- "polarity": "positive" | "negative" | "neutral"
- "granularity": "atomic" | "composite"
- "type": "factual" | "causal" | "comparative" | "definitional" | "temporal" | "quantitative"
- "keywords": search keywords
- "hints": where to look for verification

Output only the JSON array."#;

#[derive(Debug, Deserialize)]
struct LlmClaimItem {
    #[serde(default)]
    text: String,
    #[serde(default)]
    polarity: Option<String>,
    #[serde(default)]
    granularity: Option<String>,
    #[serde(default, rename = "type")]
    claim_type: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    hints: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct ClaimDecomposer {
    llm: Option<Arc<dyn LlmClient>>,
}

impl ClaimDecomposer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// Decompose a question. LLM failures fall back to the rule-based path.
    pub async fn decompose(&self, question: &str) -> DecompositionResult {
        let question = question.trim();
        if question.is_empty() {
            return DecompositionResult {
                original_question: String::new(),
                claims: Vec::new(),
                method: "none",
                success: false,
                error: Some("Empty question provided".to_string()),
            };
        }

        if let Some(llm) = &self.llm {
            let prompt = DECOMPOSE_PROMPT.replace("{question}", question);
            match llm.generate(&prompt, 2000).await {
                Ok(response) => {
                    if let Some(claims) = parse_llm_response(&response) {
                        if !claims.is_empty() {
                            return DecompositionResult {
                                original_question: question.to_string(),
                                claims,
                                method: "llm",
                                success: true,
                                error: None,
                            };
                        }
                    }
                    log::warn!("LLM decomposition unusable, falling back to rules");
                }
                Err(e) => {
                    log::warn!("LLM decomposition failed, falling back to rules: {:#}", e);
                }
            }
        }

        decompose_with_rules(question)
    }
}

/// Extract the first JSON array from the response and map valid items.
/// Malformed items are discarded; non-JSON output returns None.
fn parse_llm_response(response: &str) -> Option<Vec<AtomicClaim>> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end <= start {
        return None;
    }

    let items: Vec<serde_json::Value> = serde_json::from_str(&response[start..=end]).ok()?;

    let mut claims = Vec::new();
    for item in items {
        let Ok(item) = serde_json::from_value::<LlmClaimItem>(item) else {
            continue;
        };
        let text = item.text.trim().to_string();
        if text.is_empty() {
            continue;
        }

        let polarity = item
            .polarity
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(ClaimPolarity::Neutral);
        let granularity = item
            .granularity
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(ClaimGranularity::Atomic);
        let claim_type = item
            .claim_type
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(ClaimType::Factual);

        claims.push(AtomicClaim {
            text,
            expected_polarity: polarity,
            granularity,
            claim_type,
            keywords: item.keywords,
            verification_hints: item.hints,
            confidence: item.confidence.unwrap_or(0.9).clamp(0.0, 1.0),
        });
    }
    Some(claims)
}

/// Rule-based decomposition: split on conjunctions and punctuation
/// (Japanese and English), then infer polarity, type and keywords per
/// segment. Deterministic for a fixed input.
pub fn decompose_with_rules(question: &str) -> DecompositionResult {
    let question = question.trim();

    let mut claims: Vec<AtomicClaim> = split_by_conjunctions(question)
        .into_iter()
        .map(|segment| {
            let claim_type = infer_claim_type(&segment);
            let keywords = extract_keywords(&segment);
            let hints = generate_hints(claim_type, &keywords);
            AtomicClaim {
                expected_polarity: infer_polarity(&segment),
                granularity: ClaimGranularity::Atomic,
                claim_type,
                keywords,
                verification_hints: hints,
                confidence: 0.7,
                text: segment,
            }
        })
        .collect();

    if claims.is_empty() {
        claims.push(AtomicClaim {
            text: question.to_string(),
            expected_polarity: ClaimPolarity::Neutral,
            granularity: ClaimGranularity::Composite,
            claim_type: ClaimType::Factual,
            keywords: extract_keywords(question),
            verification_hints: vec!["general web search".to_string()],
            confidence: 0.5,
        });
    }

    DecompositionResult {
        original_question: question.to_string(),
        claims,
        method: "rule_based",
        success: true,
        error: None,
    }
}

fn split_by_conjunctions(text: &str) -> Vec<String> {
    let splitter = Regex::new(
        r"[、。,;]|(?:および|かつ|また、|そして|さらに)|(?:\s(?:and|or|but|also|moreover)\s)",
    )
    .expect("static regex");

    splitter
        .split(text)
        .map(str::trim)
        .filter(|s| s.chars().count() > 5)
        .map(str::to_string)
        .collect()
}

fn infer_polarity(text: &str) -> ClaimPolarity {
    let lower = text.to_lowercase();

    const NEGATIVE: &[&str] = &[
        "ない", "しない", "できない", "不可能", "否定", "誤り", "間違い", "not ", "never",
        "cannot", "impossible", "false", "incorrect", "wrong",
    ];
    if NEGATIVE.iter().any(|p| lower.contains(p)) {
        return ClaimPolarity::Negative;
    }

    let question_markers = Regex::new(
        r"(?:\?|？)$|^(?:what|who|when|where|why|how|which)\b|^(?:何|誰|いつ|どこ|なぜ|どう|どの)|(?:か|のか|でしょうか)$",
    )
    .expect("static regex");
    if question_markers.is_match(&lower) {
        return ClaimPolarity::Neutral;
    }

    ClaimPolarity::Positive
}

fn infer_claim_type(text: &str) -> ClaimType {
    let lower = text.to_lowercase();

    let temporal = Regex::new(
        r"\d{4}年|\d{4}[/-]\d{1,2}|\b(?:19|20)\d{2}\b|いつ|\bwhen\b|以前|以後|\bbefore\b|\bafter\b|\bduring\b",
    )
    .expect("static regex");
    if temporal.is_match(&lower) {
        return ClaimType::Temporal;
    }

    let quantitative =
        Regex::new(r"\d+%|\d+億|\d+万|割合|比率|\bhow many\b|\bhow much\b|percentage|ratio")
            .expect("static regex");
    if quantitative.is_match(&lower) {
        return ClaimType::Quantitative;
    }

    let comparative =
        Regex::new(r"より|比較|違い|\bcompared to\b|\bthan\b|\bversus\b|\bvs\b|difference|similar")
            .expect("static regex");
    if comparative.is_match(&lower) {
        return ClaimType::Comparative;
    }

    let causal = Regex::new(
        r"なぜ|原因|理由|結果|影響|によって|ため|\bbecause\b|\bcause\b|\beffect\b|\bresult\b|\bimpact\b|\bwhy\b",
    )
    .expect("static regex");
    if causal.is_match(&lower) {
        return ClaimType::Causal;
    }

    let definitional =
        Regex::new(r"とは|定義|意味|\bwhat is\b|\bdefine\b|\bdefinition\b").expect("static regex");
    if definitional.is_match(&lower) {
        return ClaimType::Definitional;
    }

    ClaimType::Factual
}

fn extract_keywords(text: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        // Japanese particles and fillers
        "の", "は", "が", "を", "に", "で", "と", "も", "や", "か", "です", "ます", "した",
        "する", "される", "ている", "いる", "こと", "もの", "ため", "よう", "など", "これ",
        "それ",
        // English function words
        "the", "a", "an", "is", "are", "was", "were", "be", "been", "have", "has", "had", "do",
        "does", "did", "will", "would", "could", "should", "may", "might", "can", "this", "that",
        "these", "those", "what", "which", "who", "whom", "whose", "where", "when", "why", "how",
        "and", "or", "but", "if", "then", "else", "for", "of", "to", "from", "by", "with", "in",
        "on", "at",
    ];

    let delimiter = Regex::new(r"[\s、。,.\-:;()（）「」『』]+").expect("static regex");

    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();
    for word in delimiter.split(text) {
        let word = word.trim();
        if word.chars().count() < 2 {
            continue;
        }
        if STOPWORDS.contains(&word.to_lowercase().as_str()) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
        }
        if keywords.len() >= 10 {
            break;
        }
    }
    keywords
}

fn generate_hints(claim_type: ClaimType, keywords: &[String]) -> Vec<String> {
    let mut hints: Vec<String> = match claim_type {
        ClaimType::Factual => vec!["official announcements and press releases", "reputable news sources"],
        ClaimType::Temporal => vec!["timelines and chronologies", "archived snapshots"],
        ClaimType::Quantitative => vec!["official statistics and reports", "academic surveys"],
        ClaimType::Comparative => vec!["comparative analyses", "review articles"],
        ClaimType::Causal => vec!["research papers and analyses", "expert commentary"],
        ClaimType::Definitional => vec!["glossaries and dictionaries", "official documentation"],
    }
    .into_iter()
    .map(str::to_string)
    .collect();

    for kw in keywords.iter().take(3) {
        if ["Inc", "Corp", "Ltd", "株式会社", "会社"]
            .iter()
            .any(|c| kw.contains(c))
        {
            hints.push(format!("official site and investor relations of {}", kw));
        }
    }

    hints.truncate(5);
    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedLlm(String);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn empty_question_is_unsuccessful_and_empty() {
        let decomposer = ClaimDecomposer::new(None);
        let result = decomposer.decompose("   ").await;
        assert!(!result.success);
        assert!(result.claims.is_empty());
    }

    #[tokio::test]
    async fn llm_path_parses_json_array() {
        let response = r#"Here are the claims:
[
  {"text": "GPT-4 was released in March 2023", "polarity": "positive",
   "granularity": "atomic", "type": "temporal",
   "keywords": ["GPT-4", "release"], "hints": ["OpenAI announcements"]},
  {"text": "", "polarity": "positive"},
  {"not_text": true}
]"#;
        let decomposer = ClaimDecomposer::new(Some(Arc::new(FixedLlm(response.to_string()))));
        let result = decomposer.decompose("When was GPT-4 released?").await;

        assert!(result.success);
        assert_eq!(result.method, "llm");
        // Malformed and empty items are discarded.
        assert_eq!(result.claims.len(), 1);
        assert_eq!(result.claims[0].claim_type, ClaimType::Temporal);
        assert_eq!(result.claims[0].expected_polarity, ClaimPolarity::Positive);
    }

    #[tokio::test]
    async fn non_json_llm_output_falls_back_to_rules() {
        let decomposer =
            ClaimDecomposer::new(Some(Arc::new(FixedLlm("I cannot answer that".to_string()))));
        let result = decomposer.decompose("GPT-4 was released in March 2023").await;
        assert!(result.success);
        assert_eq!(result.method, "rule_based");
    }

    #[tokio::test]
    async fn llm_error_falls_back_to_rules() {
        let decomposer = ClaimDecomposer::new(Some(Arc::new(FailingLlm)));
        let result = decomposer.decompose("GPT-4 was released in March 2023").await;
        assert!(result.success);
        assert_eq!(result.method, "rule_based");
        assert!(!result.claims.is_empty());
    }

    #[test]
    fn rules_split_on_conjunctions() {
        let result =
            decompose_with_rules("GPT-4 was released in 2023, and it outperforms GPT-3.5");
        assert!(result.claims.len() >= 2);
        assert_eq!(result.claims[0].claim_type, ClaimType::Temporal);
    }

    #[test]
    fn rules_split_japanese_punctuation() {
        let result = decompose_with_rules("GPT-4は2023年に公開された。性能はGPT-3.5を上回る");
        assert_eq!(result.claims.len(), 2);
        assert_eq!(result.claims[0].claim_type, ClaimType::Temporal);
    }

    #[test]
    fn unsplittable_question_yields_one_composite_claim() {
        let result = decompose_with_rules("Hi?");
        assert!(result.success);
        assert_eq!(result.claims.len(), 1);
        assert_eq!(result.claims[0].granularity, ClaimGranularity::Composite);
        assert!((result.claims[0].confidence - 0.5).abs() < f64::EPSILON);
        assert_eq!(result.claims[0].text, "Hi?");
    }

    #[test]
    fn polarity_inference_covers_negation_and_questions() {
        assert_eq!(
            infer_polarity("The model cannot run locally"),
            ClaimPolarity::Negative
        );
        assert_eq!(infer_polarity("なぜ失敗したのか"), ClaimPolarity::Neutral);
        assert_eq!(
            infer_polarity("GPT-4 was released in March"),
            ClaimPolarity::Positive
        );
    }

    #[test]
    fn type_inference_covers_lexical_cues() {
        assert_eq!(infer_claim_type("released in 2023年"), ClaimType::Temporal);
        assert_eq!(infer_claim_type("growth of 40%"), ClaimType::Quantitative);
        assert_eq!(
            infer_claim_type("faster than its predecessor"),
            ClaimType::Comparative
        );
        assert_eq!(
            infer_claim_type("the outage happened because of DNS"),
            ClaimType::Causal
        );
        assert_eq!(infer_claim_type("what is a transformer"), ClaimType::Definitional);
        assert_eq!(infer_claim_type("the sky appears blue"), ClaimType::Factual);
    }

    #[test]
    fn keywords_drop_stopwords_and_duplicates() {
        let kws = extract_keywords("the quick fox and the quick dog");
        assert_eq!(kws, vec!["quick", "fox", "dog"]);
    }

    #[test]
    fn rule_based_decomposition_is_stable() {
        let q = "GPT-4 was released in 2023, and it outperforms GPT-3.5 on benchmarks";
        let a = decompose_with_rules(q);
        let b = decompose_with_rules(q);

        assert_eq!(a.claims.len(), b.claims.len());
        for (x, y) in a.claims.iter().zip(b.claims.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.claim_type, y.claim_type);
            assert_eq!(x.expected_polarity, y.expected_polarity);
            assert_eq!(x.keywords, y.keywords);
        }
    }
}
