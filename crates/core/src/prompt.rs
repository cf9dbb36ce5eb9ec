//! Deterministic prompt construction for the Batch Screener (C4).
//!
//! Content is carried over from the original system's `prompts.py` almost
//! verbatim — the rubric, the reason-format contract and the inclusion rule
//! are load-bearing for the Normaliser's reconciliation step, not
//! incidental wording.

use crate::model::SCORE_THRESHOLD;
use crate::screener::BatchArticle;

pub fn build_screening_prompt(articles: &[BatchArticle], criteria: &str) -> String {
    let formatted: String = articles
        .iter()
        .map(|a| format!("Article ID: {}\nTitle: {}\nAbstract: {}", a.id, a.title, a.abstract_text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"You are a precise and deterministic research screening assistant. Analyze these articles based on the given criteria and provide clear results.

SCREENING CRITERIA:
{criteria}

STRICT SCORING RULES:
1. Relevance Score (0-100):
   - 90-100: Perfect match with all criteria
   - 70-89: Strong match with most criteria
   - 50-69: Moderate match with some criteria
   - 30-49: Weak match with few criteria
   - 0-29: Very poor match or irrelevant

2. Reason Format:
   - Start with "Included:" or "Excluded:"
   - List specific matching/missing criteria
   - Be concise but specific

ARTICLES TO ANALYZE:
{formatted}

REQUIRED OUTPUT FORMAT:
{{
  "article_id": {{
    "included": boolean,
    "reason": "string explaining decision",
    "relevance_score": number (0-100)
  }}
}}

CRITICAL REQUIREMENTS:
1. Response MUST be a JSON object (dictionary), NOT an array
2. Each article must be a key-value pair in the root object
3. Use the article ID as the key for each result
4. Each result must have exactly these fields: included, reason, relevance_score

IMPORTANT DECISION LOGIC:
- If relevance_score >= {threshold} -> included = true
- If relevance_score < {threshold} -> included = false
- This rule is NON-NEGOTIABLE and MUST be followed

IMPORTANT: NEVER return a list/array! Always return a dictionary/object with article IDs as keys."#,
        criteria = criteria,
        formatted = formatted,
        threshold = SCORE_THRESHOLD as u32,
    )
}

pub const SYSTEM_PROMPT: &str =
    "You are a deterministic research screening assistant. You must respond with ONLY valid JSON in the exact format requested, nothing else.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_criteria_and_every_article() {
        let articles = vec![
            BatchArticle {
                id: "a1".into(),
                title: "T1".into(),
                abstract_text: "Ab1".into(),
            },
            BatchArticle {
                id: "a2".into(),
                title: "T2".into(),
                abstract_text: "Ab2".into(),
            },
        ];
        let prompt = build_screening_prompt(&articles, "must mention cats");
        assert!(prompt.contains("must mention cats"));
        assert!(prompt.contains("Article ID: a1"));
        assert!(prompt.contains("Article ID: a2"));
        assert!(prompt.contains(">= 60"));
    }
}
