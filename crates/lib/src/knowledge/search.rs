//! Search implementations: lexical term overlap (default) and embedding similarity.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::{Collection, KnowledgeBase, KnowledgeError, KnowledgeStore, Passage, ScoredPassage};
use crate::llm::Inference;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "me", "my", "of", "on", "or", "our", "the", "this", "to", "we",
    "what", "when", "with", "you", "your",
];

/// Lower-case terms with light suffix stripping ("deployments" → "deployment").
pub(crate) fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|t| stem(&t))
        .collect()
}

fn stem(t: &str) -> String {
    if t.len() > 5 && t.ends_with("ing") {
        return t[..t.len() - 3].to_string();
    }
    if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
        return t[..t.len() - 1].to_string();
    }
    t.to_string()
}

struct IndexedPassage {
    passage: Passage,
    title_terms: HashSet<String>,
    body_terms: HashSet<String>,
}

/// In-memory lexical index. A query term found in the title or tags scores 2, in the text 1.
pub struct LexicalIndex {
    entries: Vec<IndexedPassage>,
}

impl LexicalIndex {
    pub fn new(kb: &KnowledgeBase) -> Self {
        Self::from_passages(kb.passages())
    }

    pub fn from_passages(passages: Vec<Passage>) -> Self {
        let entries = passages
            .into_iter()
            .map(|p| {
                let mut title_terms: HashSet<String> = terms(&p.title).into_iter().collect();
                for tag in &p.tags {
                    title_terms.extend(terms(tag));
                }
                let body_terms = terms(&p.text).into_iter().collect();
                IndexedPassage {
                    passage: p,
                    title_terms,
                    body_terms,
                }
            })
            .collect();
        Self { entries }
    }

    fn score(entry: &IndexedPassage, query_terms: &HashSet<String>) -> f32 {
        query_terms
            .iter()
            .map(|t| {
                if entry.title_terms.contains(t) {
                    2.0
                } else if entry.body_terms.contains(t) {
                    1.0
                } else {
                    0.0
                }
            })
            .sum()
    }

    pub fn search_sync(&self, collection: Collection, query: &str, top_k: usize) -> Vec<ScoredPassage> {
        let query_terms: HashSet<String> = terms(query).into_iter().collect();
        if query_terms.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<ScoredPassage> = self
            .entries
            .iter()
            .filter(|e| e.passage.collection == collection)
            .filter_map(|e| {
                let score = Self::score(e, &query_terms);
                (score > 0.0).then(|| ScoredPassage {
                    passage: e.passage.clone(),
                    score,
                })
            })
            .collect();
        // Stable sort keeps corpus order among equal scores.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        scored
    }
}

#[async_trait]
impl KnowledgeStore for LexicalIndex {
    async fn search(
        &self,
        collection: Collection,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>, KnowledgeError> {
        Ok(self.search_sync(collection, query, top_k))
    }
}

/// Embedding index: passages are embedded once at build time; queries by cosine similarity.
pub struct EmbeddingIndex {
    inference: Arc<dyn Inference>,
    entries: Vec<(Passage, Vec<f32>)>,
    min_similarity: f32,
}

impl EmbeddingIndex {
    pub async fn build(
        inference: Arc<dyn Inference>,
        kb: &KnowledgeBase,
    ) -> Result<Self, KnowledgeError> {
        let passages = kb.passages();
        let mut entries = Vec::with_capacity(passages.len());
        for p in passages {
            let vector = inference.embed(&format!("{}\n{}", p.title, p.text)).await?;
            entries.push((p, vector));
        }
        log::info!("embedded {} passage(s) for semantic search", entries.len());
        Ok(Self {
            inference,
            entries,
            min_similarity: 0.2,
        })
    }

    /// Passages below this cosine similarity are never returned.
    pub fn with_min_similarity(mut self, min: f32) -> Self {
        self.min_similarity = min;
        self
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl KnowledgeStore for EmbeddingIndex {
    async fn search(
        &self,
        collection: Collection,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>, KnowledgeError> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let q = self.inference.embed(query).await?;
        let mut scored: Vec<ScoredPassage> = self
            .entries
            .iter()
            .filter(|(p, _)| p.collection == collection)
            .map(|(p, v)| ScoredPassage {
                passage: p.clone(),
                score: cosine(&q, v),
            })
            .filter(|s| s.score >= self.min_similarity)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionOptions, InferenceError};

    fn passage(id: &str, collection: Collection, title: &str, text: &str) -> Passage {
        Passage {
            id: id.to_string(),
            collection,
            title: title.to_string(),
            text: text.to_string(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn terms_drop_stopwords_and_stem_plurals() {
        assert_eq!(terms("How do I add users?"), vec!["add", "user"]);
        assert_eq!(terms("Deploying containers"), vec!["deploy", "container"]);
    }

    #[test]
    fn lexical_search_ranks_title_hits_first_and_filters_collection() {
        let index = LexicalIndex::from_passages(vec![
            passage("a", Collection::Technical, "Other", "rollback of a deployment"),
            passage("b", Collection::Technical, "Rollback", "how to undo"),
            passage("c", Collection::Billing, "Rollback", "refund"),
        ]);
        let hits = index.search_sync(Collection::Technical, "rollback", 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].passage.id, "b");
        assert_eq!(hits[1].passage.id, "a");
    }

    #[test]
    fn lexical_search_finds_error_code_passage() {
        let kb = KnowledgeBase::bundled().unwrap();
        let index = LexicalIndex::new(&kb);
        let hits = index.search_sync(Collection::Technical, "E5678 when deploying a container", 3);
        assert_eq!(hits[0].passage.id, "error-e5678");
    }

    struct AxisEmbedder;

    #[async_trait]
    impl Inference for AxisEmbedder {
        async fn complete(&self, _: &str, _: &CompletionOptions) -> Result<String, InferenceError> {
            Ok(String::new())
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
            let t = text.to_lowercase();
            Ok(vec![
                if t.contains("invoice") { 1.0 } else { 0.0 },
                if t.contains("deploy") { 1.0 } else { 0.0 },
            ])
        }
    }

    #[tokio::test]
    async fn embedding_search_uses_cosine_similarity() {
        let kb = KnowledgeBase {
            guides: vec![
                passage("inv", Collection::Billing, "Invoices", "download an invoice"),
                passage("dep", Collection::Billing, "Deploys", "deploy things"),
            ],
            ..KnowledgeBase::default()
        };
        let index = EmbeddingIndex::build(Arc::new(AxisEmbedder), &kb).await.unwrap();
        let hits = index.search(Collection::Billing, "where is my invoice", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].passage.id, "inv");
    }
}
