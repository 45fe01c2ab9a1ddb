//! Lexical term-set vector index. Deliberately not an embedding
//! store: any drop-in replacement honouring the same ranking shape (docs
//! with scores in `[0,1]`, descending, length <= k) is a valid substitute.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use std::sync::OnceLock;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[a-zA-Z0-9_]+|\p{Han}").expect("static token regex"))
}

/// Tokenize per the rule `[a-zA-Z0-9_]+ | single CJK ideograph`, lowercased.
pub fn tokenize(text: &str) -> HashSet<String> {
    token_pattern()
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn cosine(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    intersection / ((a.len() as f64) * (b.len() as f64)).sqrt()
}

#[derive(Debug, Clone)]
pub struct Document {
    pub doc_id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub doc_id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub score: f64,
}

/// A capability interface: a single upsert/query operation, shared by
/// every knowledge base. No shared ancestor beyond this trait.
pub trait VectorStore: Send + Sync {
    fn upsert(&mut self, doc_id: &str, text: &str, metadata: BTreeMap<String, String>);
    fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&BTreeMap<String, String>>,
    ) -> Vec<ScoredDocument>;
}

struct Entry {
    text: String,
    tokens: HashSet<String>,
    metadata: BTreeMap<String, String>,
}

/// In-memory lexical index. Documents are kept in insertion order so that
/// ties in score are broken by insertion order.
#[derive(Default)]
pub struct InMemoryVectorStore {
    order: Vec<String>,
    entries: BTreeMap<String, Entry>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(&mut self, doc_id: &str, text: &str, metadata: BTreeMap<String, String>) {
        let tokens = tokenize(text);
        if !self.entries.contains_key(doc_id) {
            self.order.push(doc_id.to_string());
        }
        self.entries.insert(doc_id.to_string(), Entry { text: text.to_string(), tokens, metadata });
    }

    fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&BTreeMap<String, String>>,
    ) -> Vec<ScoredDocument> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let query_tokens = tokenize(text);
        let mut scored: Vec<ScoredDocument> = self
            .order
            .iter()
            .filter_map(|doc_id| self.entries.get(doc_id).map(|e| (doc_id, e)))
            .filter(|(_, e)| match filter {
                Some(f) => f.iter().all(|(k, v)| e.metadata.get(k) == Some(v)),
                None => true,
            })
            .map(|(doc_id, e)| ScoredDocument {
                doc_id: doc_id.clone(),
                text: e.text.clone(),
                metadata: e.metadata.clone(),
                score: cosine(&query_tokens, &e.tokens),
            })
            .filter(|d| d.score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_returns_empty() {
        let mut store = InMemoryVectorStore::new();
        store.upsert("a", "feeder load", BTreeMap::new());
        assert!(store.query("", 5, None).is_empty());
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut store = InMemoryVectorStore::new();
        store.upsert("first", "feeder load", BTreeMap::new());
        store.upsert("second", "feeder load", BTreeMap::new());
        let results = store.query("feeder load", 5, None);
        assert_eq!(results[0].doc_id, "first");
        assert_eq!(results[1].doc_id, "second");
    }

    #[test]
    fn filter_restricts_to_matching_metadata() {
        let mut store = InMemoryVectorStore::new();
        let mut meta_a = BTreeMap::new();
        meta_a.insert("kind".to_string(), "schema".to_string());
        store.upsert("a", "feeder load", meta_a);
        let mut meta_b = BTreeMap::new();
        meta_b.insert("kind".to_string(), "metric".to_string());
        store.upsert("b", "feeder load", meta_b);

        let mut filter = BTreeMap::new();
        filter.insert("kind".to_string(), "metric".to_string());
        let results = store.query("feeder load", 5, Some(&filter));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "b");
    }

    #[test]
    fn score_is_cosine_over_token_sets() {
        let mut store = InMemoryVectorStore::new();
        store.upsert("a", "feeder load kw", BTreeMap::new());
        let results = store.query("feeder load", 5, None);
        // |{feeder,load}| intersect = 2, |A|=2, |B|=3 -> 2/sqrt(6)
        assert!((results[0].score - (2.0 / 6f64.sqrt())).abs() < 1e-9);
    }
}
