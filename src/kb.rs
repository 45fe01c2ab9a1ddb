//! The four knowledge bases: typed wrappers that load a JSON
//! catalogue once, index it into the vector store, and serve ranked
//! lookups. They share structure (load -> index -> query) but no shared
//! ancestor type beyond the shared helpers below.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use tracing::info;

use crate::model::{JoinPath, MetricDef, SchemaEntity, TemplateRule};
use crate::vector::{InMemoryVectorStore, VectorStore};

fn load_catalogue<T: DeserializeOwned>(path: &std::path::Path) -> anyhow::Result<Vec<T>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading knowledge base file {}: {e}", path.display()))?;
    let items: Vec<T> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parsing knowledge base file {}: {e}", path.display()))?;
    Ok(items)
}

fn index_text(parts: &[&str]) -> String {
    parts.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join(" ")
}

fn query_by_index<T: Clone>(
    store: &InMemoryVectorStore,
    by_doc_id: &BTreeMap<String, T>,
    text: &str,
    top_k: usize,
) -> Vec<T> {
    store
        .query(text, top_k, None)
        .into_iter()
        .filter_map(|d| by_doc_id.get(&d.doc_id).cloned())
        .collect()
}

pub struct SchemaKb {
    data: Vec<SchemaEntity>,
    store: InMemoryVectorStore,
    by_doc_id: BTreeMap<String, SchemaEntity>,
}

impl SchemaKb {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let data: Vec<SchemaEntity> = load_catalogue(path)?;
        let mut store = InMemoryVectorStore::new();
        let mut by_doc_id = BTreeMap::new();
        for entity in &data {
            let doc_id = format!("schema::{}", entity.qualified());
            let text = index_text(&[
                &entity.table,
                &entity.field,
                &entity.field_desc,
                &entity.aliases.join(" "),
            ]);
            let mut metadata = BTreeMap::new();
            metadata.insert("table".to_string(), entity.table.clone());
            store.upsert(&doc_id, &text, metadata);
            by_doc_id.insert(doc_id, entity.clone());
        }
        info!(count = data.len(), path = %path.display(), "loaded schema knowledge base");
        Ok(Self { data, store, by_doc_id })
    }

    pub fn all(&self) -> &[SchemaEntity] {
        &self.data
    }

    pub fn query(&self, text: &str, top_k: usize) -> Vec<SchemaEntity> {
        query_by_index(&self.store, &self.by_doc_id, text, top_k)
    }

    pub fn time_typed_rows(&self) -> Vec<SchemaEntity> {
        self.data.iter().filter(|e| e.is_time_typed()).cloned().collect()
    }
}

pub struct JoinKb {
    data: Vec<JoinPath>,
    store: InMemoryVectorStore,
    by_doc_id: BTreeMap<String, JoinPath>,
    /// Undirected adjacency map over tables, reserved for future graph
    /// walks; the planner consumes only ranked join paths.
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl JoinKb {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let data: Vec<JoinPath> = load_catalogue(path)?;
        let mut store = InMemoryVectorStore::new();
        let mut by_doc_id = BTreeMap::new();
        let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for path in &data {
            let doc_id = format!("join::{}", path.join_path_id);
            let text = index_text(&[&path.description, &path.tables.join(" ")]);
            store.upsert(&doc_id, &text, BTreeMap::new());
            by_doc_id.insert(doc_id, path.clone());
            for edge in &path.edges {
                adjacency.entry(edge.left_table.clone()).or_default().insert(edge.right_table.clone());
                adjacency.entry(edge.right_table.clone()).or_default().insert(edge.left_table.clone());
            }
        }
        info!(count = data.len(), path = %path.display(), "loaded join knowledge base");
        Ok(Self { data, store, by_doc_id, adjacency })
    }

    pub fn all(&self) -> &[JoinPath] {
        &self.data
    }

    pub fn query(&self, text: &str, top_k: usize) -> Vec<JoinPath> {
        query_by_index(&self.store, &self.by_doc_id, text, top_k)
    }

    pub fn adjacency(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.adjacency
    }
}

pub struct MetricKb {
    data: Vec<MetricDef>,
    store: InMemoryVectorStore,
    by_doc_id: BTreeMap<String, MetricDef>,
}

impl MetricKb {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let data: Vec<MetricDef> = load_catalogue(path)?;
        let mut store = InMemoryVectorStore::new();
        let mut by_doc_id = BTreeMap::new();
        for metric in &data {
            let doc_id = format!("metric::{}", metric.metric_id);
            let text = index_text(&[
                &metric.metric_id,
                &metric.name,
                &metric.definition,
                &metric.formula,
                &metric.required_fields.join(" "),
            ]);
            store.upsert(&doc_id, &text, BTreeMap::new());
            by_doc_id.insert(doc_id, metric.clone());
        }
        info!(count = data.len(), path = %path.display(), "loaded metric knowledge base");
        Ok(Self { data, store, by_doc_id })
    }

    pub fn all(&self) -> &[MetricDef] {
        &self.data
    }

    pub fn query(&self, text: &str, top_k: usize) -> Vec<MetricDef> {
        query_by_index(&self.store, &self.by_doc_id, text, top_k)
    }
}

pub struct TemplateKb {
    data: Vec<TemplateRule>,
    store: InMemoryVectorStore,
    by_doc_id: BTreeMap<String, TemplateRule>,
}

impl TemplateKb {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let data: Vec<TemplateRule> = load_catalogue(path)?;
        let mut store = InMemoryVectorStore::new();
        let mut by_doc_id = BTreeMap::new();
        for rule in &data {
            let doc_id = format!("template::{}", rule.template_id);
            let text = index_text(&[
                &rule.template_id,
                &format!("{:?}", rule.intent),
                &rule.allowed_aggs.join(" "),
                &rule.allowed_funcs.join(" "),
                &rule.required_clauses.join(" "),
            ]);
            store.upsert(&doc_id, &text, BTreeMap::new());
            by_doc_id.insert(doc_id, rule.clone());
        }
        info!(count = data.len(), path = %path.display(), "loaded template knowledge base");
        Ok(Self { data, store, by_doc_id })
    }

    pub fn all(&self) -> &[TemplateRule] {
        &self.data
    }

    pub fn query(&self, text: &str, top_k: usize) -> Vec<TemplateRule> {
        query_by_index(&self.store, &self.by_doc_id, text, top_k)
    }
}

/// The four knowledge bases, constructed once at process start and shared
/// read-only across requests.
pub struct KbSet {
    pub schema: SchemaKb,
    pub join: JoinKb,
    pub metric: MetricKb,
    pub template: TemplateKb,
}

impl KbSet {
    pub fn load(
        schema_path: &std::path::Path,
        join_path: &std::path::Path,
        metric_path: &std::path::Path,
        template_path: &std::path::Path,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            schema: SchemaKb::load(schema_path)?,
            join: JoinKb::load(join_path)?,
            metric: MetricKb::load(metric_path)?,
            template: TemplateKb::load(template_path)?,
        })
    }
}
