//! Schema retriever and graph-store interfaces (§6). Both are read-only
//! external collaborators; the core never writes through them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaNodeMatch {
    pub node: String,
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEmbedding {
    pub node: String,
    pub vector: Vec<f32>,
}

/// Read-only schema retriever: the vector/graph schema store the router
/// and retrieve nodes consult. Concrete implementations (graph DB, vector
/// index) live outside this crate.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    async fn search_nodes(&self, query: &str, label: Option<&str>, k: usize) -> crate::error::Result<Vec<SchemaNodeMatch>>;

    async fn get_table_def(&self, name: &str) -> crate::error::Result<Option<TableDef>>;

    async fn fetch_schema_embeddings(&self) -> crate::error::Result<Vec<SchemaEmbedding>>;
}

/// Deterministic in-memory introspector for tests and replay runs.
pub struct StaticSchemaIntrospector {
    tables: Vec<TableDef>,
}

impl StaticSchemaIntrospector {
    pub fn new(tables: Vec<TableDef>) -> Self {
        Self { tables }
    }
}

#[async_trait]
impl SchemaIntrospector for StaticSchemaIntrospector {
    async fn search_nodes(&self, query: &str, label: Option<&str>, k: usize) -> crate::error::Result<Vec<SchemaNodeMatch>> {
        let query_lower = query.to_lowercase();
        let mut matches: Vec<SchemaNodeMatch> = self
            .tables
            .iter()
            .filter(|t| label.map(|l| l == "table").unwrap_or(true))
            .filter(|t| t.name.to_lowercase().contains(&query_lower) || query_lower.is_empty())
            .map(|t| SchemaNodeMatch {
                node: t.name.clone(),
                label: "table".to_string(),
                score: 1.0,
            })
            .collect();
        matches.truncate(k);
        Ok(matches)
    }

    async fn get_table_def(&self, name: &str) -> crate::error::Result<Option<TableDef>> {
        Ok(self.tables.iter().find(|t| t.name == name).cloned())
    }

    async fn fetch_schema_embeddings(&self) -> crate::error::Result<Vec<SchemaEmbedding>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> TableDef {
        TableDef {
            name: "orders".to_string(),
            columns: vec![ColumnDef {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                nullable: false,
            }],
            foreign_keys: vec![],
            description: None,
        }
    }

    #[tokio::test]
    async fn search_nodes_matches_by_substring() {
        let introspector = StaticSchemaIntrospector::new(vec![sample_table()]);
        let matches = introspector.search_nodes("order", None, 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].node, "orders");
    }

    #[tokio::test]
    async fn get_table_def_returns_none_for_unknown_table() {
        let introspector = StaticSchemaIntrospector::new(vec![sample_table()]);
        assert!(introspector.get_table_def("customers").await.unwrap().is_none());
    }
}
