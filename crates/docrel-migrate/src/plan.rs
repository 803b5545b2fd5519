//! Migration plan: what will be created and in which order.
//!
//! A plan is built without touching a destination. It holds the table
//! forest, the dependency analysis, the warnings gathered so far and the
//! input needed to produce rows during the `normalizing` phase.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::schema::{validate_tables, TableDefinition};
use crate::core::traits::Dialect;
use crate::core::value::TableRows;
use crate::drivers::schema_script;
use crate::enhance::{collect_suggestions, Suggestion, SuggestionProvider};
use crate::error::Result;
use crate::graph::{
    build_dependencies, group_by_dependency_level, topological_sort, write_order, SortResult,
    TableDependency,
};
use crate::normalize::{flatten_after, SchemaNormalizer, TableLayout};
use crate::source::RelationalInput;

#[derive(Debug, Clone)]
enum PlanData {
    Documents {
        layout: Option<TableLayout>,
        records: Vec<Value>,
    },
    Tables(Vec<TableRows>),
}

/// Tables, ordering and pending rows for one migration.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Tables in discovery order (root first for document input).
    pub tables: Vec<TableDefinition>,
    pub warnings: Vec<String>,
    pub dependencies: Vec<TableDependency>,
    pub sort: SortResult,
    /// Every table, acyclic ones first.
    pub write_order: Vec<String>,
    pub waves: Vec<Vec<String>>,
    pub suggestions: Vec<Suggestion>,
    data: PlanData,
}

/// Serializable overview of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub tables: Vec<TableSummary>,
    pub write_order: Vec<String>,
    pub independent: Vec<String>,
    pub waves: Vec<Vec<String>>,
    pub cycles: Vec<Vec<String>>,
    pub input_records: usize,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub primary_key: String,
    pub columns: usize,
    pub depends_on: Vec<String>,
}

impl MigrationPlan {
    /// Infer tables from document records.
    pub fn from_documents(root_table: &str, records: Vec<Value>) -> Result<Self> {
        let normalized = SchemaNormalizer::new(root_table).normalize(&records)?;
        validate_tables(&normalized.tables)?;
        Ok(Self::build(
            normalized.tables,
            normalized.warnings,
            PlanData::Documents {
                layout: normalized.layout,
                records,
            },
        ))
    }

    /// Plan externally supplied tables and rows.
    pub fn from_relational(input: RelationalInput) -> Result<Self> {
        validate_tables(&input.tables)?;
        Ok(Self::build(
            input.tables,
            Vec::new(),
            PlanData::Tables(input.rows),
        ))
    }

    fn build(tables: Vec<TableDefinition>, mut warnings: Vec<String>, data: PlanData) -> Self {
        let dependencies = build_dependencies(&tables);
        let sort = topological_sort(&dependencies);
        let write_order = write_order(&dependencies);
        let waves = group_by_dependency_level(&dependencies);

        for cycle in &sort.cycles {
            warnings.push(format!(
                "dependency cycle among tables {}; they are written after the acyclic tables",
                cycle.join(", ")
            ));
        }

        info!(
            "Planned {} tables in {} waves ({} cyclic groups)",
            tables.len(),
            waves.len(),
            sort.cycles.len()
        );

        Self {
            tables,
            warnings,
            dependencies,
            sort,
            write_order,
            waves,
            suggestions: Vec::new(),
            data,
        }
    }

    /// Run the suggestion hook. The table forest is never modified.
    pub async fn with_suggestions(
        mut self,
        provider: &dyn SuggestionProvider,
        dialect: &dyn Dialect,
        timeout: Duration,
    ) -> Self {
        let ddl = schema_script(dialect, "", &self.tables_in_write_order_owned()).join(";\n");
        let sample: &[Value] = match &self.data {
            PlanData::Documents { records, .. } => records,
            PlanData::Tables(_) => &[],
        };
        let outcome = collect_suggestions(provider, &ddl, sample, timeout).await;
        self.suggestions = outcome.suggestions;
        if let Some(warning) = outcome.warning {
            self.warnings.push(warning);
        }
        self
    }

    fn tables_in_write_order_owned(&self) -> Vec<TableDefinition> {
        self.tables_in_write_order().into_iter().cloned().collect()
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Table definitions following [`MigrationPlan::write_order`].
    pub fn tables_in_write_order(&self) -> Vec<&TableDefinition> {
        self.write_order
            .iter()
            .filter_map(|name| self.table(name))
            .collect()
    }

    pub fn has_cycles(&self) -> bool {
        self.sort.has_cycles()
    }

    /// Number of input records (documents, or rows for relational input).
    pub fn input_records(&self) -> usize {
        match &self.data {
            PlanData::Documents { records, .. } => records.len(),
            PlanData::Tables(rows) => rows.iter().map(|t| t.rows.len()).sum(),
        }
    }

    /// Produce per-table rows, with flattening warnings.
    ///
    /// Every planned table gets an entry, empty when there is no data for it.
    pub fn materialize_rows(&self) -> (Vec<TableRows>, Vec<String>) {
        self.materialize_rows_after(&HashMap::new())
    }

    /// Rows with synthetic keys numbered after `last_keys[table]`, for
    /// appending to tables that already hold rows. Relational input carries
    /// its own keys and ignores `last_keys`.
    pub fn materialize_rows_after(
        &self,
        last_keys: &HashMap<String, i64>,
    ) -> (Vec<TableRows>, Vec<String>) {
        let (mut rows, warnings) = match &self.data {
            PlanData::Documents {
                layout: Some(layout),
                records,
            } => {
                let out = flatten_after(layout, records, last_keys);
                (out.tables, out.warnings)
            }
            PlanData::Documents { layout: None, .. } => (Vec::new(), Vec::new()),
            PlanData::Tables(rows) => (rows.clone(), Vec::new()),
        };

        for table in &self.tables {
            if !rows.iter().any(|r| r.table == table.name) {
                rows.push(TableRows::new(&table.name));
            }
        }
        debug!(
            "Materialized {} rows across {} tables",
            rows.iter().map(|t| t.rows.len()).sum::<usize>(),
            rows.len()
        );
        (rows, warnings)
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            tables: self
                .tables
                .iter()
                .map(|t| TableSummary {
                    name: t.name.clone(),
                    primary_key: t.primary_key.clone(),
                    columns: t.columns.len(),
                    depends_on: self
                        .dependencies
                        .iter()
                        .find(|d| d.table_name == t.name)
                        .map(|d| d.depends_on.clone())
                        .unwrap_or_default(),
                })
                .collect(),
            write_order: self.write_order.clone(),
            independent: self.sort.independent.clone(),
            waves: self.waves.clone(),
            cycles: self.sort.cycles.clone(),
            input_records: self.input_records(),
            warnings: self.warnings.clone(),
            suggestions: self.suggestions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ColumnDef, ForeignKeyDef};
    use crate::drivers::PostgresDialect;
    use crate::enhance::NoSuggestions;
    use serde_json::json;

    fn docs() -> Vec<Value> {
        vec![
            json!({"id": 1, "name": "a", "orders": [{"sku": "x"}, {"sku": "y"}]}),
            json!({"id": 2, "name": "b", "orders": []}),
        ]
    }

    #[test]
    fn test_documents_plan_orders_parents_first() {
        let plan = MigrationPlan::from_documents("users", docs()).unwrap();
        assert_eq!(plan.write_order, vec!["users", "users_orders"]);
        assert_eq!(plan.sort.independent, vec!["users"]);
        assert_eq!(plan.waves.len(), 2);
        assert!(!plan.has_cycles());
        assert_eq!(plan.input_records(), 2);
    }

    #[test]
    fn test_materialize_rows_covers_every_table() {
        let plan = MigrationPlan::from_documents("users", docs()).unwrap();
        let (rows, _) = plan.materialize_rows();
        let count = |name: &str| rows.iter().find(|t| t.table == name).unwrap().rows.len();
        assert_eq!(count("users"), 2);
        assert_eq!(count("users_orders"), 2);
    }

    #[test]
    fn test_empty_documents_warn() {
        let plan = MigrationPlan::from_documents("users", Vec::new()).unwrap();
        assert!(plan.tables.is_empty());
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.materialize_rows().0.is_empty());
    }

    #[test]
    fn test_cycles_are_warned_not_rejected() {
        let mut a = TableDefinition::new("a", ColumnDef::synthetic_key("id"));
        a.push_column(ColumnDef::new("b_id", crate::core::schema::ColumnType::BigInt));
        a.foreign_keys.push(ForeignKeyDef::new("b_id", "b", "id"));
        let mut b = TableDefinition::new("b", ColumnDef::synthetic_key("id"));
        b.push_column(ColumnDef::new("a_id", crate::core::schema::ColumnType::BigInt));
        b.foreign_keys.push(ForeignKeyDef::new("a_id", "a", "id"));

        let plan = MigrationPlan::from_relational(RelationalInput {
            tables: vec![a, b],
            rows: Vec::new(),
        })
        .unwrap();
        assert!(plan.has_cycles());
        assert!(plan.sort.order.is_empty());
        assert_eq!(plan.write_order.len(), 2);
        assert!(plan.warnings[0].contains("cycle"));
    }

    #[tokio::test]
    async fn test_suggestions_do_not_touch_tables() {
        let plan = MigrationPlan::from_documents("users", docs()).unwrap();
        let before = plan.tables.clone();
        let plan = plan
            .with_suggestions(&NoSuggestions, &PostgresDialect::new(), Duration::from_secs(1))
            .await;
        assert_eq!(plan.tables, before);
        assert!(plan.suggestions.is_empty());
    }

    #[test]
    fn test_summary_serializes() {
        let plan = MigrationPlan::from_documents("users", docs()).unwrap();
        let summary = serde_json::to_value(plan.summary()).unwrap();
        assert_eq!(summary["tables"][1]["depends_on"], json!(["users"]));
        assert_eq!(summary["input_records"], json!(2));
    }
}
