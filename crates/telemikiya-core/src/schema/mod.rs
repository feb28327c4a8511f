//! Declarative schema model and migration planning.
//!
//! Migration is a two-step pipeline:
//!
//! 1. **Diff**: [`BaseDiffer`] compares the deployed [`Schema`] with
//!    [`desired_schema`] and emits a [`Plan`] for whatever is missing.
//!    [`EmbeddingDimensionsHook`] wraps it, stamps the configured vector
//!    dimensions into the `text_embedding` column, and adds a column
//!    rewrite when the deployed dimensions differ.
//! 2. **Apply**: [`guard::apply_guarded`] refuses plans that would change
//!    the embedding column type unless the operator allowed clearing
//!    stored embeddings.
//!
//! The desired schema:
//!
//! | Table | Columns |
//! |-------|---------|
//! | `dialog` | `id`, `title`, `type`, `updated_at` |
//! | `message` | `id`, `msg_id`, `dialog_id`, `text`, `text_embedding`, `has_media`, `media_info`, `sent_at` |

pub mod guard;

use serde::{Deserialize, Serialize};

pub const DIALOG_TABLE: &str = "dialog";
pub const MESSAGE_TABLE: &str = "message";
pub const EMBEDDING_COLUMN: &str = "text_embedding";
pub const EMBEDDING_INDEX: &str = "message_text_embedding";

/// Column type placeholder replaced by [`EmbeddingDimensionsHook`].
pub const EMBEDDING_TYPE_TEMPLATE: &str = "vector";

/// Concrete column type for `dims`-dimensional embeddings.
pub fn embedding_column_type(dims: usize) -> String {
    format!("vector({})", dims)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    /// Trailing constraint text, e.g. `PRIMARY KEY`.
    pub constraint: Option<String>,
    pub default: Option<String>,
}

impl Column {
    fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable: false,
            constraint: None,
            default: None,
        }
    }

    fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn constraint(mut self, c: &str) -> Self {
        self.constraint = Some(c.to_string());
        self
    }

    fn with_default(mut self, d: &str) -> Self {
        self.default = Some(d.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub unique: bool,
    /// Everything after `ON <table>`, e.g. `USING hnsw (text_embedding vector_cosine_ops)`.
    pub definition: String,
}

impl Index {
    fn new(name: &str, definition: &str) -> Self {
        Self {
            name: name.to_string(),
            unique: false,
            definition: definition.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    /// Deployed type of the embedding column, if the column exists.
    pub fn embedding_type(&self) -> Option<&str> {
        self.table(MESSAGE_TABLE)
            .and_then(|t| t.column(EMBEDDING_COLUMN))
            .map(|c| c.sql_type.as_str())
    }

    /// Apply a plan to this model, mirroring what the database would do.
    pub fn apply_plan(&mut self, plan: &Plan) {
        for change in &plan.changes {
            match change {
                Change::CreateTable(table) => {
                    if self.table(&table.name).is_none() {
                        self.tables.push(table.clone());
                    }
                }
                Change::ModifyTable { table, changes } => {
                    let Some(t) = self.table_mut(table) else {
                        continue;
                    };
                    for tc in changes {
                        match tc {
                            TableChange::AddColumn(col) => {
                                if t.column(&col.name).is_none() {
                                    t.columns.push(col.clone());
                                }
                            }
                            TableChange::ModifyColumn { column, .. } => {
                                if let Some(existing) =
                                    t.columns.iter_mut().find(|c| c.name == column.name)
                                {
                                    *existing = column.clone();
                                }
                            }
                            TableChange::AddIndex(index) => {
                                if t.index(&index.name).is_none() {
                                    t.indexes.push(index.clone());
                                }
                            }
                            TableChange::DropIndex(name) => t.indexes.retain(|i| &i.name != name),
                        }
                    }
                }
            }
        }
    }
}

/// One step of a migration plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    CreateTable(Table),
    ModifyTable {
        table: String,
        changes: Vec<TableChange>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableChange {
    AddColumn(Column),
    /// Replace a column's type. `previous_type` is what is deployed now.
    ModifyColumn {
        column: Column,
        previous_type: String,
    },
    AddIndex(Index),
    DropIndex(String),
}

/// An ordered list of schema changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub changes: Vec<Change>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The `(from, to)` types if this plan rewrites the embedding column.
    pub fn embedding_type_change(&self) -> Option<(&str, &str)> {
        self.changes.iter().find_map(|change| match change {
            Change::ModifyTable { table, changes } if table == MESSAGE_TABLE => {
                changes.iter().find_map(|tc| match tc {
                    TableChange::ModifyColumn {
                        column,
                        previous_type,
                    } if column.name == EMBEDDING_COLUMN => {
                        Some((previous_type.as_str(), column.sql_type.as_str()))
                    }
                    _ => None,
                })
            }
            _ => None,
        })
    }

    /// Render the plan as PostgreSQL DDL, in order.
    pub fn to_sql(&self) -> Vec<String> {
        let mut stmts = Vec::new();
        for change in &self.changes {
            match change {
                Change::CreateTable(table) => {
                    let cols: Vec<String> = table.columns.iter().map(column_sql).collect();
                    stmts.push(format!(
                        "CREATE TABLE IF NOT EXISTS {} ({})",
                        table.name,
                        cols.join(", ")
                    ));
                    for index in &table.indexes {
                        stmts.push(index_sql(&table.name, index));
                    }
                }
                Change::ModifyTable { table, changes } => {
                    for tc in changes {
                        stmts.push(match tc {
                            TableChange::AddColumn(col) => {
                                format!("ALTER TABLE {} ADD COLUMN {}", table, column_sql(col))
                            }
                            TableChange::ModifyColumn { column, .. } => format!(
                                "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                                table, column.name, column.sql_type
                            ),
                            TableChange::AddIndex(index) => index_sql(table, index),
                            TableChange::DropIndex(name) => {
                                format!("DROP INDEX IF EXISTS {}", name)
                            }
                        });
                    }
                }
            }
        }
        stmts
    }
}

fn column_sql(col: &Column) -> String {
    let mut sql = format!("{} {}", col.name, col.sql_type);
    if !col.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(d) = &col.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(d);
    }
    if let Some(c) = &col.constraint {
        sql.push(' ');
        sql.push_str(c);
    }
    sql
}

fn index_sql(table: &str, index: &Index) -> String {
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} {}",
        if index.unique { "UNIQUE " } else { "" },
        index.name,
        table,
        index.definition
    )
}

/// The schema Telemikiya expects, with the embedding column type left as
/// [`EMBEDDING_TYPE_TEMPLATE`].
pub fn desired_schema() -> Schema {
    let dialog = Table {
        name: DIALOG_TABLE.to_string(),
        columns: vec![
            Column::new("id", "bigint").constraint("PRIMARY KEY"),
            Column::new("title", "text"),
            Column::new("type", "text"),
            Column::new("updated_at", "timestamp with time zone"),
        ],
        indexes: vec![],
    };
    let message = Table {
        name: MESSAGE_TABLE.to_string(),
        columns: vec![
            Column::new("id", "uuid").constraint("PRIMARY KEY"),
            Column::new("msg_id", "integer"),
            Column::new("dialog_id", "bigint").constraint("REFERENCES dialog(id)"),
            Column::new("text", "text").with_default("''"),
            Column::new(EMBEDDING_COLUMN, EMBEDDING_TYPE_TEMPLATE).nullable(),
            Column::new("has_media", "boolean").with_default("false"),
            Column::new("media_info", "jsonb").with_default("'{\"type\":\"none\"}'"),
            Column::new("sent_at", "timestamp with time zone"),
        ],
        indexes: vec![
            Index {
                unique: true,
                ..Index::new("message_msg_id_dialog_id", "(msg_id, dialog_id)")
            },
            Index::new("message_text", "USING pgroonga (text)"),
            Index::new(
                EMBEDDING_INDEX,
                "USING hnsw (text_embedding vector_cosine_ops)",
            ),
            Index::new("message_sent_at", "(sent_at)"),
        ],
    };
    Schema {
        tables: vec![dialog, message],
    }
}

// ============ Differs ============

/// Computes the plan that brings `current` up to `desired`.
pub trait Differ {
    fn diff(&self, current: &Schema, desired: &Schema) -> Plan;
}

/// Additive differ: creates missing tables, columns, and indexes.
///
/// Never drops or rewrites anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseDiffer;

impl Differ for BaseDiffer {
    fn diff(&self, current: &Schema, desired: &Schema) -> Plan {
        let mut plan = Plan::default();
        for want in &desired.tables {
            let Some(have) = current.table(&want.name) else {
                plan.changes.push(Change::CreateTable(want.clone()));
                continue;
            };
            let mut changes = Vec::new();
            for col in &want.columns {
                if have.column(&col.name).is_none() {
                    changes.push(TableChange::AddColumn(col.clone()));
                }
            }
            for index in &want.indexes {
                if have.index(&index.name).is_none() {
                    changes.push(TableChange::AddIndex(index.clone()));
                }
            }
            if !changes.is_empty() {
                plan.changes.push(Change::ModifyTable {
                    table: want.name.clone(),
                    changes,
                });
            }
        }
        plan
    }
}

/// Diff hook that makes the embedding column follow the configured
/// dimensions.
pub struct EmbeddingDimensionsHook<D> {
    inner: D,
    dims: usize,
}

impl<D: Differ> EmbeddingDimensionsHook<D> {
    pub fn new(inner: D, dims: usize) -> Self {
        Self { inner, dims }
    }
}

impl<D: Differ> Differ for EmbeddingDimensionsHook<D> {
    fn diff(&self, current: &Schema, desired: &Schema) -> Plan {
        let wanted_type = embedding_column_type(self.dims);
        let mut desired = desired.clone();
        let mut embedding_column = None;
        for table in desired.tables.iter_mut().filter(|t| t.name == MESSAGE_TABLE) {
            for col in table.columns.iter_mut().filter(|c| c.name == EMBEDDING_COLUMN) {
                col.sql_type = wanted_type.clone();
                embedding_column = Some(col.clone());
            }
        }

        let mut plan = self.inner.diff(current, &desired);

        let (Some(deployed), Some(column)) = (current.embedding_type(), embedding_column) else {
            return plan;
        };
        if same_type(deployed, &wanted_type) {
            return plan;
        }
        let index = desired
            .table(MESSAGE_TABLE)
            .and_then(|t| t.index(EMBEDDING_INDEX))
            .cloned();
        let mut changes = vec![
            TableChange::DropIndex(EMBEDDING_INDEX.to_string()),
            TableChange::ModifyColumn {
                column,
                previous_type: deployed.to_string(),
            },
        ];
        if let Some(index) = index {
            // The base differ already scheduled this index if it was missing.
            strip_index(&mut plan, EMBEDDING_INDEX);
            changes.push(TableChange::AddIndex(index));
        }
        plan.changes.push(Change::ModifyTable {
            table: MESSAGE_TABLE.to_string(),
            changes,
        });
        plan
    }
}

fn same_type(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn strip_index(plan: &mut Plan, name: &str) {
    for change in plan.changes.iter_mut() {
        if let Change::ModifyTable { changes, .. } = change {
            changes.retain(|tc| !matches!(tc, TableChange::AddIndex(i) if i.name == name));
        }
    }
    plan.changes
        .retain(|c| !matches!(c, Change::ModifyTable { changes, .. } if changes.is_empty()));
}

/// Plan a migration of `current` to the desired schema at `dims`.
pub fn plan_migration(current: &Schema, dims: usize) -> Plan {
    EmbeddingDimensionsHook::new(BaseDiffer, dims).diff(current, &desired_schema())
}
