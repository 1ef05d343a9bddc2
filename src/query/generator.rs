//! Append-only accumulator of query fragments.
//!
//! Compilers only ever add fragments; nothing is removed or rewritten once
//! appended, so a compile tree can be lowered by plain recursive descent.
use indexmap::IndexSet;

use super::Operation;

/// A relation joined to the base table, with its join predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Join {
    pub table: String,
    pub alias: Option<String>,
    pub on: String,
}

impl Join {
    pub fn new(table: impl Into<String>, on: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
            on: on.into(),
        }
    }

    pub fn aliased(table: impl Into<String>, alias: impl Into<String>, on: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: Some(alias.into()),
            on: on.into(),
        }
    }

    fn relation(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} {}", self.table, alias),
            None => self.table.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryGenerator {
    joins: IndexSet<Join>,
    conditions: Vec<String>,
    distinct: IndexSet<String>,
    order_by: Vec<String>,
}

impl QueryGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Joining the same relation twice with the same
    /// predicate is a no-op.
    pub fn add_join(&mut self, join: Join) {
        self.joins.insert(join);
    }

    pub fn add_condition(&mut self, condition: impl Into<String>) {
        self.conditions.push(condition.into());
    }

    pub fn add_distinct(&mut self, column: impl Into<String>) {
        self.distinct.insert(column.into());
    }

    pub fn add_order_by(&mut self, clause: impl Into<String>) {
        self.order_by.push(clause.into());
    }

    pub fn joins(&self) -> impl Iterator<Item = &Join> {
        self.joins.iter()
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn distinct(&self) -> impl Iterator<Item = &String> {
        self.distinct.iter()
    }

    pub fn order_by(&self) -> &[String] {
        &self.order_by
    }

    pub fn has_join(&self, table: &str) -> bool {
        self.joins.iter().any(|j| j.table == table)
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
            && self.conditions.is_empty()
            && self.distinct.is_empty()
            && self.order_by.is_empty()
    }

    pub fn render(&self, table: &str, op: Operation) -> String {
        self.render_with(table, op, &[], None)
    }

    /// Render the final statement.
    ///
    /// `fields` and `limit` only apply to SELECT; DELETE has neither.
    pub fn render_with(
        &self,
        table: &str,
        op: Operation,
        fields: &[String],
        limit: Option<u64>,
    ) -> String {
        match op {
            Operation::Select => self.render_select(table, fields, limit),
            Operation::Remove => self.render_delete(table),
        }
    }

    /// Render a `SELECT COUNT(*)` over the matching rows.
    pub fn render_count(&self, table: &str) -> String {
        if self.distinct.is_empty() {
            let mut parts = vec![format!("SELECT COUNT(*) FROM {}", table)];
            self.push_inner_joins(&mut parts);
            self.push_where(&mut parts, &[]);
            parts.join(" ")
        } else {
            // DISTINCT ON collapses rows, count the collapsed set
            format!(
                "SELECT COUNT(*) FROM ({}) AS entries",
                self.render_select(table, &[], None)
            )
        }
    }

    fn render_select(&self, table: &str, fields: &[String], limit: Option<u64>) -> String {
        let mut parts = Vec::new();

        let mut select_clause = String::from("SELECT ");
        if !self.distinct.is_empty() {
            let cols: Vec<&str> = self.distinct.iter().map(String::as_str).collect();
            select_clause.push_str(&format!("DISTINCT ON ({}) ", cols.join(", ")));
        }
        if fields.is_empty() {
            select_clause.push_str(&format!("{}.*", table));
        } else {
            select_clause.push_str(&fields.join(", "));
        }
        parts.push(select_clause);
        parts.push(format!("FROM {}", table));

        self.push_inner_joins(&mut parts);
        self.push_where(&mut parts, &[]);

        if !self.order_by.is_empty() {
            parts.push(format!("ORDER BY {}", self.order_by.join(", ")));
        }

        if let Some(limit) = limit {
            parts.push(format!("LIMIT {}", limit));
        }

        parts.join(" ")
    }

    fn render_delete(&self, table: &str) -> String {
        let mut parts = vec![format!("DELETE FROM {}", table)];

        if !self.joins.is_empty() {
            let relations: Vec<String> = self.joins.iter().map(Join::relation).collect();
            parts.push(format!("USING {}", relations.join(", ")));
        }

        // join predicates come first so they precede conditions on the joined tables
        let join_predicates: Vec<&str> = self.joins.iter().map(|j| j.on.as_str()).collect();
        self.push_where(&mut parts, &join_predicates);

        parts.join(" ")
    }

    fn push_inner_joins(&self, parts: &mut Vec<String>) {
        for join in &self.joins {
            parts.push(format!("INNER JOIN {} ON {}", join.relation(), join.on));
        }
    }

    fn push_where(&self, parts: &mut Vec<String>, leading: &[&str]) {
        let all: Vec<&str> = leading
            .iter()
            .copied()
            .chain(self.conditions.iter().map(String::as_str))
            .collect();
        if !all.is_empty() {
            parts.push(format!("WHERE {}", all.join(" AND ")));
        }
    }
}
