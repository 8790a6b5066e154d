//! SQL classification: operation kind and referenced tables.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{visit_relations, ObjectName, Query, Statement, Visit, Visitor};
use sqlparser::dialect::{GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::{Parser, ParserError};
use thiserror::Error;

/// SQL operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlOp {
    Insert,
    Delete,
    Update,
    Select,
    Ddl,
    Unknown,
}

impl SqlOp {
    /// Returns the operation as a metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOp::Insert => "insert",
            SqlOp::Delete => "delete",
            SqlOp::Update => "update",
            SqlOp::Select => "select",
            SqlOp::Ddl => "ddl",
            SqlOp::Unknown => "unknown",
        }
    }

    /// INSERT, UPDATE or DELETE.
    pub fn is_write(&self) -> bool {
        matches!(self, SqlOp::Insert | SqlOp::Update | SqlOp::Delete)
    }
}

impl fmt::Display for SqlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Grammar used to parse query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlDialect {
    #[default]
    MySql,
    Postgres,
    Sqlite,
    Generic,
}

impl SqlDialect {
    fn parse(self, sql: &str) -> Result<Vec<Statement>, ParserError> {
        match self {
            SqlDialect::MySql => Parser::parse_sql(&MySqlDialect {}, sql),
            SqlDialect::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
            SqlDialect::Sqlite => Parser::parse_sql(&SQLiteDialect {}, sql),
            SqlDialect::Generic => Parser::parse_sql(&GenericDialect {}, sql),
        }
    }
}

/// Why a query could not be classified.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("sql parse error: {0}")]
    Parse(#[from] ParserError),

    #[error("query contains no statement")]
    Empty,
}

static SHARD_SUFFIX_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?)_\d+$").unwrap());

/// Maps physical table names onto the logical names used for aggregation.
///
/// Called on every table name the classifier returns. The default is the
/// identity function.
#[derive(Clone)]
pub struct TableNormalizer(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl TableNormalizer {
    /// Wrap an arbitrary normalization function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Leave table names untouched.
    pub fn identity() -> Self {
        Self::new(str::to_owned)
    }

    /// Fold a trailing `_<digits>` shard suffix: `t_user_07` becomes `t_user`.
    ///
    /// Applies to every name with a numeric suffix, so tables like
    /// `report_2024` fold as well. Use [`TableNormalizer::new`] for finer rules.
    pub fn shard_suffix() -> Self {
        Self::new(|name| match SHARD_SUFFIX_REGEX.captures(name) {
            Some(caps) => caps[1].to_owned(),
            None => name.to_owned(),
        })
    }

    pub fn apply(&self, name: &str) -> String {
        (self.0)(name)
    }
}

impl Default for TableNormalizer {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for TableNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TableNormalizer(..)")
    }
}

/// Operation kind and referenced tables of one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub op: SqlOp,
    /// Distinct normalized table names in discovery order. Holds at most two
    /// entries for DML since the walk stops at the second distinct table.
    pub tables: Vec<String>,
}

impl Classification {
    /// The first discovered table.
    pub fn primary_table(&self) -> Option<&str> {
        self.tables.first().map(String::as_str)
    }

    pub fn is_multi_table(&self) -> bool {
        self.tables.len() >= 2
    }
}

/// Parses query text into a [`Classification`].
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    dialect: SqlDialect,
    normalizer: TableNormalizer,
}

impl Classifier {
    pub fn new(dialect: SqlDialect, normalizer: TableNormalizer) -> Self {
        Self {
            dialect,
            normalizer,
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Classify `sql`. A batch of several statements classifies as its first
    /// write statement, or as its first statement when none writes.
    ///
    /// Statements of an unrecognized kind (SHOW, SET, ...) classify as
    /// [`SqlOp::Unknown`] with no tables. Only grammar failures are errors.
    pub fn classify(&self, sql: &str) -> Result<Classification, ClassifyError> {
        let statements = self.dialect.parse(sql)?;
        let first = statements.first().ok_or(ClassifyError::Empty)?;
        let stmt = statements
            .iter()
            .find(|stmt| statement_op(stmt).is_write())
            .unwrap_or(first);

        let op = statement_op(stmt);
        let tables = match op {
            SqlOp::Unknown => Vec::new(),
            SqlOp::Ddl => self.ddl_target(stmt).into_iter().collect(),
            _ => self.referenced_tables(stmt),
        };
        Ok(Classification { op, tables })
    }

    /// Walk table references in tree order, left join branch before right,
    /// and stop once two distinct tables are known. References to a CTE
    /// declared in the statement are not tables.
    fn referenced_tables(&self, stmt: &Statement) -> Vec<String> {
        let ctes = cte_names(stmt);
        let mut tables: Vec<String> = Vec::with_capacity(2);
        let _ = visit_relations(stmt, |relation| {
            let is_cte = relation.0.len() == 1
                && base_name(relation)
                    .is_some_and(|name| ctes.iter().any(|cte| cte.eq_ignore_ascii_case(name)));
            if is_cte {
                return ControlFlow::Continue(());
            }
            if let Some(name) = base_name(relation) {
                let name = self.normalizer.apply(name);
                if !tables.contains(&name) {
                    tables.push(name);
                }
            }
            if tables.len() >= 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        tables
    }

    fn ddl_target(&self, stmt: &Statement) -> Option<String> {
        let mut target = None;
        let _ = visit_relations(stmt, |relation| match base_name(relation) {
            Some(name) => {
                target = Some(name.to_owned());
                ControlFlow::Break(())
            }
            None => ControlFlow::Continue(()),
        });

        let target = target.or_else(|| match stmt {
            Statement::Drop { names, .. } => names.first().and_then(base_name).map(str::to_owned),
            _ => None,
        });
        target.map(|name| self.normalizer.apply(&name))
    }
}

fn statement_op(stmt: &Statement) -> SqlOp {
    match stmt {
        Statement::Query(_) => SqlOp::Select,
        Statement::Insert { .. } => SqlOp::Insert,
        Statement::Update { .. } => SqlOp::Update,
        Statement::Delete { .. } => SqlOp::Delete,
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => SqlOp::Ddl,
        _ => SqlOp::Unknown,
    }
}

/// Collects the aliases of every `WITH` clause in a statement.
#[derive(Default)]
struct CteNames(Vec<String>);

impl Visitor for CteNames {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            self.0
                .extend(with.cte_tables.iter().map(|cte| cte.alias.name.value.clone()));
        }
        ControlFlow::Continue(())
    }
}

fn cte_names(stmt: &Statement) -> Vec<String> {
    let mut names = CteNames::default();
    let _ = stmt.visit(&mut names);
    names.0
}

/// Unqualified table name: `db.t_user` yields `t_user`.
fn base_name(name: &ObjectName) -> Option<&str> {
    name.0.last().map(|ident| ident.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> Classification {
        Classifier::default().classify(sql).expect("classifiable")
    }

    #[test]
    fn test_single_table_dml() {
        let cases = [
            ("SELECT * FROM users WHERE id = 1", SqlOp::Select),
            ("select id from users", SqlOp::Select),
            ("INSERT INTO users (name) VALUES ('test')", SqlOp::Insert),
            ("UPDATE users SET name = 'test' WHERE id = 1", SqlOp::Update),
            ("DELETE FROM users WHERE id = 1", SqlOp::Delete),
        ];
        for (sql, op) in cases {
            let c = classify(sql);
            assert_eq!(c.op, op, "{sql}");
            assert_eq!(c.tables, vec!["users".to_string()], "{sql}");
            assert!(!c.is_multi_table());
        }
    }

    #[test]
    fn test_join_collects_both_sides_in_order() {
        let c = classify("SELECT * FROM orders o JOIN customers c ON o.cid = c.id");
        assert_eq!(c.op, SqlOp::Select);
        assert_eq!(c.tables, vec!["orders".to_string(), "customers".to_string()]);
        assert!(c.is_multi_table());
        assert_eq!(c.primary_table(), Some("orders"));
    }

    #[test]
    fn test_walk_stops_at_second_distinct_table() {
        let c = classify(
            "SELECT * FROM a JOIN b ON a.id = b.aid JOIN c ON b.id = c.bid JOIN d ON c.id = d.cid",
        );
        assert_eq!(c.tables, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_self_join_is_single_table() {
        let c = classify("SELECT * FROM emp e JOIN emp m ON e.manager_id = m.id");
        assert_eq!(c.tables, vec!["emp".to_string()]);
        assert!(!c.is_multi_table());
    }

    #[test]
    fn test_cte_alias_is_not_a_table() {
        let c = classify("WITH recent AS (SELECT * FROM orders) SELECT * FROM recent");
        assert_eq!(c.op, SqlOp::Select);
        assert_eq!(c.tables, vec!["orders".to_string()]);
        assert!(!c.is_multi_table());

        let c = classify(
            "WITH recent AS (SELECT * FROM orders) \
             SELECT * FROM recent r JOIN customers c ON r.cid = c.id",
        );
        assert_eq!(c.tables, vec!["orders".to_string(), "customers".to_string()]);
    }

    #[test]
    fn test_batch_classifies_as_its_write() {
        let c = classify("SELECT * FROM a; DELETE FROM b WHERE id = 1");
        assert_eq!(c.op, SqlOp::Delete);
        assert_eq!(c.tables, vec!["b".to_string()]);

        let c = classify("SELECT * FROM a; SELECT * FROM b");
        assert_eq!(c.op, SqlOp::Select);
        assert_eq!(c.tables, vec!["a".to_string()]);
    }

    #[test]
    fn test_qualified_name_uses_base_table() {
        let c = classify("SELECT * FROM shop.orders");
        assert_eq!(c.primary_table(), Some("orders"));
    }

    #[test]
    fn test_create_index_targets_table() {
        let c = classify("create index t_agency_email_index\n    on t_agency (email);\n");
        assert_eq!(c.op, SqlOp::Ddl);
        assert_eq!(c.tables, vec!["t_agency".to_string()]);
    }

    #[test]
    fn test_create_table_is_ddl() {
        let c = classify("CREATE TABLE t_order (id BIGINT PRIMARY KEY)");
        assert_eq!(c.op, SqlOp::Ddl);
        assert_eq!(c.primary_table(), Some("t_order"));
    }

    #[test]
    fn test_unrecognized_statement_is_unknown() {
        let c = classify("SHOW TABLES");
        assert_eq!(c.op, SqlOp::Unknown);
        assert!(c.tables.is_empty());
    }

    #[test]
    fn test_unparsable_sql_is_an_error() {
        let classifier = Classifier::default();
        assert!(matches!(
            classifier.classify("SELEKT nonsense FROM"),
            Err(ClassifyError::Parse(_))
        ));
        assert!(matches!(classifier.classify(""), Err(ClassifyError::Empty)));
    }

    #[test]
    fn test_shard_suffix_normalization() {
        let classifier = Classifier::new(SqlDialect::MySql, TableNormalizer::shard_suffix());
        let c = classifier
            .classify("UPDATE t_user_07 SET name = 'x' WHERE id = 1")
            .unwrap();
        assert_eq!(c.op, SqlOp::Update);
        assert_eq!(c.tables, vec!["t_user".to_string()]);

        // both shards fold into one logical table
        let c = classifier
            .classify("SELECT * FROM t_user_00 a JOIN t_user_01 b ON a.id = b.id")
            .unwrap();
        assert_eq!(c.tables, vec!["t_user".to_string()]);
    }

    #[test]
    fn test_custom_normalizer() {
        let normalizer = TableNormalizer::new(|name| {
            if name.contains("t_user_") {
                "t_user".to_string()
            } else {
                name.to_string()
            }
        });
        assert_eq!(normalizer.apply("t_user_12"), "t_user");
        assert_eq!(normalizer.apply("orders"), "orders");
        assert_eq!(TableNormalizer::identity().apply("t_user_12"), "t_user_12");
    }

    #[test]
    fn test_postgres_dialect() {
        let classifier = Classifier::new(SqlDialect::Postgres, TableNormalizer::identity());
        let c = classifier
            .classify(r#"SELECT "id" FROM "grades" WHERE student_id = $1"#)
            .unwrap();
        assert_eq!(c.op, SqlOp::Select);
        assert_eq!(c.primary_table(), Some("grades"));
    }

    #[test]
    fn test_op_labels() {
        assert_eq!(SqlOp::Ddl.to_string(), "ddl");
        assert!(SqlOp::Delete.is_write());
        assert!(!SqlOp::Select.is_write());
        assert!(!SqlOp::Ddl.is_write());
    }
}
