//! PostgreSQL SQL generation for rmq2db-rdbc
//!
//! - Identifier quoting (every table and column name goes through
//!   [`PostgresDialect::quote_identifier`])
//! - COPY / staging-table statements for the bulk transport
//! - Multi-row upsert statements built with sea-query

use sea_query::{Alias, Expr, IntoIden, OnConflict, PostgresQueryBuilder, Query, TableRef};

/// Maximum number of bind parameters in one PostgreSQL statement
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Get the dialect name
    pub fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    /// Quote an identifier (table, column name)
    pub fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Quote an optionally schema-qualified table name
    pub fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// Comma-separated quoted column list
    pub fn column_list<S: AsRef<str>>(&self, columns: &[S]) -> String {
        columns
            .iter()
            .map(|c| self.quote_identifier(c.as_ref()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Get the placeholder for a parameter
    pub fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    /// `COPY <table> (<columns>) FROM STDIN` (text format)
    pub fn copy_from_stdin_sql<S: AsRef<str>>(&self, table_ref: &str, columns: &[S]) -> String {
        format!(
            "COPY {} ({}) FROM STDIN",
            table_ref,
            self.column_list(columns)
        )
    }

    /// Session-scoped staging table shaped like the target, created once per session
    pub fn create_staging_sql(&self, staging: &str, target_ref: &str) -> String {
        format!(
            "CREATE TEMP TABLE IF NOT EXISTS {} (LIKE {} INCLUDING DEFAULTS)",
            self.quote_identifier(staging),
            target_ref
        )
    }

    /// Move every staged row into the target, updating value columns on key conflict
    pub fn merge_from_staging_sql<S: AsRef<str>>(
        &self,
        target_ref: &str,
        staging: &str,
        key_columns: &[S],
        value_columns: &[S],
    ) -> String {
        let columns = key_columns
            .iter()
            .chain(value_columns)
            .map(|c| self.quote_identifier(c.as_ref()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO {target} ({columns}) SELECT {columns} FROM {staging} {conflict}",
            target = target_ref,
            columns = columns,
            staging = self.quote_identifier(staging),
            conflict = self.on_conflict_clause(key_columns, value_columns),
        )
    }

    /// `ON CONFLICT (<keys>) DO UPDATE SET v = EXCLUDED.v`, or `DO NOTHING`
    /// when there is nothing to update
    pub fn on_conflict_clause<S: AsRef<str>>(&self, key_columns: &[S], value_columns: &[S]) -> String {
        if value_columns.is_empty() {
            return format!("ON CONFLICT ({}) DO NOTHING", self.column_list(key_columns));
        }

        let assignments = value_columns
            .iter()
            .map(|c| {
                let quoted = self.quote_identifier(c.as_ref());
                format!("{} = EXCLUDED.{}", quoted, quoted)
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "ON CONFLICT ({}) DO UPDATE SET {}",
            self.column_list(key_columns),
            assignments
        )
    }

    /// `TRUNCATE <table>`
    pub fn truncate_sql(&self, table: &str) -> String {
        format!("TRUNCATE {}", self.quote_identifier(table))
    }

    /// Multi-row parameterized upsert for `rows` rows:
    /// `INSERT INTO t (k.., v..) VALUES ($1, ..), (..) ON CONFLICT (k..) DO UPDATE SET v = excluded.v`
    pub fn upsert_sql<S: AsRef<str>>(
        &self,
        schema: Option<&str>,
        table: &str,
        key_columns: &[S],
        value_columns: &[S],
        rows: usize,
    ) -> String {
        let tbl = sea_table_ref(schema, table);
        let width = key_columns.len() + value_columns.len();

        let col_idens: Vec<_> = key_columns
            .iter()
            .chain(value_columns)
            .map(|c| Alias::new(c.as_ref()).into_iden())
            .collect();
        let pk_idens: Vec<_> = key_columns
            .iter()
            .map(|c| Alias::new(c.as_ref()).into_iden())
            .collect();
        let update_cols: Vec<_> = value_columns
            .iter()
            .map(|c| Alias::new(c.as_ref()).into_iden())
            .collect();

        let mut on_conflict = OnConflict::columns(pk_idens);
        if update_cols.is_empty() {
            on_conflict.do_nothing();
        } else {
            on_conflict.update_columns(update_cols);
        }

        let mut stmt = Query::insert();
        stmt.into_table(tbl).columns(col_idens);
        for row in 0..rows {
            let values: Vec<_> = (1..=width)
                .map(|col| Expr::cust(self.placeholder(row * width + col)))
                .collect();
            stmt.values_panic(values);
        }
        stmt.on_conflict(on_conflict.to_owned());

        stmt.to_string(PostgresQueryBuilder)
    }

    /// Largest page that keeps one upsert statement under the bind-parameter limit
    pub fn max_rows_per_statement(&self, columns: usize) -> usize {
        (MAX_BIND_PARAMS / columns.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        let d = PostgresDialect;
        assert_eq!(d.quote_identifier("temp"), "\"temp\"");
        assert_eq!(d.quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_qualified_table() {
        let d = PostgresDialect;
        assert_eq!(d.qualified_table(None, "strom"), "\"strom\"");
        assert_eq!(
            d.qualified_table(Some("iot"), "strom"),
            "\"iot\".\"strom\""
        );
    }

    #[test]
    fn test_merge_sql() {
        let d = PostgresDialect;
        let sql = d.merge_from_staging_sql(
            "\"roomtemp\"",
            "temp_roomtemp",
            &["time", "room_id"],
            &["temp"],
        );
        assert_eq!(
            sql,
            "INSERT INTO \"roomtemp\" (\"time\", \"room_id\", \"temp\") \
             SELECT \"time\", \"room_id\", \"temp\" FROM \"temp_roomtemp\" \
             ON CONFLICT (\"time\", \"room_id\") DO UPDATE SET \"temp\" = EXCLUDED.\"temp\""
        );
    }

    #[test]
    fn test_conflict_clause_without_values() {
        let d = PostgresDialect;
        let keys = ["id"];
        let values: [&str; 0] = [];
        assert_eq!(
            d.on_conflict_clause(&keys, &values),
            "ON CONFLICT (\"id\") DO NOTHING"
        );
    }

    #[test]
    fn test_upsert_sql_numbers_placeholders_across_rows() {
        let d = PostgresDialect;
        let sql = d.upsert_sql(None, "strom", &["time"], &["stand", "leistung"], 2);
        assert!(sql.starts_with("INSERT INTO \"strom\""));
        assert!(sql.contains("$1"));
        assert!(sql.contains("$6"));
        assert!(!sql.contains("$7"));
        assert!(sql.contains("ON CONFLICT"));
        assert!(sql.contains("\"leistung\""));
    }

    #[test]
    fn test_max_rows_per_statement() {
        let d = PostgresDialect;
        assert_eq!(d.max_rows_per_statement(3), 21845);
        assert_eq!(d.max_rows_per_statement(0), MAX_BIND_PARAMS);
    }
}
