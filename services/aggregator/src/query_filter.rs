//! Query filter and the parameterized statement builder behind it.
//!
//! Filter values never reach the SQL text. [`LogQuery`] only ever appends
//! fixed column names, operators and `$n` placeholders; the values travel
//! alongside as [`QueryArg`]s and are bound by the backend.

use chrono::{DateTime, Utc};

/// Table holding stored log entries
pub const LOGS_TABLE: &str = "logs";

/// Columns selected for every log query, in `StoredLogEntry` order
pub const LOG_COLUMNS: &str = "id, timestamp, service, level, message, fields, created_at";

/// Predicate and pagination for a log query.
///
/// Empty `service`/`level` and absent time bounds are wildcards. A `limit`
/// or `offset` that is not positive is treated as unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub service: String,
    pub level: String,
    /// Inclusive lower bound on the event timestamp
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the event timestamp
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn effective_limit(&self) -> Option<usize> {
        (self.limit > 0).then_some(self.limit as usize)
    }

    pub fn effective_offset(&self) -> usize {
        if self.offset > 0 {
            self.offset as usize
        } else {
            0
        }
    }

    /// In-process evaluation of the predicate part of the filter
    pub fn matches(&self, timestamp: DateTime<Utc>, service: &str, level: &str) -> bool {
        if !self.service.is_empty() && self.service != service {
            return false;
        }
        if !self.level.is_empty() && self.level != level {
            return false;
        }
        if let Some(start) = self.start {
            if timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if timestamp > end {
                return false;
            }
        }
        true
    }

    /// Render the filter as a parameterized `SELECT` over the logs table.
    ///
    /// Clause order is fixed: service, level, start, end, ordering, limit,
    /// offset.
    pub fn to_query(&self) -> LogQuery {
        let mut query = LogQuery::select(LOG_COLUMNS, LOGS_TABLE);

        if !self.service.is_empty() {
            query.push_predicate("service", "=", QueryArg::Text(self.service.clone()));
        }
        if !self.level.is_empty() {
            query.push_predicate("level", "=", QueryArg::Text(self.level.clone()));
        }
        if let Some(start) = self.start {
            query.push_predicate("timestamp", ">=", QueryArg::Timestamp(start));
        }
        if let Some(end) = self.end {
            query.push_predicate("timestamp", "<=", QueryArg::Timestamp(end));
        }

        query.push_order_by("timestamp DESC");

        if self.limit > 0 {
            query.push_pagination("LIMIT", self.limit);
        }
        if self.offset > 0 {
            query.push_pagination("OFFSET", self.offset);
        }

        query
    }
}

/// A value bound to a `$n` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArg {
    Text(String),
    Timestamp(DateTime<Utc>),
    Int(i64),
}

/// SQL text plus its positional arguments
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    sql: String,
    args: Vec<QueryArg>,
    has_predicate: bool,
}

impl LogQuery {
    fn select(columns: &'static str, table: &'static str) -> Self {
        Self {
            sql: format!("SELECT {} FROM {}", columns, table),
            args: Vec::new(),
            has_predicate: false,
        }
    }

    fn next_placeholder(&mut self, arg: QueryArg) -> String {
        self.args.push(arg);
        format!("${}", self.args.len())
    }

    fn push_predicate(&mut self, column: &'static str, op: &'static str, arg: QueryArg) {
        let placeholder = self.next_placeholder(arg);
        let joiner = if self.has_predicate { " AND " } else { " WHERE " };
        self.has_predicate = true;
        self.sql.push_str(joiner);
        self.sql.push_str(&format!("{} {} {}", column, op, placeholder));
    }

    fn push_order_by(&mut self, ordering: &'static str) {
        self.sql.push_str(" ORDER BY ");
        self.sql.push_str(ordering);
    }

    fn push_pagination(&mut self, keyword: &'static str, value: i64) {
        let placeholder = self.next_placeholder(QueryArg::Int(value));
        self.sql.push_str(&format!(" {} {}", keyword, placeholder));
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[QueryArg] {
        &self.args
    }

    pub fn into_parts(self) -> (String, Vec<QueryArg>) {
        (self.sql, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BASE: &str = "SELECT id, timestamp, service, level, message, fields, created_at FROM logs";

    #[test]
    fn test_wildcard_filter_has_no_predicate() {
        let query = QueryFilter::new().to_query();
        assert_eq!(query.sql(), format!("{} ORDER BY timestamp DESC", BASE));
        assert!(query.args().is_empty());
    }

    #[test]
    fn test_full_filter_clause_order() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let query = QueryFilter::new()
            .service("api")
            .level("error")
            .start(start)
            .end(end)
            .limit(50)
            .offset(100)
            .to_query();

        assert_eq!(
            query.sql(),
            format!(
                "{} WHERE service = $1 AND level = $2 AND timestamp >= $3 AND timestamp <= $4 \
                 ORDER BY timestamp DESC LIMIT $5 OFFSET $6",
                BASE
            )
        );
        assert_eq!(
            query.args(),
            &[
                QueryArg::Text("api".to_string()),
                QueryArg::Text("error".to_string()),
                QueryArg::Timestamp(start),
                QueryArg::Timestamp(end),
                QueryArg::Int(50),
                QueryArg::Int(100),
            ]
        );
    }

    #[test]
    fn test_placeholders_stay_dense_when_fields_skipped() {
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let query = QueryFilter::new().level("warn").end(end).offset(10).to_query();

        assert_eq!(
            query.sql(),
            format!(
                "{} WHERE level = $1 AND timestamp <= $2 ORDER BY timestamp DESC OFFSET $3",
                BASE
            )
        );
        assert_eq!(query.args().len(), 3);
    }

    #[test]
    fn test_non_positive_pagination_is_omitted() {
        let query = QueryFilter::new().limit(0).offset(-5).to_query();
        assert!(!query.sql().contains("LIMIT"));
        assert!(!query.sql().contains("OFFSET"));

        let query = QueryFilter::new().limit(-1).to_query();
        assert!(!query.sql().contains("LIMIT"));
    }

    #[test]
    fn test_hostile_values_never_reach_sql_text() {
        let hostile = "api'; DROP TABLE logs; --";
        let query = QueryFilter::new().service(hostile).level("$1").to_query();

        assert!(!query.sql().contains("DROP"));
        assert!(!query.sql().contains('\''));
        assert_eq!(query.args()[0], QueryArg::Text(hostile.to_string()));
        assert_eq!(query.args()[1], QueryArg::Text("$1".to_string()));
    }

    #[test]
    fn test_matches_wildcards_and_bounds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        assert!(QueryFilter::new().matches(ts, "", "anything"));
        assert!(QueryFilter::new().service("api").matches(ts, "api", "info"));
        assert!(!QueryFilter::new().service("api").matches(ts, "web", "info"));
        assert!(!QueryFilter::new().level("ERROR").matches(ts, "api", "error"));

        // Bounds are inclusive on both sides
        assert!(QueryFilter::new().start(ts).end(ts).matches(ts, "api", "info"));
        assert!(!QueryFilter::new()
            .start(ts + chrono::Duration::seconds(1))
            .matches(ts, "api", "info"));
        assert!(!QueryFilter::new()
            .end(ts - chrono::Duration::seconds(1))
            .matches(ts, "api", "info"));
    }

    #[test]
    fn test_effective_pagination() {
        assert_eq!(QueryFilter::new().effective_limit(), None);
        assert_eq!(QueryFilter::new().limit(25).effective_limit(), Some(25));
        assert_eq!(QueryFilter::new().offset(-3).effective_offset(), 0);
        assert_eq!(QueryFilter::new().offset(3).effective_offset(), 3);
    }
}
