use std::error::Error as StdError;
use std::fmt;

/// Coarse classification of a store failure, derived from its SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed statement (42601)
    Syntax,
    /// Unknown table, column or function, permission problems
    Semantic,
    /// Integrity constraint violation, e.g. a duplicate observation key
    Constraint,
    /// Invalid value or cast (class 22)
    Data,
    /// Aborted transaction, serialization failure, deadlock
    Transaction,
    Connection,
    /// Out of memory, disk full, server shutting down
    Resource,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Syntax => "Syntax Error",
            ErrorCategory::Semantic => "Semantic Error",
            ErrorCategory::Constraint => "Constraint Violation",
            ErrorCategory::Data => "Data Error",
            ErrorCategory::Transaction => "Transaction Error",
            ErrorCategory::Connection => "Connection Error",
            ErrorCategory::Resource => "Resource Error",
            ErrorCategory::Unknown => "Error",
        };
        f.write_str(label)
    }
}

/// A PostgreSQL error with the fields useful for diagnosing store writes.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredError {
    pub category: ErrorCategory,
    pub severity: String,
    /// SQLSTATE, empty for client-side failures
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub table: Option<String>,
    pub constraint: Option<String>,
    /// 1-based byte offset reported by the server
    pub position: Option<u32>,
    pub line: Option<usize>,
    pub col: Option<usize>,
}

impl StructuredError {
    /// Build from a driver error; `query` is the statement that failed and
    /// is only used to turn the error position into line/column.
    pub fn from_pg_error(err: &tokio_postgres::Error, query: &str) -> Self {
        let Some(db_err) = err.as_db_error() else {
            let category = if err.source().is_some() || err.is_closed() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            return StructuredError {
                category,
                detail: err.source().map(|e| e.to_string()),
                ..Self::from_string(err.to_string())
            };
        };

        let code = db_err.code().code().to_string();
        let position = db_err.position().and_then(|p| match p {
            tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
            tokio_postgres::error::ErrorPosition::Internal { .. } => None,
        });
        let (line, col) = match position {
            Some(pos) => byte_offset_to_line_col(query, pos as usize),
            None => (None, None),
        };

        StructuredError {
            category: categorize_sqlstate(&code),
            severity: db_err.severity().to_string(),
            code,
            message: db_err.message().to_string(),
            detail: db_err.detail().map(str::to_string),
            hint: db_err.hint().map(str::to_string),
            table: db_err.table().map(str::to_string),
            constraint: db_err.constraint().map(str::to_string),
            position,
            line,
            col,
        }
    }

    pub fn from_string(msg: impl Into<String>) -> Self {
        StructuredError {
            category: ErrorCategory::Unknown,
            severity: "ERROR".to_string(),
            code: String::new(),
            message: msg.into(),
            detail: None,
            hint: None,
            table: None,
            constraint: None,
            position: None,
            line: None,
            col: None,
        }
    }

    /// Failures that may succeed when the batch is submitted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Connection | ErrorCategory::Transaction | ErrorCategory::Resource
        )
    }

    /// Multi-line report for the CLI.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if let (Some(line), Some(col)) = (self.line, self.col) {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }
        match (&self.table, &self.constraint) {
            (Some(table), Some(constraint)) => {
                lines.push(format!("  Constraint: {} on {}", constraint, table))
            }
            (Some(table), None) => lines.push(format!("  Table: {}", table)),
            (None, Some(constraint)) => lines.push(format!("  Constraint: {}", constraint)),
            (None, None) => {}
        }

        lines.join("\n")
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for StructuredError {}

/// Convert a 1-based byte offset into 1-based (line, column).
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || query.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(query.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

fn categorize_sqlstate(code: &str) -> ErrorCategory {
    let Some(class) = code.get(..2) else {
        return ErrorCategory::Unknown;
    };
    match class {
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        "42" => ErrorCategory::Semantic,
        "23" => ErrorCategory::Constraint,
        "22" => ErrorCategory::Data,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        "53" | "57" => ErrorCategory::Resource,
        _ => ErrorCategory::Unknown,
    }
}
