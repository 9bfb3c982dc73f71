use bytes::Bytes;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use super::{parse_route_hint, Classifier, RouteHint, TransactionEffect};
use crate::protocol::{ClientCommand, Command};

/// Functions whose result depends on the connection that evaluates them
const CONNECTION_BOUND_FUNCTIONS: &[&str] = &[
    "LAST_INSERT_ID",
    "FOUND_ROWS",
    "ROW_COUNT",
    "GET_LOCK",
    "RELEASE_LOCK",
    "RELEASE_ALL_LOCKS",
    "IS_FREE_LOCK",
    "IS_USED_LOCK",
    "@@IDENTITY",
    "NEXTVAL",
];

/// Keyword and AST based classifier for MySQL text queries
pub struct SqlClassifier {
    dialect: MySqlDialect,
}

impl SqlClassifier {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    fn query_text(payload: &[u8]) -> Option<String> {
        match ClientCommand::parse(&Bytes::copy_from_slice(payload)) {
            ClientCommand::Query(sql) => Some(sql),
            _ => None,
        }
    }

    fn is_read_only_select(&self, sql: &str) -> bool {
        let upper = sql.to_uppercase();
        if CONNECTION_BOUND_FUNCTIONS.iter().any(|f| upper.contains(f)) || upper.contains(":=") {
            return false;
        }

        match Parser::parse_sql(&self.dialect, sql) {
            Ok(statements) => !statements.is_empty() && statements.iter().all(statement_is_read_only),
            Err(e) => {
                debug!(error = %e, "Unparsable SELECT routed to primary");
                false
            }
        }
    }
}

impl Default for SqlClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for SqlClassifier {
    fn is_session_mutating(&self, payload: &[u8]) -> bool {
        match payload.first().map(|b| Command::from(*b)) {
            Some(Command::InitDb) => true,
            Some(Command::Query) => Self::query_text(payload)
                .map(|sql| matches!(first_keyword(&sql).as_str(), "SET" | "USE"))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn classify_read_only(&self, payload: &[u8]) -> bool {
        let Some(sql) = Self::query_text(payload) else {
            return false;
        };

        match first_keyword(&sql).as_str() {
            "SHOW" | "DESCRIBE" | "DESC" => true,
            "EXPLAIN" => !strip_leading_comments(&sql)
                .to_uppercase()
                .contains("ANALYZE"),
            "SELECT" | "WITH" | "(" => self.is_read_only_select(&sql),
            _ => false,
        }
    }

    fn transaction_effect(&self, payload: &[u8]) -> TransactionEffect {
        let Some(sql) = Self::query_text(payload) else {
            return TransactionEffect::None;
        };

        let normalized: String = strip_leading_comments(&sql)
            .to_uppercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        if normalized.starts_with("BEGIN") || normalized.starts_with("START TRANSACTION") {
            TransactionEffect::Begin
        } else if normalized.starts_with("ROLLBACK TO") {
            TransactionEffect::None
        } else if normalized.starts_with("COMMIT") || normalized.starts_with("ROLLBACK") {
            TransactionEffect::End
        } else if let Some(value) = autocommit_value(&normalized) {
            if value {
                TransactionEffect::EnableAutocommit
            } else {
                TransactionEffect::DisableAutocommit
            }
        } else {
            TransactionEffect::None
        }
    }

    fn route_hint(&self, payload: &[u8]) -> Option<RouteHint> {
        Self::query_text(payload).and_then(|sql| parse_route_hint(&sql))
    }

    fn database_change(&self, payload: &[u8]) -> Option<String> {
        match ClientCommand::parse(&Bytes::copy_from_slice(payload)) {
            ClientCommand::InitDb(db) => Some(db),
            ClientCommand::Query(sql) => use_target(&sql),
            _ => None,
        }
    }
}

/// Database named by a `USE db` statement
fn use_target(sql: &str) -> Option<String> {
    let body = strip_leading_comments(sql);
    let keyword = body.get(..3)?;
    if !keyword.eq_ignore_ascii_case("USE") {
        return None;
    }
    let rest = &body[3..];
    if !rest.starts_with(|c: char| c.is_whitespace() || c == '`') {
        return None;
    }

    let name = rest.trim().trim_end_matches(';').trim_end();
    let name = match name.strip_prefix('`') {
        Some(quoted) => quoted.strip_suffix('`')?.replace("``", "`"),
        None => name.split_whitespace().next()?.to_string(),
    };
    (!name.is_empty()).then_some(name)
}

fn statement_is_read_only(stmt: &Statement) -> bool {
    match stmt {
        Statement::Query(query) => query_is_read_only(query),
        _ => false,
    }
}

fn query_is_read_only(query: &Query) -> bool {
    // FOR UPDATE / FOR SHARE take locks on the primary
    query.locks.is_empty() && set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => query_is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) => true,
        _ => false,
    }
}

/// `SET autocommit = 0|1|ON|OFF|TRUE|FALSE` on normalized, uppercase SQL
fn autocommit_value(normalized: &str) -> Option<bool> {
    let rest = normalized
        .strip_prefix("SET ")?
        .trim_start_matches("SESSION ")
        .trim_start_matches("@@SESSION.")
        .trim_start_matches("@@");
    let rest = rest.strip_prefix("AUTOCOMMIT")?;
    let value = rest.trim_start().strip_prefix('=')?.trim();
    let value = value.trim_end_matches(';').trim();
    match value {
        "1" | "ON" | "TRUE" => Some(true),
        "0" | "OFF" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Remove leading whitespace and `/* */`, `--` and `#` comments
pub(crate) fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => rest = after[end + 2..].trim_start(),
                None => return "",
            }
        } else if rest.starts_with("--") || rest.starts_with('#') {
            match rest.find('\n') {
                Some(end) => rest = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return rest;
        }
    }
}

/// First keyword of a statement, uppercased
fn first_keyword(sql: &str) -> String {
    let body = strip_leading_comments(sql);
    if body.starts_with('(') {
        return "(".to_string();
    }
    body.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or("")
        .to_uppercase()
}
