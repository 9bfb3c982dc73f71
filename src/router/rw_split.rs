use crate::classifier::RouteHint;

/// Read-write routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Writes, session commands and anything inside a transaction
    Primary,
    /// Read-only statements outside a transaction
    Replica,
    /// A specific server requested by a hint
    Named(String),
}

impl RouteTarget {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            RouteTarget::Primary => "primary",
            RouteTarget::Replica => "replica",
            RouteTarget::Named(_) => "named",
        }
    }
}

/// What the classifier said about a statement
#[derive(Debug, Clone, Default)]
pub struct StatementInfo {
    pub session_mutating: bool,
    pub read_only: bool,
    pub hint: Option<RouteHint>,
}

/// Read-write splitter
pub struct RwSplitter;

impl RwSplitter {
    /// Decide where a statement goes
    ///
    /// Session commands always go to the primary (and are replayed elsewhere
    /// later). An open transaction pins everything to the primary, hints
    /// included. Otherwise a hint wins over the read-only classification.
    pub fn route(info: &StatementInfo, in_transaction: bool) -> RouteTarget {
        if info.session_mutating || in_transaction {
            return RouteTarget::Primary;
        }

        match &info.hint {
            Some(RouteHint::Primary) => RouteTarget::Primary,
            Some(RouteHint::Replica) => RouteTarget::Replica,
            Some(RouteHint::Server(name)) => RouteTarget::Named(name.clone()),
            None if info.read_only => RouteTarget::Replica,
            None => RouteTarget::Primary,
        }
    }
}
