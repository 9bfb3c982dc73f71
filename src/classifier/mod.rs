//! Statement classification
//!
//! The router only needs a handful of answers about a client statement:
//! does it change session state, may it run on a replica, does it open or
//! close a transaction, and does it carry an explicit routing hint.

mod hint;
mod sql;

pub use hint::parse_route_hint;
pub use sql::SqlClassifier;

/// Effect of a statement on the session's transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEffect {
    None,
    /// BEGIN / START TRANSACTION
    Begin,
    /// COMMIT / ROLLBACK
    End,
    /// SET autocommit=0
    DisableAutocommit,
    /// SET autocommit=1
    EnableAutocommit,
}

/// Explicit routing request embedded in a statement comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteHint {
    Primary,
    Replica,
    /// A specific server, by name
    Server(String),
}

/// Classifies client packet payloads (command byte + body)
pub trait Classifier: Send + Sync {
    /// The statement changes session state that every backend must share
    fn is_session_mutating(&self, payload: &[u8]) -> bool;

    /// The statement can be answered by a replica
    fn classify_read_only(&self, payload: &[u8]) -> bool;

    fn transaction_effect(&self, _payload: &[u8]) -> TransactionEffect {
        TransactionEffect::None
    }

    fn route_hint(&self, _payload: &[u8]) -> Option<RouteHint> {
        None
    }

    /// Default database selected by the statement (`COM_INIT_DB` or `USE`)
    fn database_change(&self, _payload: &[u8]) -> Option<String> {
        None
    }
}
