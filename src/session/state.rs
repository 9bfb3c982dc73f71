use crate::classifier::TransactionEffect;

/// Lifecycle of a router session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Backends are being connected; backend events wait
    Setup,
    /// Routing; backend events trigger failover
    RouterReady,
    /// Closed or torn down after an unrecoverable failure
    Stopping,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Setup, SessionState::RouterReady | SessionState::Stopping)
                | (SessionState::RouterReady, SessionState::Stopping)
        )
    }
}

/// Client-visible session state tracked from routed statements
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Current database
    pub database: Option<String>,
    /// Explicit BEGIN / START TRANSACTION is open
    pub in_transaction: bool,
    pub autocommit: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            database: None,
            in_transaction: false,
            autocommit: true,
        }
    }
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements must stay on the primary
    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction || !self.autocommit
    }

    pub fn begin_transaction(&mut self) {
        self.in_transaction = true;
    }

    pub fn end_transaction(&mut self) {
        self.in_transaction = false;
    }

    pub fn change_database(&mut self, db: String) {
        self.database = Some(db);
    }

    pub fn apply(&mut self, effect: TransactionEffect) {
        match effect {
            TransactionEffect::None => {}
            TransactionEffect::Begin => self.begin_transaction(),
            TransactionEffect::End => self.end_transaction(),
            TransactionEffect::DisableAutocommit => self.autocommit = false,
            // enabling autocommit implicitly commits
            TransactionEffect::EnableAutocommit => {
                self.autocommit = true;
                self.in_transaction = false;
            }
        }
    }
}
