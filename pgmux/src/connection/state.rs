/// Lifecycle of a physical connection.
///
/// ```text
/// Connecting -> Authenticating -> Idle <-> InTransaction
///                                   \         /
///                                    Executing
/// any state -> Failed | Closed
/// ```
///
/// `Executing` holds while at least one portal is open, `InTransaction` while the server reports
/// an open or aborted transaction block. A failed connection never becomes usable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Idle,
    InTransaction,
    Executing,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Returns `true` for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}
