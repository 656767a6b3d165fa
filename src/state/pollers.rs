use std::time::SystemTime;

/// Lifecycle position of a room poller as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerPhase {
    /// Setup is running or failed and will be retried on the next pass.
    Setup,
    /// The poll loop is running.
    Polling,
}

impl PollerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PollerPhase::Setup => "setup",
            PollerPhase::Polling => "polling",
        }
    }
}

/// Observable status of one room poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerStatus {
    pub alias: String,
    pub phase: PollerPhase,
    /// Completed poll cycles since the poller started.
    pub cycles: u64,
    pub last_cycle_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl PollerStatus {
    pub fn setup(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            phase: PollerPhase::Setup,
            cycles: 0,
            last_cycle_at: None,
            last_error: None,
        }
    }

    /// Record the end of a cycle; `error` is `None` for a successful one.
    pub fn record_cycle(&mut self, at: SystemTime, error: Option<String>) {
        self.cycles += 1;
        self.last_cycle_at = Some(at);
        self.last_error = error;
    }
}
