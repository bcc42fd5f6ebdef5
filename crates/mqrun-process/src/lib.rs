use std::time::Duration;

/// Lifecycle of the process supervised on one port.
///
/// NOTE: Nothing here is persisted. Each invocation rebuilds the state from the
/// PID record and a live port probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LifecycleState {
    Unknown,
    Starting,
    Listening,
    Stopping,
    Stopped,
    /// The probe budget ran out before the port reached the expected state.
    Unconfirmed,
}

impl LifecycleState {
    /// State reached once a start/stop wait has finished.
    ///
    /// From `Unknown` (a bare status check) the probe result is taken at face
    /// value: an open port is `Listening`, a closed one `Stopped`.
    pub fn settle(self, outcome: ProbeOutcome) -> Self {
        match (self, outcome.reached) {
            (Self::Starting, true) => Self::Listening,
            (Self::Stopping, true) => Self::Stopped,
            (Self::Starting | Self::Stopping, false) => Self::Unconfirmed,
            (Self::Unknown, true) => Self::Listening,
            (Self::Unknown, false) => Self::Stopped,
            (other, _) => other,
        }
    }
}

/// How many times to probe a port and how long to sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBudget {
    pub count: u32,
    pub delay: Duration,
}

impl ProbeBudget {
    pub const fn new(count: u32, delay: Duration) -> Self {
        Self { count, delay }
    }

    /// One attempt, no sleep.
    pub const fn single() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Attempts actually made; a zero count still probes once.
    pub fn attempts(&self) -> u32 {
        self.count.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProbeOutcome {
    /// Whether the port reached the state being waited for.
    pub reached: bool,
    pub attempts: u32,
}

/// Result of a best-effort stop. None of these are errors for the caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StopOutcome {
    /// No PID record for the port.
    AlreadyStopped,
    /// SIGTERM was delivered to the recorded process and the record removed.
    Signalled(u32),
    /// Delivery failed (gone, not ours, unparsable record); the record was removed.
    StaleRecordRemoved(String),
}

impl StopOutcome {
    pub fn removed_record(&self) -> bool {
        !matches!(self, Self::AlreadyStopped)
    }
}
