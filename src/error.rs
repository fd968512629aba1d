use thiserror::Error;

/// Errors surfaced by the device link for a single command or for the
/// connection as a whole. Transport-level recovery (reconnect loops) stays
/// inside the link; callers only ever see these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("I/O board is disconnected")]
    Disconnected,
    #[error("command timed out waiting for board response")]
    Timeout,
    #[error("board rejected command")]
    Rejected,
    #[error("board halted at boot: {0}")]
    BoardHalted(String),
    #[error("malformed board response: {0}")]
    BadResponse(String),
    #[error("command queue closed")]
    QueueClosed,
}

/// Why a procedure run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailReason {
    #[error("step {step} timed out after {timeout_ms} ms")]
    Timeout { step: usize, timeout_ms: u64 },
    #[error("blocked by rule: {0}")]
    RuleBlocked(String),
    #[error("emergency condition: {0}")]
    RuleEmergency(String),
    #[error("device link failure: {0}")]
    Link(#[from] LinkError),
    #[error("snapshot unavailable for {0} consecutive polls")]
    StaleSnapshot(u32),
    #[error("gas subsystem refused flow for `{0}`")]
    GasRefused(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcedureError {
    #[error("no procedure named `{0}`")]
    UnknownProcedure(String),
    #[error("slot {0} already has an active run ({1})")]
    SlotBusy(&'static str, String),
    #[error("procedure `{0}` is already running")]
    AlreadyRunning(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("emergency: {0}")]
    Emergency(String),
    #[error("confirmation required: {0}")]
    ConfirmationRequired(String),
    #[error("unknown relay role `{0}`")]
    UnknownRelay(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Configuration problems abort startup; nothing else does.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("duplicate {kind} role `{role}`")]
    DuplicateRole { kind: &'static str, role: String },
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: u8 },
    #[error("too many {kind} channels (limit {limit})")]
    TooManyChannels { kind: &'static str, limit: usize },
    #[error("rule `{rule}` references unknown {kind} `{name}`")]
    UnknownReference {
        rule: String,
        kind: &'static str,
        name: String,
    },
    #[error("expression error in `{context}`: {message}")]
    BadExpression { context: String, message: String },
    #[error("procedure `{procedure}` step {step}: {message}")]
    BadStep {
        procedure: String,
        step: usize,
        message: String,
    },
    #[error("state definition `{0}` may not reference the detected state")]
    RecursiveStateDefinition(String),
    #[error("{0}")]
    Invalid(String),
}
