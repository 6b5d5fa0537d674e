use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Routine not found: {0}")]
    RoutineNotFound(String),

    #[error("Malformed workflow plan entry: {0}")]
    PlanEntry(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Equipment error: {0}")]
    Equipment(String),

    #[error("Name allocation failed: {0}")]
    NameAllocation(String),

    #[error("Unable to obtain file lock: {0}")]
    Lock(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Received exit code {exit_code} while running command: {command}")]
    StepFailed { command: String, exit_code: i32 },

    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::RoutineNotFound(_) => "ROUTINE_NOT_FOUND",
            Error::PlanEntry(_) => "PLAN_ENTRY_ERROR",
            Error::State(_) => "STATE_ERROR",
            Error::Equipment(_) => "EQUIPMENT_ERROR",
            Error::NameAllocation(_) => "NAME_ALLOCATION_ERROR",
            Error::Lock(_) => "LOCK_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::StepFailed { .. } => "STEP_FAILED",
            Error::Interrupted => "INTERRUPTED",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
        }
    }

    /// Process exit code for this error. Step failures use 20 so callers
    /// can tell a failing remote command apart from tool errors; config
    /// mistakes use 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::StepFailed { .. } => 20,
            Error::Config(_) | Error::RoutineNotFound(_) | Error::PlanEntry(_) => 2,
            Error::Interrupted => 130,
            _ => 1,
        }
    }
}
