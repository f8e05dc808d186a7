use thiserror::Error;

/// Configuration-level failures. These are the only errors allowed to
/// terminate a run; everything that happens to a single row is recorded on
/// the row instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid period `{0}`: expected <N><unit> with unit s|min|h|d|w")]
    InvalidPeriod(String),
    #[error("invalid round method `{0}`: use ceil, floor, round or none")]
    InvalidRoundMethod(String),
    #[error("invalid instant `{0}`")]
    InvalidInstant(String),
    #[error("invalid epoch range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },
    #[error("config invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("no converter registered for `{0}`")]
    UnknownConverter(String),
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Step status surfaced to the caller and used as the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExitCode {
    Done,
    PartialSomeInput,
    PartialAllInput,
    FailedSomeInput,
    FailedAllInput,
    RemoteUnreachable,
}

impl StepExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::PartialSomeInput => 3,
            Self::PartialAllInput => 4,
            Self::FailedSomeInput => 5,
            Self::FailedAllInput => 6,
            Self::RemoteUnreachable => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::PartialSomeInput => "PARTIAL_SOME_INPUT",
            Self::PartialAllInput => "PARTIAL_ALL_INPUT",
            Self::FailedSomeInput => "FAILED_SOME_INPUT",
            Self::FailedAllInput => "FAILED_ALL_INPUT",
            Self::RemoteUnreachable => "REMOTE_UNREACHABLE",
        }
    }
}
