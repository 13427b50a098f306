use thiserror::Error;

pub type Result<T> = eyre::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("pattern `{pattern}`: no binding for `{name}`")]
    UnboundHole { pattern: String, name: String },

    #[error("pattern `{pattern}`: cannot format non-captured hole `{name}`")]
    FormatWildcard { pattern: String, name: String },

    #[error("step `{step}`: output patterns declare different capture sets ({first} vs {second})")]
    CaptureSetMismatch {
        step: String,
        first: String,
        second: String,
    },

    #[error("ambiguous rule for `{path}`: steps {steps:?} all match at priority {priority}")]
    AmbiguousRule {
        path: String,
        steps: Vec<String>,
        priority: i64,
    },

    #[error("no rule to make target `{0}`")]
    NoRule(String),

    #[error("cyclic require of `{0}`")]
    CyclicRequire(String),

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("invalid value for parameter `{name}`: `{value}`")]
    InvalidParameterValue { name: String, value: String },

    #[error("`{step}`: `{cmd}` exited with {status}")]
    ActionFailed {
        step: String,
        cmd: String,
        status: String,
    },

    #[error("`{step}`: did not produce output `{output}`")]
    MissingOutput { step: String, output: String },

    #[error("`{step}`: required `{dep}` which failed")]
    DependencyFailed { step: String, dep: String },

    #[error("resource `{name}`: draw {draw} exceeds total budget {budget}")]
    ResourceOverBudget { name: String, draw: u64, budget: u64 },

    #[error("build aborted")]
    Aborted,

    // Control-flow signals consumed by the scheduler; never surfaced to callers.
    #[error("step must be restarted")]
    Restart,

    #[error("stopped at first pending action")]
    DryRunStop,
}

impl Error {
    /// Errors that abort the whole build immediately, regardless of
    /// `failure_aborts_build`, and never update the action log.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidPattern { .. }
                | Error::CaptureSetMismatch { .. }
                | Error::AmbiguousRule { .. }
                | Error::UnknownParameter(_)
                | Error::InvalidParameterValue { .. }
                | Error::ResourceOverBudget { .. }
        )
    }
}
