/// Failure categories surfaced to the caller as a single failure result.
///
/// Everything is carried through `anyhow::Error`; callers that need the
/// category use `err.downcast_ref::<KvmError>()`.
#[derive(Debug, PartialEq)]
pub enum KvmError {
    /// Missing or invalid parameters. Raised before any API call is made.
    Config(String),
    /// Name ambiguity, unknown node or missing VM.
    Lookup(String),
    /// Non-success HTTP response from the cluster API.
    Api {
        method: String,
        path: String,
        status: u16,
        body: String,
    },
    /// Asynchronous cluster task failed or did not finish in time.
    Task {
        upid: String,
        reason: String,
        log_tail: Vec<String>,
    },
}

impl KvmError {
    pub fn config(msg: impl Into<String>) -> Self {
        KvmError::Config(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        KvmError::Lookup(msg.into())
    }
}

impl std::fmt::Display for KvmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvmError::Config(msg) => write!(f, "{}", msg),
            KvmError::Lookup(msg) => write!(f, "{}", msg),
            KvmError::Api {
                method,
                path,
                status,
                body,
            } => write!(f, "{} {} failed ({}): {}", method, path, status, body),
            KvmError::Task {
                upid,
                reason,
                log_tail,
            } => {
                write!(f, "Task {} {}", upid, reason)?;
                if !log_tail.is_empty() {
                    write!(f, ". Last task log lines: {}", log_tail.join(" | "))?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for KvmError {}
