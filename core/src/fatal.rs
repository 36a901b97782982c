use std::fmt;

/// Terminates the process on an internal consistency violation.
///
/// Broken invariants in the indexes mean the dataplane can no longer be
/// trusted to converge; the orchestrator is expected to restart the
/// agent from a clean slate.
pub fn fatal(message: &str, context: impl fmt::Debug) -> ! {
    tracing::error!(?context, "BUG: {message}");
    std::process::exit(70);
}
