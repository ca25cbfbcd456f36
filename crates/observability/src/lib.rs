//! Tracing setup shared by jobvault binaries and tests.

/// Initialize process-wide tracing with the format named by
/// `JOBVAULT_LOG_FORMAT` (`json` by default, or `pretty`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
