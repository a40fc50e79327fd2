use crate::child::{ChildError, ChildProcess};

/// Process-level services the host offers to scripts.
///
/// Strings passed to [`log_write`](HostServices::log_write) and
/// [`debug_printf`](HostServices::debug_printf) are printf-safe: every
/// literal `%` arrives doubled.
pub trait HostServices: Send + Sync {
    /// Expand a host template string. The error is the host's reason.
    fn expand_string(&self, template: &str) -> Result<String, String>;

    /// Write a line to the log(s) picked by `selector` (`LOG_MAIN`, ...).
    fn log_write(&self, selector: i32, format: &str);

    /// Emit debug output. Only called while the message has debugging on.
    fn debug_printf(&self, format: &str);

    /// Start a host submission process for a fabricated message. The caller
    /// writes the message to `stdin_fd` and closes it; `stdout_fd` may be -1.
    fn child_open_exim(
        &self,
        sender: &str,
        sender_auth: Option<&str>,
    ) -> Result<ChildProcess, ChildError>;
}
