use fail::fail_point;

use crate::error::IpiResult;

/// Evaluated by the reload pipeline right before the candidate handle is built.
pub const RELOAD_BEFORE_INIT: &str = "reload.before_init";

/// Evaluated by the scheduled updater right before each fetch.
pub const UPDATER_BEFORE_FETCH: &str = "updater.before_fetch";

/// Evaluates the fail point `name`.
///
/// The `return` action turns into an [`crate::error::ErrorKind::FailpointInjected`] error; the
/// `panic` action panics at the call site.
pub fn ipi_fail_point(name: &str) -> IpiResult<()> {
    fail_point!(name, |parameter| {
        crate::bail!(
            crate::error::ErrorKind::FailpointInjected,
            "An error occurred in a fail point",
            format!(
                "The failpoint '{name}' returned an error{}",
                parameter.map(|p| format!(" ({p})")).unwrap_or_default()
            )
        );
    });

    Ok(())
}
