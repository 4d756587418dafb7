//! Process-wide default retry policies.
//!
//! Connections and commands that are not given an explicit policy use the
//! defaults installed here. Defaults are installed at most once per process
//! (until [`reset_defaults`] is called) and start out as [`RetryPolicy::none`].

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::config::RetrySections;
use crate::policy::RetryPolicy;
use crate::resolver::PolicyResolver;

struct Defaults {
    connection: RetryPolicy,
    command: RetryPolicy,
    installed: bool,
}

impl Defaults {
    fn unconfigured() -> Self {
        Self {
            connection: RetryPolicy::none(),
            command: RetryPolicy::none(),
            installed: false,
        }
    }
}

static DEFAULTS: Lazy<RwLock<Defaults>> = Lazy::new(|| RwLock::new(Defaults::unconfigured()));

/// Install the default connection and command policies.
///
/// Returns `false` and leaves the current defaults untouched if defaults were
/// already installed. Resolution failures degrade to no-retry policies.
pub fn install_defaults(sections: &RetrySections, resolver: &PolicyResolver) -> bool {
    let mut defaults = DEFAULTS.write();
    if defaults.installed {
        tracing::debug!("default retry policies already installed");
        return false;
    }

    defaults.connection = resolver.resolve_connection(sections.connection.as_ref());
    defaults.command = resolver.resolve_command(sections.command.as_ref());
    defaults.installed = true;
    tracing::debug!(
        connection_attempts = defaults.connection.max_attempts(),
        command_attempts = defaults.command.max_attempts(),
        "installed default retry policies"
    );
    true
}

/// The default policy for opening connections.
#[must_use]
pub fn connection_policy() -> RetryPolicy {
    DEFAULTS.read().connection.clone()
}

/// The default policy for executing commands.
#[must_use]
pub fn command_policy() -> RetryPolicy {
    DEFAULTS.read().command.clone()
}

/// Check if defaults have been installed.
#[must_use]
pub fn defaults_installed() -> bool {
    DEFAULTS.read().installed
}

/// Forget installed defaults, returning to no-retry policies.
pub fn reset_defaults() {
    *DEFAULTS.write() = Defaults::unconfigured();
}
