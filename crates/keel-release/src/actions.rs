//! Action options for install, upgrade, rollback and uninstall operations

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use keel_repo::Lock;

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Options for install operation
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Timeout for wait
    pub timeout: Duration,

    /// Description for this release
    pub description: Option<String>,

    /// Lock to build dependencies from instead of resolving afresh
    pub lock: Option<Lock>,

    /// Cancels the transition between steps
    pub cancel: CancellationToken,

    /// Upper bound for the whole transition
    pub deadline: Option<Duration>,
}

impl InstallOptions {
    /// Create default install options with name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            wait: false,
            timeout: default_timeout(),
            description: None,
            lock: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Enable waiting for resources
    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_lock(mut self, lock: Lock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Options for upgrade operation
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Timeout for wait
    pub timeout: Duration,

    /// Install if release doesn't exist
    pub install: bool,

    /// Merge new values over the previous revision's values
    pub reuse_values: bool,

    /// Use only the new values (default)
    pub reset_values: bool,

    /// Description for this revision
    pub description: Option<String>,

    /// Lock to build dependencies from instead of resolving afresh
    pub lock: Option<Lock>,

    pub cancel: CancellationToken,

    pub deadline: Option<Duration>,
}

impl UpgradeOptions {
    /// Create default upgrade options
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            wait: false,
            timeout: default_timeout(),
            install: false,
            reuse_values: false,
            reset_values: true,
            description: None,
            lock: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Enable install-if-not-exists
    pub fn with_install(mut self) -> Self {
        self.install = true;
        self
    }

    /// Merge over the previous revision's values
    pub fn with_reuse_values(mut self) -> Self {
        self.reuse_values = true;
        self.reset_values = false;
        self
    }

    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_lock(mut self, lock: Lock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Install options equivalent to these upgrade options
    pub fn to_install(&self) -> InstallOptions {
        InstallOptions {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            wait: self.wait,
            timeout: self.timeout,
            description: self.description.clone(),
            lock: self.lock.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }
}

/// Options for rollback operation
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Release name
    pub name: String,

    /// Target revision (`None` = the one deployed before the current)
    pub revision: Option<u32>,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Timeout for wait
    pub timeout: Duration,

    /// Description for this rollback
    pub description: Option<String>,

    pub cancel: CancellationToken,

    pub deadline: Option<Duration>,
}

impl RollbackOptions {
    /// Create default rollback options
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: None,
            wait: false,
            timeout: default_timeout(),
            description: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Set target revision
    pub fn to_revision(mut self, revision: u32) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Wait for rollback
    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Options for uninstall operation
#[derive(Debug, Clone)]
pub struct UninstallOptions {
    /// Release name
    pub name: String,

    /// Delete release history as well
    pub purge: bool,

    /// Description for the uninstall
    pub description: Option<String>,

    pub cancel: CancellationToken,

    pub deadline: Option<Duration>,
}

impl UninstallOptions {
    /// Create default uninstall options (history is kept)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            purge: false,
            description: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Remove history after uninstall
    pub fn with_purge(mut self) -> Self {
        self.purge = true;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_options_builder() {
        let opts = InstallOptions::new("myapp", "default")
            .with_wait(Duration::from_secs(60))
            .with_description("first");

        assert_eq!(opts.name, "myapp");
        assert_eq!(opts.namespace, "default");
        assert!(opts.wait);
        assert_eq!(opts.timeout, Duration::from_secs(60));
        assert!(opts.lock.is_none());
    }

    #[test]
    fn test_upgrade_options_values_mode() {
        let opts = UpgradeOptions::new("myapp", "default");
        assert!(opts.reset_values && !opts.reuse_values);

        let opts = opts.with_reuse_values().with_install();
        assert!(opts.reuse_values && !opts.reset_values);
        assert!(opts.install);

        let install = opts.to_install();
        assert_eq!(install.name, "myapp");
        assert_eq!(install.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_rollback_options() {
        let opts = RollbackOptions::new("myapp").to_revision(3);
        assert_eq!(opts.revision, Some(3));
        assert!(RollbackOptions::new("myapp").revision.is_none());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancellationToken::new();
        let opts = UninstallOptions::new("myapp").with_cancel(token.clone()).with_purge();
        token.cancel();
        assert!(opts.cancel.is_cancelled());
        assert!(opts.purge);
    }
}
