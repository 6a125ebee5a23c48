//! Reporter trait for dependency injection
//!
//! Core operations report progress and user-facing messages through this
//! trait so they are not coupled to a particular terminal front end.

use gemstone_schema::Version;

/// Sink for user-facing progress and messages.
pub trait Reporter: Send + Sync {
    /// Indicates a new section or phase has started (e.g. "Installing").
    fn section(&self, title: &str);

    /// A package has entered the install pipeline.
    fn installing(&self, name: &str, version: &Version);

    /// Marks a package operation as successfully completed.
    fn done(&self, name: &str, version: &Version, detail: &str);

    /// Marks a package operation as failed with a specific reason.
    fn failed(&self, name: &str, version: &Version, reason: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn installing(&self, name: &str, version: &Version) {
        (**self).installing(name, version);
    }
    fn done(&self, name: &str, version: &Version, detail: &str) {
        (**self).done(name, version, detail);
    }
    fn failed(&self, name: &str, version: &Version, reason: &str) {
        (**self).failed(name, version, reason);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn installing(&self, _: &str, _: &Version) {}
    fn done(&self, _: &str, _: &Version, _: &str) {}
    fn failed(&self, _: &str, _: &Version, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
}
