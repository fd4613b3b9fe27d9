//! Artifact handles and freshness rules
//!
//! A [`DataArtifact`] is only a handle: its id, its scope and an optional
//! validity period. The mutable side (last write, edit lock) lives in
//! [`ArtifactMetadata`] and is owned by whichever store holds the value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable artifact identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    /// Create new artifact id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Visibility scope of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Private to one scenario
    #[default]
    Scenario,
    /// Shared by scenarios of the same cycle
    Cycle,
    /// Shared by every scenario
    Global,
}

/// Handle to a named, scoped piece of data
///
/// Cheap to clone; shared by every task that reads or writes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataArtifact {
    id: ArtifactId,
    scope: Scope,
    validity_period: Option<Duration>,
}

impl DataArtifact {
    /// Create new artifact handle without a validity period
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, scope: Scope) -> Self {
        Self {
            id: ArtifactId::new(id),
            scope,
            validity_period: None,
        }
    }

    /// With validity period
    #[inline]
    #[must_use]
    pub fn with_validity(mut self, period: Duration) -> Self {
        self.validity_period = Some(period);
        self
    }

    /// Artifact id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ArtifactId {
        &self.id
    }

    /// Artifact scope
    #[inline]
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Maximum age before a written value is stale
    #[inline]
    #[must_use]
    pub fn validity_period(&self) -> Option<Duration> {
        self.validity_period
    }

    /// Whether the value described by `meta` is still valid at `now`
    ///
    /// Fresh means written at least once and, when a validity period is set,
    /// younger than that period. A period too large for chrono never expires.
    #[must_use]
    pub fn is_fresh(&self, meta: &ArtifactMetadata, now: DateTime<Utc>) -> bool {
        let Some(written) = meta.last_write_time else {
            return false;
        };

        match self.validity_period {
            None => true,
            Some(period) => match chrono::Duration::from_std(period) {
                Ok(period) => now.signed_duration_since(written) < period,
                Err(_) => true,
            },
        }
    }
}

impl fmt::Display for DataArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Mutable write state of an artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Time of the last completed write
    pub last_write_time: Option<DateTime<Utc>>,
    /// Whether a job currently holds the write lock
    pub edit_in_progress: bool,
    /// Id of the job holding the write lock
    pub editor: Option<String>,
}

impl ArtifactMetadata {
    /// Written at least once
    #[inline]
    #[must_use]
    pub fn is_written(&self) -> bool {
        self.last_write_time.is_some()
    }

    /// Written and not being edited
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_written() && !self.edit_in_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(ago_secs: i64) -> ArtifactMetadata {
        ArtifactMetadata {
            last_write_time: Some(Utc::now() - chrono::Duration::seconds(ago_secs)),
            ..ArtifactMetadata::default()
        }
    }

    #[test]
    fn never_written_is_not_fresh() {
        let artifact = DataArtifact::new("foo", Scope::Scenario);
        assert!(!artifact.is_fresh(&ArtifactMetadata::default(), Utc::now()));
    }

    #[test]
    fn written_without_validity_is_fresh_forever() {
        let artifact = DataArtifact::new("foo", Scope::Global);
        assert!(artifact.is_fresh(&written(1_000_000), Utc::now()));
    }

    #[test]
    fn validity_period_expires() {
        let artifact =
            DataArtifact::new("foo", Scope::Cycle).with_validity(Duration::from_secs(60));

        assert!(artifact.is_fresh(&written(10), Utc::now()));
        assert!(!artifact.is_fresh(&written(120), Utc::now()));
    }

    #[test]
    fn readiness_requires_write_and_no_lock() {
        let mut meta = written(0);
        assert!(meta.is_ready());

        meta.edit_in_progress = true;
        assert!(!meta.is_ready());
        assert!(!ArtifactMetadata::default().is_ready());
    }
}
