use chrono::{DateTime, Utc};

/// Time of the last fully successful all-kinds import. Passed into a run and
/// returned from it; only the caller persists it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCheckpoint {
    pub last_imported_at: Option<DateTime<Utc>>,
}

impl ImportCheckpoint {
    pub fn at(when: DateTime<Utc>) -> Self {
        Self {
            last_imported_at: Some(when),
        }
    }
}
