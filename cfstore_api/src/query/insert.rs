//! Write modes for bulk inserts.

/// How the store resolves rows that collide with an existing natural key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Conflict {
    /// Plain insert; a collision fails the whole request.
    #[default]
    Reject,
    /// Colliding rows are dropped silently.
    IgnoreDuplicates { on: String },
    /// Colliding rows overwrite the stored row (upsert).
    MergeDuplicates { on: String },
}

/// Whether the store echoes written rows back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Returning {
    #[default]
    Minimal,
    Representation,
}

/// Conflict resolution plus returning preference for one insert request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InsertMode {
    pub conflict: Conflict,
    pub returning: Returning,
}

impl InsertMode {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn ignore_duplicates(on: &str) -> Self {
        Self {
            conflict: Conflict::IgnoreDuplicates { on: on.to_string() },
            returning: Returning::Minimal,
        }
    }

    pub fn merge_duplicates(on: &str) -> Self {
        Self {
            conflict: Conflict::MergeDuplicates { on: on.to_string() },
            returning: Returning::Minimal,
        }
    }

    pub fn returning_rows(mut self) -> Self {
        self.returning = Returning::Representation;
        self
    }

    /// Column list for the `on_conflict` query parameter.
    pub fn on_conflict(&self) -> Option<&str> {
        match &self.conflict {
            Conflict::Reject => None,
            Conflict::IgnoreDuplicates { on } | Conflict::MergeDuplicates { on } => Some(on),
        }
    }

    /// Value for the `Prefer` request header.
    pub fn prefer_header(&self) -> String {
        let returning = match self.returning {
            Returning::Minimal => "return=minimal",
            Returning::Representation => "return=representation",
        };
        match self.conflict {
            Conflict::Reject => returning.to_string(),
            Conflict::IgnoreDuplicates { .. } => {
                format!("resolution=ignore-duplicates,{}", returning)
            }
            Conflict::MergeDuplicates { .. } => {
                format!("resolution=merge-duplicates,{}", returning)
            }
        }
    }
}
