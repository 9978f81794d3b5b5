//! Result of a single sync pass.

use std::fmt;

use crate::RowId;

/// What a sync pass did. Failures are reported separately as errors.
///
/// "Nothing to do" (no unsent rows) and "nothing new" (every unsent row is
/// already in the destination) are distinct outcomes and must never be
/// collapsed into one status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The source had no unsent rows. No destination call was made.
    NothingToDo,

    /// Every candidate already exists in the destination. Nothing was appended
    /// or marked.
    NothingNew {
        candidates: usize,
        already_present: usize,
    },

    /// Nothing needed appending, but rows appended by an interrupted earlier
    /// pass were found in the destination and marked sent.
    Recovered { marked: usize },

    /// Rows were appended and the destination confirmed all of them.
    Written {
        appended: usize,
        marked: usize,
        recovered: usize,
    },

    /// The destination confirmed a different number of rows than requested.
    /// Only rows verified present after the append were marked.
    PartialWrite {
        requested: usize,
        confirmed: usize,
        marked: usize,
        unconfirmed: Vec<RowId>,
    },

    /// The append call succeeded but the destination reported zero new rows.
    NothingWritten { attempted: usize },
}

impl SyncOutcome {
    /// Stable machine-readable name, used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NothingToDo => "nothing_to_do",
            Self::NothingNew { .. } => "nothing_new",
            Self::Recovered { .. } => "recovered",
            Self::Written { .. } => "written",
            Self::PartialWrite { .. } => "partial_write",
            Self::NothingWritten { .. } => "nothing_written",
        }
    }

    /// Whether the pass left source and destination in agreement.
    pub fn is_clean(&self) -> bool {
        !matches!(
            self,
            Self::PartialWrite { .. } | Self::NothingWritten { .. }
        )
    }

    /// Rows newly appended to the destination by this pass.
    pub fn rows_appended(&self) -> usize {
        match self {
            Self::Written { appended, .. } => *appended,
            Self::PartialWrite { confirmed, .. } => *confirmed,
            _ => 0,
        }
    }

    /// Source rows flagged sent by this pass.
    pub fn rows_marked(&self) -> usize {
        match self {
            Self::Recovered { marked } => *marked,
            Self::Written {
                marked, recovered, ..
            } => marked + recovered,
            Self::PartialWrite { marked, .. } => *marked,
            _ => 0,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NothingToDo => write!(f, "no unsent rows found"),
            Self::NothingNew {
                candidates,
                already_present,
            } => write!(
                f,
                "no new rows: all {candidates} unsent rows already exist in the destination \
                 ({already_present} present)"
            ),
            Self::Recovered { marked } => write!(
                f,
                "no new rows; marked {marked} previously appended rows as sent"
            ),
            Self::Written {
                appended,
                marked,
                recovered,
            } => {
                write!(f, "{appended} rows written and {marked} marked as sent")?;
                if *recovered > 0 {
                    write!(f, " ({recovered} recovered from an earlier pass)")?;
                }
                Ok(())
            }
            Self::PartialWrite {
                requested,
                confirmed,
                marked,
                unconfirmed,
            } => write!(
                f,
                "partial write: requested {requested} rows, destination confirmed {confirmed}; \
                 marked {marked} verified rows, {} left unsent",
                unconfirmed.len()
            ),
            Self::NothingWritten { attempted } => write!(
                f,
                "nothing written: destination accepted none of {attempted} rows"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        let outcomes = [
            SyncOutcome::NothingToDo,
            SyncOutcome::NothingNew {
                candidates: 1,
                already_present: 1,
            },
            SyncOutcome::Recovered { marked: 1 },
            SyncOutcome::Written {
                appended: 1,
                marked: 1,
                recovered: 0,
            },
            SyncOutcome::PartialWrite {
                requested: 2,
                confirmed: 1,
                marked: 1,
                unconfirmed: vec![RowId::Int(2)],
            },
            SyncOutcome::NothingWritten { attempted: 1 },
        ];
        let kinds: std::collections::HashSet<_> = outcomes.iter().map(|o| o.kind()).collect();
        assert_eq!(kinds.len(), outcomes.len());
    }

    #[test]
    fn test_nothing_to_do_differs_from_nothing_new() {
        let idle = SyncOutcome::NothingToDo;
        let seen = SyncOutcome::NothingNew {
            candidates: 2,
            already_present: 2,
        };
        assert_ne!(idle.to_string(), seen.to_string());
        assert!(idle.is_clean());
        assert!(seen.is_clean());
    }

    #[test]
    fn test_partial_write_is_not_clean() {
        let outcome = SyncOutcome::PartialWrite {
            requested: 3,
            confirmed: 2,
            marked: 2,
            unconfirmed: vec![RowId::Int(9)],
        };
        assert!(!outcome.is_clean());
        assert_eq!(outcome.rows_appended(), 2);
        assert_eq!(outcome.rows_marked(), 2);
        let msg = outcome.to_string();
        assert!(msg.contains("requested 3"));
        assert!(msg.contains("confirmed 2"));
    }

    #[test]
    fn test_written_counts_recovered_rows_as_marked() {
        let outcome = SyncOutcome::Written {
            appended: 2,
            marked: 2,
            recovered: 1,
        };
        assert_eq!(outcome.rows_marked(), 3);
        assert!(outcome.to_string().contains("1 recovered"));
    }
}
