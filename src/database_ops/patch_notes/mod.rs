// Patch-note text handling: revision diffs, display cleanup and the
// free-text change classifier.

pub mod classifier;
pub mod cleanup;
pub mod diff;
pub mod modifications;

pub use classifier::{guess_change_type, parse, ChangeEntry, ChangeType, ParsedPatchNote};
pub use cleanup::presentation_cleanup;
pub use diff::{compute_diff, ChangeRecord, Diff, DiffOp};
pub use modifications::{ModificationStore, PatchNoteModification};
