//! Mirror sequence admission.
//!
//! An incoming archive is accepted only when it is the legitimate next
//! increment of the lineage: sequence 1 on a fresh workspace, current
//! sequence plus one otherwise. An incoming uid that differs from the
//! current uid starts a fresh lineage, so the first-run rule applies
//! again rather than failing the run.

use setmirror_core::error::{MirrorError, Result};
use setmirror_core::metadata::Metadata;

/// Validate that `incoming` is the legitimate successor of `current`.
pub fn verify_sequence(current: Option<&Metadata>, incoming: &Metadata) -> Result<()> {
    let current = match current {
        Some(curr) if curr.uid != incoming.uid => {
            // Informational only: a uid change restarts the lineage, it
            // never fails the run.
            let note = MirrorError::UuidMismatch {
                want: curr.uid,
                got: incoming.uid,
            };
            tracing::warn!(%note, "treating as a new workspace");
            None
        }
        other => other,
    };

    let got = incoming.past_mirror.sequence;
    match current {
        None => {
            if got != 1 {
                return Err(MirrorError::SequenceMismatch { want: 1, got });
            }
        }
        Some(curr) => {
            let want = curr.past_mirror.sequence + 1;
            if got != want {
                return Err(MirrorError::SequenceMismatch { want, got });
            }
        }
    }
    Ok(())
}
