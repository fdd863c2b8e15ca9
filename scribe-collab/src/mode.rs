//! Local vs. collaborative mode selection.

use crate::protocol::Visibility;

/// How a document session edits its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Single-user editing straight against the durable store.
    Local,
    /// Multi-user editing through a shared CRDT document.
    Collaborative,
}

impl Mode {
    pub fn is_collaborative(self) -> bool {
        self == Mode::Collaborative
    }
}

/// Decides a session's mode once, at open time.
///
/// Public documents are always collaborative, even before a second
/// participant shows up, so the shared document exists before anyone joins.
/// Presence is deliberately not an input.
pub struct ModeArbiter;

impl ModeArbiter {
    pub fn decide(visibility: Visibility) -> Mode {
        match visibility {
            Visibility::Public => Mode::Collaborative,
            Visibility::Private => Mode::Local,
        }
    }
}
