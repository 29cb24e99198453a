// Replica-local undo/redo over the shared text.

use yrs::undo::UndoManager;
use yrs::{Doc, TextRef};

use crate::document::{SharedDocument, LOCAL_ORIGIN};
use crate::error::SessionError;

/// Undo history for edits made through one replica.
///
/// Only transactions carrying `LOCAL_ORIGIN` are captured, so remote
/// updates are never undone. `max_depth` bounds both how many steps can be
/// undone in a row and how many steps are retained: once the history is
/// full, the next local edit starts a fresh one.
pub struct UndoScope {
    doc: Doc,
    text: TextRef,
    manager: UndoManager<()>,
    max_depth: usize,
    undone: usize,
}

fn local_manager(doc: &Doc, text: &TextRef) -> UndoManager<()> {
    let mut manager = UndoManager::new(doc, text);
    manager.include_origin(LOCAL_ORIGIN);
    manager
}

impl UndoScope {
    pub fn new(document: &SharedDocument, max_depth: usize) -> Self {
        let doc = document.doc().clone();
        let text = document.text().clone();
        let manager = local_manager(&doc, &text);
        Self { doc, text, manager, max_depth, undone: 0 }
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
        if self.history_len() > max_depth {
            self.roll_over();
        }
    }

    /// Must be called before each local edit.
    pub fn begin_edit(&mut self) {
        self.undone = 0;
        if self.history_len() >= self.max_depth {
            self.roll_over();
        }
    }

    /// Number of undo steps currently retained.
    pub fn history_len(&self) -> usize {
        self.manager.undo_stack().len()
    }

    // `UndoManager` cannot drop single stack items, so a full history is
    // released as a whole and capture restarts from the current document.
    fn roll_over(&mut self) {
        self.manager.clear();
        self.manager = local_manager(&self.doc, &self.text);
    }

    pub fn can_undo(&self) -> bool {
        self.undone < self.max_depth && self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Revert the latest local change. Returns whether anything changed.
    pub fn undo(&mut self) -> Result<bool, SessionError> {
        if !self.can_undo() {
            return Ok(false);
        }
        let changed = self.manager.try_undo().map_err(|e| SessionError::Undo(e.to_string()))?;
        if changed {
            self.undone += 1;
        }
        Ok(changed)
    }

    /// Reapply the latest undone change. Returns whether anything changed.
    pub fn redo(&mut self) -> Result<bool, SessionError> {
        if !self.can_redo() {
            return Ok(false);
        }
        let changed = self.manager.try_redo().map_err(|e| SessionError::Undo(e.to_string()))?;
        if changed {
            self.undone = self.undone.saturating_sub(1);
        }
        Ok(changed)
    }

    pub fn clear(&mut self) {
        self.manager.clear();
        self.undone = 0;
    }
}
