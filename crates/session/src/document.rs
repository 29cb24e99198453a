// Replicated text document backed by yrs.
//
// Local edits run under `LOCAL_ORIGIN` so the undo scope captures them;
// remote updates run under `REMOTE_ORIGIN` and are never undoable.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::SessionError;

/// Name of the shared text inside the document.
pub const TEXT_KEY: &str = "content";
/// Transaction origin of edits made through this replica.
pub const LOCAL_ORIGIN: &str = "tandem-local";
/// Transaction origin of updates received from peers.
pub const REMOTE_ORIGIN: &str = "tandem-remote";

/// One replica of a shared text document.
#[derive(Clone)]
pub struct SharedDocument {
    doc: Doc,
    text: TextRef,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Replica with a fixed CRDT client id.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let text = doc.get_or_insert_text(TEXT_KEY);
        Self { doc, text }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn text(&self) -> &TextRef {
        &self.text
    }

    pub fn content(&self) -> String {
        self.text.get_string(&self.doc.transact())
    }

    pub fn len(&self) -> u32 {
        self.text.len(&self.doc.transact())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `content` at `index` (clamped to the text length) and return
    /// the encoded incremental update.
    pub fn insert(&self, index: u32, content: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let index = index.min(self.text.len(&txn));
        self.text.insert(&mut txn, index, content);
        txn.encode_update_v1()
    }

    /// Remove up to `len` units starting at `index`; out-of-range parts are
    /// ignored. Returns the encoded incremental update.
    pub fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let total = self.text.len(&txn);
        let index = index.min(total);
        let len = len.min(total - index);
        if len > 0 {
            self.text.remove_range(&mut txn, index, len);
        }
        txn.encode_update_v1()
    }

    /// Apply an update received from a peer.
    pub fn apply_remote_update(&self, data: &[u8]) -> Result<(), SessionError> {
        let update = Update::decode_v1(data)
            .map_err(|e| SessionError::Document(format!("failed to decode update: {e}")))?;
        self.doc
            .transact_mut_with(REMOTE_ORIGIN)
            .apply_update(update)
            .map_err(|e| SessionError::Document(format!("failed to apply update: {e}")))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Changes the holder of `remote_sv` has not seen yet.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, SessionError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| SessionError::Protocol(format!("failed to decode state vector: {e}")))?;
        Ok(self.encode_diff_since(&sv))
    }

    pub fn encode_diff_since(&self, sv: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(sv)
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}
