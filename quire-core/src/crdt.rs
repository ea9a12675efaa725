//! CRDT capability consumed by the document and history services.
//!
//! The services only ever see opaque binaries; everything that needs to look
//! inside one goes through [`Crdt`]. [`YrsCrdt`] is the yrs-backed default.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::branch::{Branch, BranchPtr};
use yrs::{Doc, Out, ReadTxn, StateVector, Transact, UndoManager, Update};

use crate::error::CrdtError;

/// Origin tag of the transaction that replays a rollback diff.
const ROLLBACK_ORIGIN: &str = "quire:rollback";

/// Merge/diff/undo primitives over encoded document binaries.
pub trait Crdt: Send + Sync {
    /// Combine updates into one. Associative, commutative, idempotent.
    fn merge(&self, updates: &[&[u8]]) -> Result<Vec<u8>, CrdtError>;

    /// Delta a peer at `state_vector` is missing, or the full state when
    /// no state vector is given.
    fn diff(&self, full_state: &[u8], state_vector: Option<&[u8]>) -> Result<Vec<u8>, CrdtError>;

    /// Compact state vector of a full state.
    fn state_vector(&self, full_state: &[u8]) -> Result<Vec<u8>, CrdtError>;

    /// Forward update that takes a document at `from` back to the content
    /// of `to`, expressed relative to the state vector of `from`.
    fn invert(&self, from: &[u8], to: &[u8]) -> Result<Vec<u8>, CrdtError>;
}

/// Tell whether a binary carries no content.
///
/// `[]` is empty, `[0]` is the empty state vector and `[0, 0]` is the empty
/// update.
pub fn is_empty_bin(bin: &[u8]) -> bool {
    bin.is_empty() || bin == [0] || bin == [0, 0]
}

/// [`Crdt`] backed by yrs v1 encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsCrdt;

impl YrsCrdt {
    pub fn new() -> Self {
        Self
    }

    /// Build a document out of a sequence of updates.
    fn load<'a>(bins: impl IntoIterator<Item = &'a [u8]>) -> Result<Doc, CrdtError> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for bin in bins {
                if is_empty_bin(bin) {
                    continue;
                }
                let update = Update::decode_v1(bin)
                    .map_err(|e| CrdtError::InvalidUpdate(e.to_string()))?;
                txn.apply_update(update)
                    .map_err(|e| CrdtError::Apply(e.to_string()))?;
            }
        }
        Ok(doc)
    }

    fn encode_full(doc: &Doc) -> Vec<u8> {
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Root branches present in a document, in any type.
    fn root_branches(doc: &Doc) -> Vec<BranchPtr> {
        let txn = doc.transact();
        txn.root_refs()
            .filter_map(|(_, value)| match value {
                Out::UndefinedRef(branch) => Some(branch),
                Out::YText(r) => Some(BranchPtr::from(AsRef::<Branch>::as_ref(&r))),
                Out::YArray(r) => Some(BranchPtr::from(AsRef::<Branch>::as_ref(&r))),
                Out::YMap(r) => Some(BranchPtr::from(AsRef::<Branch>::as_ref(&r))),
                Out::YXmlFragment(r) => Some(BranchPtr::from(AsRef::<Branch>::as_ref(&r))),
                _ => None,
            })
            .collect()
    }
}

impl Crdt for YrsCrdt {
    fn merge(&self, updates: &[&[u8]]) -> Result<Vec<u8>, CrdtError> {
        let doc = Self::load(updates.iter().copied())?;
        Ok(Self::encode_full(&doc))
    }

    fn diff(&self, full_state: &[u8], state_vector: Option<&[u8]>) -> Result<Vec<u8>, CrdtError> {
        let Some(sv) = state_vector else {
            return Ok(full_state.to_vec());
        };
        let doc = Self::load([full_state])?;
        let remote = if is_empty_bin(sv) {
            StateVector::default()
        } else {
            StateVector::decode_v1(sv).map_err(|e| CrdtError::InvalidStateVector(e.to_string()))?
        };
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    fn state_vector(&self, full_state: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let doc = Self::load([full_state])?;
        let txn = doc.transact();
        Ok(txn.state_vector().encode_v1())
    }

    fn invert(&self, from: &[u8], to: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let newer = Self::load([from])?;
        let older = Self::load([to])?;

        let newer_state = newer.transact().state_vector();
        let older_state = older.transact().state_vector();
        let forward = newer.transact().encode_diff_v1(&older_state);

        let roots = Self::root_branches(&older);
        let Some((first, rest)) = roots.split_first() else {
            // nothing in the older state can be restored
            return Ok(older.transact().encode_state_as_update_v1(&newer_state));
        };

        let mut undo = UndoManager::new(&older, first);
        for root in rest {
            undo.expand_scope(root);
        }
        undo.include_origin(ROLLBACK_ORIGIN);

        {
            let update = Update::decode_v1(&forward)
                .map_err(|e| CrdtError::InvalidUpdate(e.to_string()))?;
            let mut txn = older.transact_mut_with(ROLLBACK_ORIGIN);
            txn.apply_update(update)
                .map_err(|e| CrdtError::Apply(e.to_string()))?;
        }
        undo.undo_blocking();

        let txn = older.transact();
        Ok(txn.encode_state_as_update_v1(&newer_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Map, Text, WriteTxn};

    fn text_update(doc: &Doc, insert: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, insert);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&before)
    }

    fn read_text(bin: &[u8]) -> String {
        let doc = YrsCrdt::load([bin]).unwrap();
        let text = doc.get_or_insert_text("content");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_is_empty_bin() {
        assert!(is_empty_bin(&[]));
        assert!(is_empty_bin(&[0]));
        assert!(is_empty_bin(&[0, 0]));
        assert!(!is_empty_bin(&[1]));
        assert!(!is_empty_bin(&[0, 1]));
        assert!(!is_empty_bin(&[0, 0, 0]));
    }

    #[test]
    fn test_merge_combines_updates() {
        let doc = Doc::new();
        let a = text_update(&doc, "Hello");
        let b = text_update(&doc, ", world");

        let merged = YrsCrdt.merge(&[&a[..], &b[..]]).unwrap();
        assert_eq!(read_text(&merged), "Hello, world");
    }

    #[test]
    fn test_merge_is_order_independent() {
        let doc = Doc::new();
        let a = text_update(&doc, "a");
        let b = text_update(&doc, "b");
        let c = text_update(&doc, "c");

        let forward = YrsCrdt.merge(&[&a[..], &b[..], &c[..]]).unwrap();
        let backward = YrsCrdt.merge(&[&c[..], &b[..], &a[..]]).unwrap();
        assert_eq!(read_text(&forward), read_text(&backward));
    }

    #[test]
    fn test_merge_ignores_empty_updates() {
        let doc = Doc::new();
        let a = text_update(&doc, "x");
        let merged = YrsCrdt.merge(&[&[0u8, 0][..], &a[..], &[][..]]).unwrap();
        assert_eq!(read_text(&merged), "x");
    }

    #[test]
    fn test_diff_against_state_vector() {
        let doc = Doc::new();
        let a = text_update(&doc, "abc");
        let sv = YrsCrdt.state_vector(&a).unwrap();
        let b = text_update(&doc, "def");
        let full = YrsCrdt.merge(&[&a[..], &b[..]]).unwrap();

        let missing = YrsCrdt.diff(&full, Some(&sv)).unwrap();
        let rebuilt = YrsCrdt.merge(&[&a[..], &missing[..]]).unwrap();
        assert_eq!(read_text(&rebuilt), "abcdef");
        assert_eq!(
            YrsCrdt.state_vector(&rebuilt).unwrap(),
            YrsCrdt.state_vector(&full).unwrap()
        );
    }

    #[test]
    fn test_diff_without_state_vector_is_full_state() {
        let doc = Doc::new();
        let a = text_update(&doc, "abc");
        assert_eq!(YrsCrdt.diff(&a, None).unwrap(), a);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let err = YrsCrdt.merge(&[&[0xFFu8, 0xFE, 0xFD][..]]).unwrap_err();
        assert!(matches!(err, CrdtError::InvalidUpdate(_) | CrdtError::Apply(_)));
    }

    #[test]
    fn test_invert_restores_older_map_value() {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("root");
        {
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "x", "1");
        }
        let v1 = YrsCrdt::encode_full(&doc);
        {
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "x", "2");
        }
        let v2 = YrsCrdt::encode_full(&doc);

        let revert = YrsCrdt.invert(&v2, &v1).unwrap();
        let restored = YrsCrdt.merge(&[&v2[..], &revert[..]]).unwrap();

        let check = YrsCrdt::load([restored.as_slice()]).unwrap();
        let root = check.get_or_insert_map("root");
        let txn = check.transact();
        assert_eq!(root.get(&txn, "x"), Some(Out::Any(yrs::Any::from("1"))));
    }

    #[test]
    fn test_invert_restores_older_text() {
        let doc = Doc::new();
        let a = text_update(&doc, "first");
        let b = text_update(&doc, " second");
        let newer = YrsCrdt.merge(&[&a[..], &b[..]]).unwrap();

        let revert = YrsCrdt.invert(&newer, &a).unwrap();
        let restored = YrsCrdt.merge(&[&newer[..], &revert[..]]).unwrap();
        assert_eq!(read_text(&restored), "first");
    }
}
