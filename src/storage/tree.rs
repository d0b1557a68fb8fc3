//! Node stores for the identity trees.
//!
//! [`TreeStorage`] wraps one sled tree and caches the current root.
//! [`TxTreeStorage`] is the same store seen from inside a sled
//! transaction, so tree writes commit or roll back with the rows written
//! next to them.

use std::cell::RefCell;
use std::sync::RwLock;

use sled::transaction::{TransactionalTree, UnabortableTransactionError};

use super::StorageError;
use crate::field::Hash;
use crate::merkle::NodeStore;

pub(crate) const ROOT_KEY: &[u8] = b"root";

fn decode_root(bytes: &[u8]) -> Result<Hash, StorageError> {
    Hash::from_slice(bytes).map_err(|e| StorageError::Serialization(format!("tree root: {e}")))
}

pub struct TreeStorage {
    tree: sled::Tree,
    root: RwLock<Option<Hash>>,
}

impl TreeStorage {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        TreeStorage {
            tree,
            root: RwLock::new(None),
        }
    }

    fn cached_root(&self) -> Option<Hash> {
        self.root.read().ok().and_then(|guard| *guard)
    }

    fn store_cached_root(&self, root: &Hash) {
        if let Ok(mut guard) = self.root.write() {
            *guard = Some(*root);
        }
    }
}

impl NodeStore for TreeStorage {
    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .tree
            .get(key.0)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &Hash, value: &[u8]) -> Result<(), StorageError> {
        self.tree
            .insert(key.0, value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_root(&self) -> Result<Option<Hash>, StorageError> {
        if let Some(root) = self.cached_root() {
            return Ok(Some(root));
        }
        match self
            .tree
            .get(ROOT_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let root = decode_root(&bytes)?;
                self.store_cached_root(&root);
                Ok(Some(root))
            }
            None => Ok(None),
        }
    }

    fn set_root(&self, root: &Hash) -> Result<(), StorageError> {
        self.tree
            .insert(ROOT_KEY, &root.0[..])
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.store_cached_root(root);
        Ok(())
    }

    fn cache_root(&self, root: &Hash) {
        self.store_cached_root(root);
    }
}

/// Slot for the first transaction-level failure seen inside a closure.
///
/// Sled must see conflicts as conflicts to retry the closure, so they are
/// kept here and re-raised once the closure returns.
pub(crate) type ConflictSlot = RefCell<Option<UnabortableTransactionError>>;

pub(crate) fn guard<T>(
    slot: &ConflictSlot,
    result: Result<T, UnabortableTransactionError>,
) -> Result<T, StorageError> {
    result.map_err(|e| {
        let message = e.to_string();
        slot.borrow_mut().get_or_insert(e);
        StorageError::Conflict(message)
    })
}

pub struct TxTreeStorage<'a> {
    tree: &'a TransactionalTree,
    conflict: &'a ConflictSlot,
}

impl<'a> TxTreeStorage<'a> {
    pub(crate) fn new(tree: &'a TransactionalTree, conflict: &'a ConflictSlot) -> Self {
        TxTreeStorage { tree, conflict }
    }
}

impl NodeStore for TxTreeStorage<'_> {
    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        let value = guard(self.conflict, self.tree.get(&key.0[..]))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &Hash, value: &[u8]) -> Result<(), StorageError> {
        guard(self.conflict, self.tree.insert(&key.0[..], value))?;
        Ok(())
    }

    fn get_root(&self) -> Result<Option<Hash>, StorageError> {
        match guard(self.conflict, self.tree.get(ROOT_KEY))? {
            Some(bytes) => Ok(Some(decode_root(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_root(&self, root: &Hash) -> Result<(), StorageError> {
        guard(self.conflict, self.tree.insert(ROOT_KEY, &root.0[..]))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::SparseMerkleTree;

    fn temp_tree() -> sled::Tree {
        let db = sled::Config::new().temporary(true).open().unwrap();
        db.open_tree("nodes").unwrap()
    }

    #[test]
    fn root_is_persisted_and_cached() {
        let tree = temp_tree();
        let store = TreeStorage::new(tree.clone());
        assert_eq!(store.get_root().unwrap(), None);
        store.set_root(&Hash::from_u64(9)).unwrap();
        assert_eq!(store.get_root().unwrap(), Some(Hash::from_u64(9)));

        let reopened = TreeStorage::new(tree);
        assert_eq!(reopened.get_root().unwrap(), Some(Hash::from_u64(9)));
    }

    #[test]
    fn node_put_get() {
        let store = TreeStorage::new(temp_tree());
        assert!(store.get(&Hash::from_u64(1)).unwrap().is_none());
        store.put(&Hash::from_u64(1), &[1, 2, 3]).unwrap();
        assert_eq!(store.get(&Hash::from_u64(1)).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn aborted_transaction_leaves_no_nodes() {
        use sled::transaction::{ConflictableTransactionError, TransactionError};

        let tree = temp_tree();
        let smt = SparseMerkleTree::new(TreeStorage::new(tree.clone()), 16).unwrap();
        let result: Result<(), TransactionError<&str>> = tree.transaction(|tx| {
            let slot = ConflictSlot::new(None);
            let nodes = TxTreeStorage::new(tx, &slot);
            smt.stage_add(&nodes, &Hash::from_u64(1), &Hash::from_u64(2))
                .map_err(|_| ConflictableTransactionError::Abort("stage"))?;
            Err(ConflictableTransactionError::Abort("rollback"))
        });
        assert!(matches!(result, Err(TransactionError::Abort("rollback"))));
        assert_eq!(smt.root(), Hash::ZERO);
        // only the root key written at open survives
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn committed_transaction_is_adoptable() {
        use sled::transaction::{ConflictableTransactionError, TransactionError};

        let tree = temp_tree();
        let mut smt = SparseMerkleTree::new(TreeStorage::new(tree.clone()), 16).unwrap();
        let result: Result<Hash, TransactionError<String>> = tree.transaction(|tx| {
            let slot = ConflictSlot::new(None);
            let nodes = TxTreeStorage::new(tx, &slot);
            smt.stage_add(&nodes, &Hash::from_u64(1), &Hash::from_u64(2))
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))
        });
        let root = result.unwrap();
        smt.adopt_root(root);
        assert_eq!(smt.get(&Hash::from_u64(1)).unwrap().0, Hash::from_u64(2));
        assert_eq!(smt.store().get_root().unwrap(), Some(root));
    }
}
