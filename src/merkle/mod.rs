//! Sparse Merkle tree over BN254 field elements.
//!
//! Keys select a path by their little-endian bits. Leaves hash as
//! `poseidon(k, v, 1)`, middle nodes as `poseidon(l, r)`, and empty
//! subtrees are the zero hash. Nodes are content-addressed and never
//! removed, so every root the tree ever had stays provable.
//!
//! The tree reaches its backing store only through [`NodeStore`]. The same
//! insertion code runs against a plain store or a transactional view, which
//! lets callers commit tree writes together with other database rows.

pub mod node;
pub mod proof;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::field::{in_field, FieldError, Hash};
use crate::storage::StorageError;

pub use node::Node;
pub use proof::{root_from_proof, verify_proof, NodeAux, Proof};

/// Default depth of all identity trees.
pub const DEFAULT_MAX_LEVELS: usize = 40;

#[derive(Clone, Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("the entry index already exists in the tree")]
    EntryIndexAlreadyExists,
    #[error("key not found in the tree")]
    KeyNotFound,
    #[error("reached maximum level of the tree")]
    ReachedMaxLevel,
    #[error("node {0} not found in storage")]
    NodeNotFound(Hash),
    #[error("a different node is already stored under key {0}")]
    NodeKeyAlreadyExists(Hash),
    #[error("invalid node: {0}")]
    InvalidNode(String),
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    #[error("proof depth {depth} exceeds {levels} levels")]
    ProofTooDeep { depth: usize, levels: usize },
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Key/value persistence for tree nodes plus the current root.
pub trait NodeStore {
    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &Hash, value: &[u8]) -> Result<(), StorageError>;
    fn get_root(&self) -> Result<Option<Hash>, StorageError>;
    fn set_root(&self, root: &Hash) -> Result<(), StorageError>;

    /// Record a root that was persisted through another handle.
    fn cache_root(&self, _root: &Hash) {}
}

/// Process-local node store.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<HashMap<Hash, Vec<u8>>>,
    root: Mutex<Option<Hash>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Io("memory store lock poisoned".into())
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.nodes.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn put(&self, key: &Hash, value: &[u8]) -> Result<(), StorageError> {
        self.nodes
            .lock()
            .map_err(poisoned)?
            .insert(*key, value.to_vec());
        Ok(())
    }

    fn get_root(&self) -> Result<Option<Hash>, StorageError> {
        Ok(*self.root.lock().map_err(poisoned)?)
    }

    fn set_root(&self, root: &Hash) -> Result<(), StorageError> {
        *self.root.lock().map_err(poisoned)? = Some(*root);
        Ok(())
    }
}

/// Buffers writes over a base store so an insertion can be evaluated
/// without persisting anything.
pub struct OverlayStore<'a, S: ?Sized> {
    base: &'a S,
    nodes: RefCell<HashMap<Hash, Vec<u8>>>,
    root: RefCell<Option<Hash>>,
}

impl<'a, S: NodeStore + ?Sized> OverlayStore<'a, S> {
    pub fn new(base: &'a S) -> Self {
        OverlayStore {
            base,
            nodes: RefCell::new(HashMap::new()),
            root: RefCell::new(None),
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.nodes.borrow().len()
    }
}

impl<S: NodeStore + ?Sized> NodeStore for OverlayStore<'_, S> {
    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = self.nodes.borrow().get(key) {
            return Ok(Some(value.clone()));
        }
        self.base.get(key)
    }

    fn put(&self, key: &Hash, value: &[u8]) -> Result<(), StorageError> {
        self.nodes.borrow_mut().insert(*key, value.to_vec());
        Ok(())
    }

    fn get_root(&self) -> Result<Option<Hash>, StorageError> {
        match *self.root.borrow() {
            Some(root) => Ok(Some(root)),
            None => self.base.get_root(),
        }
    }

    fn set_root(&self, root: &Hash) -> Result<(), StorageError> {
        *self.root.borrow_mut() = Some(*root);
        Ok(())
    }
}

pub struct SparseMerkleTree<S> {
    store: S,
    root: Hash,
    max_levels: usize,
}

impl<S: NodeStore> SparseMerkleTree<S> {
    /// Open a tree over `store`, starting empty if no root was persisted.
    pub fn new(store: S, max_levels: usize) -> Result<Self, MerkleError> {
        let root = match store.get_root()? {
            Some(root) => root,
            None => {
                store.set_root(&Hash::ZERO)?;
                Hash::ZERO
            }
        };
        Ok(SparseMerkleTree {
            store,
            root,
            max_levels,
        })
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn add(&mut self, key: &Hash, value: &Hash) -> Result<(), MerkleError> {
        let writer = Writer {
            store: &self.store,
            max_levels: self.max_levels,
        };
        let root = writer.insert(&self.root, key, value)?;
        self.root = root;
        Ok(())
    }

    /// Write an insertion through `store` without touching this handle.
    ///
    /// Returns the new root. Once the caller commits the writes it must
    /// call [`adopt_root`](Self::adopt_root).
    pub fn stage_add<T: NodeStore + ?Sized>(
        &self,
        store: &T,
        key: &Hash,
        value: &Hash,
    ) -> Result<Hash, MerkleError> {
        let writer = Writer {
            store,
            max_levels: self.max_levels,
        };
        writer.insert(&self.root, key, value)
    }

    pub fn adopt_root(&mut self, root: Hash) {
        self.store.cache_root(&root);
        self.root = root;
    }

    /// Look up `key`, returning its value and the siblings on its path.
    pub fn get(&self, key: &Hash) -> Result<(Hash, Vec<Hash>), MerkleError> {
        let reader = Writer {
            store: &self.store,
            max_levels: self.max_levels,
        };
        let mut next = self.root;
        let mut siblings = Vec::new();
        for level in 0..self.max_levels {
            match reader.get_node(&next)? {
                Node::Empty => return Err(MerkleError::KeyNotFound),
                Node::Leaf { key: k, value } => {
                    return if k == *key {
                        Ok((value, siblings))
                    } else {
                        Err(MerkleError::KeyNotFound)
                    };
                }
                Node::Middle { left, right } => {
                    if key.path_bit(level) {
                        siblings.push(left);
                        next = right;
                    } else {
                        siblings.push(right);
                        next = left;
                    }
                }
            }
        }
        Err(MerkleError::ReachedMaxLevel)
    }

    /// Proof of existence or non-existence of `key` under `root`, or under
    /// the current root when `root` is `None`.
    ///
    /// Also returns the value found at the end of the path (zero when the
    /// path ends in an empty subtree).
    pub fn generate_proof(
        &self,
        key: &Hash,
        root: Option<&Hash>,
    ) -> Result<(Proof, Hash), MerkleError> {
        let reader = Writer {
            store: &self.store,
            max_levels: self.max_levels,
        };
        let mut next = root.copied().unwrap_or(self.root);
        let mut siblings = Vec::new();
        for level in 0..self.max_levels {
            match reader.get_node(&next)? {
                Node::Empty => {
                    let proof = Proof {
                        existence: false,
                        siblings,
                        node_aux: None,
                    };
                    return Ok((proof, Hash::ZERO));
                }
                Node::Leaf { key: k, value } => {
                    let node_aux = (k != *key).then_some(NodeAux { key: k, value });
                    let proof = Proof {
                        existence: node_aux.is_none(),
                        siblings,
                        node_aux,
                    };
                    return Ok((proof, value));
                }
                Node::Middle { left, right } => {
                    if key.path_bit(level) {
                        siblings.push(left);
                        next = right;
                    } else {
                        siblings.push(right);
                        next = left;
                    }
                }
            }
        }
        Err(MerkleError::KeyNotFound)
    }
}

struct Writer<'a, T: ?Sized> {
    store: &'a T,
    max_levels: usize,
}

impl<T: NodeStore + ?Sized> Writer<'_, T> {
    fn insert(&self, root: &Hash, key: &Hash, value: &Hash) -> Result<Hash, MerkleError> {
        for h in [key, value] {
            if !in_field(&h.to_biguint()) {
                return Err(FieldError::NotInField(h.to_string()).into());
            }
        }
        let leaf = Node::Leaf {
            key: *key,
            value: *value,
        };
        let new_root = self.add_leaf(&leaf, key, root, 0)?;
        self.store.set_root(&new_root)?;
        Ok(new_root)
    }

    fn get_node(&self, key: &Hash) -> Result<Node, MerkleError> {
        if key.is_zero() {
            return Ok(Node::Empty);
        }
        match self.store.get(key)? {
            Some(bytes) => Node::decode(&bytes),
            None => Err(MerkleError::NodeNotFound(*key)),
        }
    }

    fn add_leaf(
        &self,
        leaf: &Node,
        path: &Hash,
        node_key: &Hash,
        level: usize,
    ) -> Result<Hash, MerkleError> {
        if level + 1 > self.max_levels {
            return Err(MerkleError::ReachedMaxLevel);
        }
        let node = self.get_node(node_key)?;
        match node {
            Node::Empty => self.add_node(leaf),
            Node::Leaf { key: old_key, .. } => {
                if old_key == *path {
                    return Err(MerkleError::EntryIndexAlreadyExists);
                }
                self.push_leaf(leaf, path, &node, &old_key, level)
            }
            Node::Middle { left, right } => {
                let middle = if path.path_bit(level) {
                    let next = self.add_leaf(leaf, path, &right, level + 1)?;
                    Node::Middle { left, right: next }
                } else {
                    let next = self.add_leaf(leaf, path, &left, level + 1)?;
                    Node::Middle { left: next, right }
                };
                self.add_node(&middle)
            }
        }
    }

    /// Push an existing leaf down until its path diverges from the new one.
    fn push_leaf(
        &self,
        new_leaf: &Node,
        new_path: &Hash,
        old_leaf: &Node,
        old_path: &Hash,
        level: usize,
    ) -> Result<Hash, MerkleError> {
        if level + 2 > self.max_levels {
            return Err(MerkleError::ReachedMaxLevel);
        }
        let new_bit = new_path.path_bit(level);
        if new_bit == old_path.path_bit(level) {
            let next = self.push_leaf(new_leaf, new_path, old_leaf, old_path, level + 1)?;
            let middle = if new_bit {
                Node::Middle {
                    left: Hash::ZERO,
                    right: next,
                }
            } else {
                Node::Middle {
                    left: next,
                    right: Hash::ZERO,
                }
            };
            return self.add_node(&middle);
        }
        let old_key = old_leaf.key()?;
        let new_key = new_leaf.key()?;
        let middle = if new_bit {
            Node::Middle {
                left: old_key,
                right: new_key,
            }
        } else {
            Node::Middle {
                left: new_key,
                right: old_key,
            }
        };
        self.add_node(new_leaf)?;
        self.add_node(&middle)
    }

    fn add_node(&self, node: &Node) -> Result<Hash, MerkleError> {
        if *node == Node::Empty {
            return Ok(Hash::ZERO);
        }
        let key = node.key()?;
        let encoded = node.encode();
        if let Some(existing) = self.store.get(&key)? {
            if existing != encoded {
                return Err(MerkleError::NodeKeyAlreadyExists(key));
            }
            return Ok(key);
        }
        self.store.put(&key, &encoded)?;
        Ok(key)
    }
}
