//! Tree node kinds and their storage encoding.

use super::MerkleError;
use crate::field::{hash_elems, Hash};

const TYPE_MIDDLE: u8 = 0;
const TYPE_LEAF: u8 = 1;
const TYPE_EMPTY: u8 = 2;

/// Encoded node length: type byte plus two field elements.
pub const NODE_VALUE_LEN: usize = 1 + 32 + 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    Empty,
    Leaf { key: Hash, value: Hash },
    Middle { left: Hash, right: Hash },
}

impl Node {
    /// Content address of the node. Empty nodes hash to zero.
    pub fn key(&self) -> Result<Hash, MerkleError> {
        match self {
            Node::Empty => Ok(Hash::ZERO),
            Node::Leaf { key, value } => leaf_key(key, value),
            Node::Middle { left, right } => Ok(hash_elems(&[*left, *right])?),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NODE_VALUE_LEN);
        match self {
            Node::Empty => {
                out.push(TYPE_EMPTY);
                out.extend_from_slice(&[0u8; 64]);
            }
            Node::Leaf { key, value } => {
                out.push(TYPE_LEAF);
                out.extend_from_slice(&key.0);
                out.extend_from_slice(&value.0);
            }
            Node::Middle { left, right } => {
                out.push(TYPE_MIDDLE);
                out.extend_from_slice(&left.0);
                out.extend_from_slice(&right.0);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MerkleError> {
        if bytes.len() != NODE_VALUE_LEN {
            return Err(MerkleError::InvalidNode(format!(
                "expected {NODE_VALUE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let a = Hash::from_slice(&bytes[1..33])?;
        let b = Hash::from_slice(&bytes[33..65])?;
        match bytes[0] {
            TYPE_MIDDLE => Ok(Node::Middle { left: a, right: b }),
            TYPE_LEAF => Ok(Node::Leaf { key: a, value: b }),
            TYPE_EMPTY => Ok(Node::Empty),
            other => Err(MerkleError::InvalidNode(format!("unknown node type {other}"))),
        }
    }
}

/// `poseidon(k, v, 1)`
pub fn leaf_key(key: &Hash, value: &Hash) -> Result<Hash, MerkleError> {
    Ok(hash_elems(&[*key, *value, Hash::from_u64(1)])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_leaf() {
        let node = Node::Leaf {
            key: Hash::from_u64(7),
            value: Hash::from_u64(9),
        };
        let bytes = node.encode();
        assert_eq!(bytes.len(), NODE_VALUE_LEN);
        assert_eq!(bytes[0], TYPE_LEAF);
        assert_eq!(Node::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn encode_decode_middle() {
        let node = Node::Middle {
            left: Hash::ZERO,
            right: Hash::from_u64(3),
        };
        assert_eq!(Node::decode(&node.encode()).unwrap(), node);
    }

    #[test]
    fn empty_key_is_zero() {
        assert_eq!(Node::Empty.key().unwrap(), Hash::ZERO);
    }

    #[test]
    fn leaf_key_differs_from_middle_key() {
        let (a, b) = (Hash::from_u64(1), Hash::from_u64(2));
        let leaf = Node::Leaf { key: a, value: b }.key().unwrap();
        let middle = Node::Middle { left: a, right: b }.key().unwrap();
        assert_ne!(leaf, middle);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert!(Node::decode(&[0u8; 10]).is_err());
        let mut bytes = Node::Empty.encode();
        bytes[0] = 9;
        assert!(matches!(
            Node::decode(&bytes),
            Err(MerkleError::InvalidNode(_))
        ));
    }
}
