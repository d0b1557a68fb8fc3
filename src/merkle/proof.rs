//! Inclusion and non-inclusion proofs.

use serde::{Deserialize, Serialize};

use super::node::{leaf_key, Node};
use super::MerkleError;
use crate::field::Hash;

/// The leaf met on the path of a non-existence proof, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAux {
    pub key: Hash,
    pub value: Hash,
}

/// A Merkle proof for a key.
///
/// `siblings` holds one entry per traversed level, root first, empty
/// siblings included as zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub existence: bool,
    pub siblings: Vec<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_aux: Option<NodeAux>,
}

impl Proof {
    pub fn depth(&self) -> usize {
        self.siblings.len()
    }

    /// Siblings padded with zero up to `levels`.
    pub fn padded_siblings(&self, levels: usize) -> Result<Vec<Hash>, MerkleError> {
        if self.siblings.len() > levels {
            return Err(MerkleError::ProofTooDeep {
                depth: self.siblings.len(),
                levels,
            });
        }
        let mut out = self.siblings.clone();
        out.resize(levels, Hash::ZERO);
        Ok(out)
    }
}

/// Recompute the root a proof commits to for `(key, value)`.
pub fn root_from_proof(proof: &Proof, key: &Hash, value: &Hash) -> Result<Hash, MerkleError> {
    let mut mid = if proof.existence {
        leaf_key(key, value)?
    } else {
        match &proof.node_aux {
            None => Hash::ZERO,
            Some(aux) => {
                if aux.key == *key {
                    return Err(MerkleError::InvalidProof(
                        "non-existence proof carries the queried key as auxiliary node".into(),
                    ));
                }
                leaf_key(&aux.key, &aux.value)?
            }
        }
    };
    for (level, sibling) in proof.siblings.iter().enumerate().rev() {
        let node = if key.path_bit(level) {
            Node::Middle {
                left: *sibling,
                right: mid,
            }
        } else {
            Node::Middle {
                left: mid,
                right: *sibling,
            }
        };
        mid = node.key()?;
    }
    Ok(mid)
}

pub fn verify_proof(root: &Hash, proof: &Proof, key: &Hash, value: &Hash) -> bool {
    match root_from_proof(proof, key, value) {
        Ok(computed) => computed == *root,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let proof = Proof {
            existence: false,
            siblings: vec![Hash::ZERO, Hash::from_u64(5)],
            node_aux: Some(NodeAux {
                key: Hash::from_u64(2),
                value: Hash::from_u64(3),
            }),
        };
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["existence"], false);
        assert_eq!(json["siblings"][1], "5");
        assert_eq!(json["node_aux"]["key"], "2");
        assert_eq!(json["node_aux"]["value"], "3");

        let back: Proof = serde_json::from_value(json).unwrap();
        assert_eq!(back, proof);
    }

    #[test]
    fn node_aux_omitted_when_absent() {
        let proof = Proof {
            existence: true,
            siblings: vec![],
            node_aux: None,
        };
        let json = serde_json::to_string(&proof).unwrap();
        assert!(!json.contains("node_aux"));
    }

    #[test]
    fn padding() {
        let proof = Proof {
            existence: true,
            siblings: vec![Hash::from_u64(1)],
            node_aux: None,
        };
        let padded = proof.padded_siblings(4).unwrap();
        assert_eq!(padded.len(), 4);
        assert_eq!(padded[0], Hash::from_u64(1));
        assert!(padded[1..].iter().all(Hash::is_zero));
        assert!(proof.padded_siblings(0).is_err());
    }

    #[test]
    fn single_leaf_tree_root() {
        let (k, v) = (Hash::from_u64(1), Hash::from_u64(2));
        let proof = Proof {
            existence: true,
            siblings: vec![],
            node_aux: None,
        };
        assert_eq!(root_from_proof(&proof, &k, &v).unwrap(), leaf_key(&k, &v).unwrap());
    }

    #[test]
    fn aux_equal_to_key_is_rejected() {
        let k = Hash::from_u64(1);
        let proof = Proof {
            existence: false,
            siblings: vec![],
            node_aux: Some(NodeAux {
                key: k,
                value: Hash::ZERO,
            }),
        };
        assert!(root_from_proof(&proof, &k, &Hash::ZERO).is_err());
        assert!(!verify_proof(&Hash::ZERO, &proof, &k, &Hash::ZERO));
    }
}
