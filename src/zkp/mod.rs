//! Groth16 proofs for the state-transition circuit.
//!
//! Proofs arrive in the SnarkJS JSON layout. The verifier contract expects
//! the two coordinates inside each `B` row in the opposite order, see
//! [`ContractProof::from_proof`].

pub mod inputs;
pub mod prover;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::field::parse_big_int;
use crate::merkle::MerkleError;

pub use inputs::StateTransitionInputs;
pub use prover::{ExternalProver, Prover};

#[derive(Debug, thiserror::Error)]
pub enum ZkpError {
    #[error("malformed proof: {0}")]
    MalformedProof(String),
    #[error("failed to encode circuit inputs: {0}")]
    Inputs(String),
    #[error("prover I/O error: {0}")]
    Io(String),
    #[error("`{program}` exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

/// SnarkJS proof object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkProof {
    #[serde(rename = "pi_a")]
    pub a: Vec<String>,
    #[serde(rename = "pi_b")]
    pub b: Vec<Vec<String>>,
    #[serde(rename = "pi_c")]
    pub c: Vec<String>,
    pub protocol: String,
}

/// A proof with its public signals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullProof {
    pub proof: ZkProof,
    pub pub_signals: Vec<String>,
}

pub type ProofInts = (Vec<BigUint>, Vec<Vec<BigUint>>, Vec<BigUint>);

impl ZkProof {
    /// Parse every coordinate; each one is base-10 or `0x` hex.
    pub fn to_big_ints(&self) -> Result<ProofInts, ZkpError> {
        let a = parse_all(&self.a)?;
        let b = self
            .b
            .iter()
            .map(|row| parse_all(row))
            .collect::<Result<Vec<_>, _>>()?;
        let c = parse_all(&self.c)?;
        Ok((a, b, c))
    }
}

fn parse_all(values: &[String]) -> Result<Vec<BigUint>, ZkpError> {
    values
        .iter()
        .map(|s| parse_big_int(s).map_err(|e| ZkpError::MalformedProof(e.to_string())))
        .collect()
}

/// Proof arguments in the order the verifier contract takes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractProof {
    pub a: [BigUint; 2],
    pub b: [[BigUint; 2]; 2],
    pub c: [BigUint; 2],
}

impl ContractProof {
    /// `b[i] = [proof.b[i][1], proof.b[i][0]]`; trailing projective
    /// coordinates are dropped.
    pub fn from_proof(proof: &ZkProof) -> Result<Self, ZkpError> {
        let (a, b, c) = proof.to_big_ints()?;
        let pair = |v: &[BigUint], what: &str| -> Result<[BigUint; 2], ZkpError> {
            match v {
                [x, y, ..] => Ok([x.clone(), y.clone()]),
                _ => Err(ZkpError::MalformedProof(format!(
                    "{what} needs at least 2 coordinates, got {}",
                    v.len()
                ))),
            }
        };
        if b.len() < 2 {
            return Err(ZkpError::MalformedProof(format!(
                "pi_b needs at least 2 rows, got {}",
                b.len()
            )));
        }
        let [b00, b01] = pair(&b[0], "pi_b[0]")?;
        let [b10, b11] = pair(&b[1], "pi_b[1]")?;
        Ok(ContractProof {
            a: pair(&a, "pi_a")?,
            b: [[b01, b00], [b11, b10]],
            c: pair(&c, "pi_c")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn proof() -> ZkProof {
        ZkProof {
            a: strings(&["1", "0x2", "1"]),
            b: vec![
                strings(&["10", "11"]),
                strings(&["0x14", "21"]),
                strings(&["1", "0"]),
            ],
            c: strings(&["5", "6", "1"]),
            protocol: "groth16".into(),
        }
    }

    #[test]
    fn parses_decimal_and_hex() {
        let (a, b, c) = proof().to_big_ints().unwrap();
        assert_eq!(a[1], BigUint::from(2u8));
        assert_eq!(b[1][0], BigUint::from(20u8));
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn contract_b_rows_are_swapped() {
        let args = ContractProof::from_proof(&proof()).unwrap();
        let n = |v: u8| BigUint::from(v);
        assert_eq!(args.a, [n(1), n(2)]);
        assert_eq!(args.b, [[n(11), n(10)], [n(21), n(20)]]);
        assert_eq!(args.c, [n(5), n(6)]);
    }

    #[test]
    fn malformed_proofs_rejected() {
        let mut bad = proof();
        bad.a = strings(&["xyz"]);
        assert!(matches!(
            bad.to_big_ints(),
            Err(ZkpError::MalformedProof(_))
        ));

        let mut short = proof();
        short.b.truncate(1);
        assert!(ContractProof::from_proof(&short).is_err());
    }

    #[test]
    fn snarkjs_json_layout() {
        let json = r#"{
            "pi_a": ["1", "2", "1"],
            "pi_b": [["3", "4"], ["5", "6"], ["1", "0"]],
            "pi_c": ["7", "8", "1"],
            "protocol": "groth16",
            "curve": "bn128"
        }"#;
        let parsed: ZkProof = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.protocol, "groth16");
        assert_eq!(parsed.b[1], strings(&["5", "6"]));
    }
}
