//! Proof generation through the witness-calculator and prover binaries.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::{FullProof, StateTransitionInputs, ZkProof, ZkpError};

/// Directory under the circuits path holding the state-transition circuit.
pub const STATE_TRANSITION_DIR: &str = "state_transition";
pub const CIRCUIT_WASM: &str = "circuit.wasm";
pub const CIRCUIT_ZKEY: &str = "circuit_final.zkey";

#[async_trait::async_trait]
pub trait Prover: Send + Sync {
    async fn prove(&self, inputs: &StateTransitionInputs) -> Result<FullProof, ZkpError>;
}

/// Runs `<witness_calculator> circuit.wasm input.json witness.wtns`, then
/// `<prover> circuit_final.zkey witness.wtns proof.json public.json`.
#[derive(Clone, Debug)]
pub struct ExternalProver {
    witness_calculator: PathBuf,
    prover: PathBuf,
    circuit_dir: PathBuf,
}

impl ExternalProver {
    pub fn new(
        witness_calculator: impl Into<PathBuf>,
        prover: impl Into<PathBuf>,
        circuits_path: impl AsRef<Path>,
    ) -> Self {
        ExternalProver {
            witness_calculator: witness_calculator.into(),
            prover: prover.into(),
            circuit_dir: circuits_path.as_ref().join(STATE_TRANSITION_DIR),
        }
    }

    pub fn circuit_dir(&self) -> &Path {
        &self.circuit_dir
    }
}

#[async_trait::async_trait]
impl Prover for ExternalProver {
    async fn prove(&self, inputs: &StateTransitionInputs) -> Result<FullProof, ZkpError> {
        let work = tempfile::tempdir().map_err(io_error)?;
        let input_path = work.path().join("input.json");
        let witness_path = work.path().join("witness.wtns");
        let proof_path = work.path().join("proof.json");
        let public_path = work.path().join("public.json");

        tokio::fs::write(&input_path, inputs.to_json()?)
            .await
            .map_err(io_error)?;

        run(
            &self.witness_calculator,
            &[
                self.circuit_dir.join(CIRCUIT_WASM).as_path(),
                input_path.as_path(),
                witness_path.as_path(),
            ],
        )
        .await?;
        tracing::debug!("Witness calculated");

        run(
            &self.prover,
            &[
                self.circuit_dir.join(CIRCUIT_ZKEY).as_path(),
                witness_path.as_path(),
                proof_path.as_path(),
                public_path.as_path(),
            ],
        )
        .await?;

        let proof: ZkProof = read_json(&proof_path).await?;
        let pub_signals: Vec<String> = read_json(&public_path).await?;
        tracing::debug!(signals = pub_signals.len(), "State transition proof generated");
        Ok(FullProof { proof, pub_signals })
    }
}

async fn run(program: &Path, args: &[&Path]) -> Result<(), ZkpError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ZkpError::Io(format!("{}: {e}", program.display())))?;
    if !output.status.success() {
        return Err(ZkpError::Command {
            program: program.display().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ZkpError> {
    let bytes = tokio::fs::read(path).await.map_err(io_error)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ZkpError::MalformedProof(format!("{}: {e}", path.display())))
}

fn io_error(e: std::io::Error) -> ZkpError {
    ZkpError::Io(e.to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn inputs() -> StateTransitionInputs {
        StateTransitionInputs {
            auth_claim: vec!["0".into(); 8],
            auth_claim_mtp: vec!["0".into(); 4],
            auth_claim_non_rev_mtp: vec!["0".into(); 4],
            auth_claim_non_rev_mtp_aux_hi: "0".into(),
            auth_claim_non_rev_mtp_aux_hv: "0".into(),
            auth_claim_non_rev_mtp_no_aux: "1".into(),
            claims_tree_root: "1".into(),
            user_id: "2".into(),
            new_user_state: "3".into(),
            old_user_state: "4".into(),
            is_old_state_genesis: "1".into(),
            rev_tree_root: "0".into(),
            roots_tree_root: "0".into(),
            signature_r8x: "5".into(),
            signature_r8y: "6".into(),
            signature_s: "7".into(),
        }
    }

    #[tokio::test]
    async fn runs_both_steps_and_reads_outputs() {
        let bin = tempfile::tempdir().unwrap();
        // The witness step copies the inputs so the prover step can check them.
        let witness = script(bin.path(), "witness", r#"cp "$2" "$3""#);
        let prover = script(
            bin.path(),
            "prover",
            r#"grep -q '"userID":"2"' "$2" || exit 3
printf '{"pi_a":["1","2","1"],"pi_b":[["3","4"],["5","6"],["1","0"]],"pi_c":["7","8","1"],"protocol":"groth16"}' > "$3"
printf '["11","12"]' > "$4""#,
        );

        let prover = ExternalProver::new(witness, prover, bin.path());
        let proof = prover.prove(&inputs()).await.unwrap();
        assert_eq!(proof.proof.protocol, "groth16");
        assert_eq!(proof.pub_signals, vec!["11", "12"]);
    }

    #[tokio::test]
    async fn failing_step_reports_stderr() {
        let bin = tempfile::tempdir().unwrap();
        let witness = script(bin.path(), "witness", "echo 'bad wasm' >&2; exit 1");
        let prover = script(bin.path(), "prover", "exit 0");

        let err = ExternalProver::new(witness, prover, bin.path())
            .prove(&inputs())
            .await
            .unwrap_err();
        match err {
            ZkpError::Command { stderr, .. } => assert_eq!(stderr, "bad wasm"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn circuit_files_live_under_state_transition() {
        let prover = ExternalProver::new("w", "p", "/circuits");
        assert_eq!(
            prover.circuit_dir(),
            Path::new("/circuits/state_transition")
        );
    }
}
