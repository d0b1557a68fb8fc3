//! Publishes identity state transitions on chain.
//!
//! The publisher first reconciles rows left `processing` by a previous run
//! against the contract, then advances the on-chain state on every tick of
//! its interval or whenever it is triggered.

pub mod chain;
pub mod eth;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::identity::{CommittedState, Identity, StateError, StateTransitionInfo, Status};
use crate::storage::{CommittedStateStore, StorageError};
use crate::zkp::{ContractProof, Prover, StateTransitionInputs, ZkpError};

pub use chain::{
    decode_revert_reason, BlockInfo, ChainError, MinedTx, StateContract, TransitStateArgs, TxHash,
};
pub use eth::EthStateContract;

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Zkp(#[from] ZkpError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Result of one publish cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing to publish, or a transition is already in flight.
    Skipped(String),
    Published { tx_hash: TxHash },
    /// The transaction failed; the row is marked `failed`.
    Failed { reason: String },
    /// Shutdown arrived while waiting for the transaction. The row stays
    /// `processing` and is resolved by the next startup reconciliation.
    Interrupted { tx_hash: TxHash },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub publish_period: Duration,
    pub retry_period: Duration,
    pub max_retries: u32,
    /// Level count of the state-transition circuit.
    pub circuit_levels: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            publish_period: Duration::from_secs(60),
            retry_period: Duration::from_secs(10),
            max_retries: 5,
            circuit_levels: crate::merkle::DEFAULT_MAX_LEVELS,
        }
    }
}

/// Wakes the publisher loop before its next tick.
#[derive(Default)]
pub struct PublishTrigger {
    notify: Notify,
}

impl PublishTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cycle. Requests made while a cycle runs collapse into one.
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    pub(crate) async fn fired(&self) {
        self.notify.notified().await
    }
}

pub struct Publisher {
    identity: Arc<Identity>,
    contract: Arc<dyn StateContract>,
    prover: Arc<dyn Prover>,
    trigger: Arc<PublishTrigger>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        identity: Arc<Identity>,
        contract: Arc<dyn StateContract>,
        prover: Arc<dyn Prover>,
        config: PublisherConfig,
    ) -> Self {
        Publisher {
            identity,
            contract,
            prover,
            trigger: Arc::new(PublishTrigger::new()),
            config,
        }
    }

    pub fn trigger(&self) -> Arc<PublishTrigger> {
        self.trigger.clone()
    }

    fn storage(&self) -> &crate::storage::SledStorage {
        self.identity.state().storage()
    }

    /// Resolve every `processing` row against the contract: states the
    /// contract knows become `completed`, the rest `failed`.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PublisherError> {
        let mut report = ReconcileReport::default();
        for mut row in self.storage().committed_states_by_status(Status::Processing)? {
            let state = row.state_hash().map_err(StateError::from)?;
            if self.contract.state_exists(&state).await? {
                row.status = Status::Completed;
                report.completed += 1;
                tracing::info!(committed_state = row.id, %state, "Previous session state found on chain");
            } else {
                row.mark_failed("state not found on chain after restart");
                report.failed += 1;
                tracing::warn!(committed_state = row.id, %state, "Previous session state not found on chain");
            }
            self.storage().update_committed_state(&row)?;
        }
        Ok(report)
    }

    /// Run one publish cycle to completion.
    pub async fn publish_once(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<PublishOutcome, PublisherError> {
        let (info, mut row) = match self
            .identity
            .state()
            .generate_state_commitment(self.identity.info())
            .await
        {
            Ok(commitment) => commitment,
            Err(e) if e.is_noop() => return Ok(PublishOutcome::Skipped(e.to_string())),
            Err(e) => return Err(e.into()),
        };

        let args = match self.transition_args(&info).await {
            Ok(args) => args,
            Err(e) => {
                self.fail(&mut row, e.to_string())?;
                return Err(e);
            }
        };

        let tx_hash = match self.send(&args).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                let reason = e.to_string();
                self.fail(&mut row, reason.clone())?;
                return Ok(PublishOutcome::Failed { reason });
            }
        };
        row.tx_id = Some(tx_hash.to_string());
        self.storage().update_committed_state(&row)?;
        tracing::info!(%tx_hash, new_state = %info.new_state, "State transition submitted");

        let mined = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(%tx_hash, "Shutdown while waiting for transaction");
                return Ok(PublishOutcome::Interrupted { tx_hash });
            }
            mined = self.contract.wait_mined(&tx_hash) => mined,
        };
        self.finalize(&mut row, mined).await
    }

    async fn transition_args(
        &self,
        info: &StateTransitionInfo,
    ) -> Result<TransitStateArgs, PublisherError> {
        let inputs = StateTransitionInputs::new(info, self.config.circuit_levels)?;
        let proof = self.prover.prove(&inputs).await?;
        Ok(TransitStateArgs {
            id: info.identifier.to_big_int(),
            old_state: info.old_state,
            new_state: info.new_state,
            is_old_state_genesis: info.is_old_state_genesis,
            proof: ContractProof::from_proof(&proof.proof)?,
        })
    }

    /// Submit `transitState`, moving past nonces the node reports as used.
    async fn send(&self, args: &TransitStateArgs) -> Result<TxHash, ChainError> {
        let mut nonce = self.contract.pending_nonce().await?;
        loop {
            match self.contract.transit_state(args, nonce).await {
                Err(ChainError::NonceTooLow) => {
                    tracing::debug!(nonce, "Nonce too low, retrying with the next one");
                    nonce += 1;
                }
                result => return result,
            }
        }
    }

    async fn finalize(
        &self,
        row: &mut CommittedState,
        mined: Result<MinedTx, ChainError>,
    ) -> Result<PublishOutcome, PublisherError> {
        let mined = match mined {
            Ok(mined) => mined,
            Err(e) => {
                let reason = e.to_string();
                self.fail(row, reason.clone())?;
                return Ok(PublishOutcome::Failed { reason });
            }
        };

        if !mined.success {
            let reason = match self
                .contract
                .revert_reason(&mined.tx_hash, mined.block_number)
                .await
            {
                Ok(Some(reason)) => reason,
                Ok(None) => "transaction failed".to_string(),
                Err(e) => format!("transaction failed: {e}"),
            };
            self.fail(row, reason.clone())?;
            return Ok(PublishOutcome::Failed { reason });
        }

        let block = match self.contract.block_info(mined.block_number).await {
            Ok(block) => block,
            Err(e) => {
                let reason = e.to_string();
                self.fail(row, reason.clone())?;
                return Ok(PublishOutcome::Failed { reason });
            }
        };
        row.mark_completed(block.number, block.timestamp);
        self.storage().update_committed_state(row)?;
        tracing::info!(
            tx_hash = %mined.tx_hash,
            block = block.number,
            "State was successfully transited"
        );
        Ok(PublishOutcome::Published {
            tx_hash: mined.tx_hash,
        })
    }

    fn fail(&self, row: &mut CommittedState, reason: String) -> Result<(), StorageError> {
        tracing::warn!(committed_state = row.id, %reason, "State transition failed");
        row.mark_failed(reason);
        self.storage().update_committed_state(row)
    }

    /// Publish cycle with bounded retries.
    async fn run_cycle(&self, shutdown: &CancellationToken) {
        for attempt in 0..=self.config.max_retries {
            match self.publish_once(shutdown).await {
                Ok(PublishOutcome::Skipped(reason)) => {
                    tracing::debug!(%reason, "Nothing to publish");
                    return;
                }
                Ok(outcome) => {
                    tracing::debug!(?outcome, "Publish cycle finished");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, attempt, "Publish cycle failed");
                }
            }
            if attempt == self.config.max_retries {
                tracing::error!("Giving up until the next tick");
                return;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Reconcile, then publish on every tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            match self.reconcile().await {
                Ok(report) => {
                    tracing::info!(
                        completed = report.completed,
                        failed = report.failed,
                        "Previous session reconciled"
                    );
                    break;
                }
                Err(e) => tracing::error!(error = %e, "Failed to reconcile previous session"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        let mut interval = tokio::time::interval(self.config.publish_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("State publisher stopped");
                    return;
                }
                _ = interval.tick() => {}
                _ = self.trigger.fired() => {
                    tracing::debug!("Publish requested");
                }
            }
            self.run_cycle(&shutdown).await;
        }
    }
}
