//! `ethers`-backed state contract client.

use std::sync::Arc;

use ethers::contract::{abigen, ContractError};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, PendingTransaction, Provider, ProviderError, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockId, BlockNumber, TransactionRequest, H256, U256, U64};
use num_bigint::BigUint;

use super::chain::{
    classify_error, BlockInfo, ChainError, MinedTx, StateContract, TransitStateArgs, TxHash,
};
use crate::field::Hash;

abigen!(
    StateStore,
    r#"[
        function transitState(uint256 id, uint256 oldState, uint256 newState, bool isOldStateGenesis, uint256[2] a, uint256[2][2] b, uint256[2] c) external
        function getStateInfoByState(uint256 state) external view returns (uint256, uint256, uint256, uint256, uint256, uint256, uint256)
    ]"#
);

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EthStateContract {
    client: Arc<Client>,
    contract: StateStore<Client>,
}

impl EthStateContract {
    /// Connect to `rpc_url` and sign with `private_key` (hex).
    pub async fn connect(
        rpc_url: &str,
        contract_address: &str,
        private_key: &str,
    ) -> Result<Self, ChainError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ChainError::InvalidArgument(format!("rpc url: {e}")))?;
        let chain_id = provider.get_chainid().await.map_err(provider_error)?;
        let wallet = private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| ChainError::InvalidArgument(format!("ethereum private key: {e}")))?
            .with_chain_id(chain_id.as_u64());
        let address = contract_address
            .parse::<Address>()
            .map_err(|e| ChainError::InvalidArgument(format!("contract address: {e}")))?;

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = StateStore::new(address, client.clone());
        tracing::info!(
            chain_id = chain_id.as_u64(),
            account = ?client.address(),
            contract = ?address,
            "Connected to state contract"
        );
        Ok(EthStateContract { client, contract })
    }
}

fn provider_error(err: ProviderError) -> ChainError {
    let revert = err
        .as_error_response()
        .and_then(|resp| resp.as_revert_data());
    classify_error(&err.to_string(), revert.as_deref())
}

fn contract_error(err: ContractError<Client>) -> ChainError {
    let revert = err.as_revert().cloned();
    classify_error(&err.to_string(), revert.as_deref())
}

fn to_u256(value: &BigUint) -> Result<U256, ChainError> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return Err(ChainError::InvalidArgument(format!(
            "{value} does not fit in uint256"
        )));
    }
    Ok(U256::from_big_endian(&bytes))
}

fn pair(values: &[BigUint; 2]) -> Result<[U256; 2], ChainError> {
    Ok([to_u256(&values[0])?, to_u256(&values[1])?])
}

#[async_trait::async_trait]
impl StateContract for EthStateContract {
    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        let nonce = self
            .client
            .get_transaction_count(
                self.client.address(),
                Some(BlockId::Number(BlockNumber::Pending)),
            )
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(nonce.as_u64())
    }

    async fn transit_state(
        &self,
        args: &TransitStateArgs,
        nonce: u64,
    ) -> Result<TxHash, ChainError> {
        let proof = &args.proof;
        let call = self
            .contract
            .transit_state(
                to_u256(&args.id)?,
                to_u256(&args.old_state.to_biguint())?,
                to_u256(&args.new_state.to_biguint())?,
                args.is_old_state_genesis,
                pair(&proof.a)?,
                [pair(&proof.b[0])?, pair(&proof.b[1])?],
                pair(&proof.c)?,
            )
            .nonce(nonce);
        let pending = call.send().await.map_err(contract_error)?;
        Ok(TxHash(pending.tx_hash().0))
    }

    async fn wait_mined(&self, tx: &TxHash) -> Result<MinedTx, ChainError> {
        let receipt = PendingTransaction::new(H256(tx.0), self.client.provider())
            .confirmations(1)
            .await
            .map_err(provider_error)?
            .ok_or_else(|| ChainError::Dropped(tx.to_string()))?;
        let block_number = receipt
            .block_number
            .ok_or_else(|| ChainError::Rpc(format!("receipt of {tx} has no block number")))?;
        Ok(MinedTx {
            tx_hash: *tx,
            block_number: block_number.as_u64(),
            success: receipt.status == Some(U64::from(1)),
        })
    }

    async fn revert_reason(&self, tx: &TxHash, block: u64) -> Result<Option<String>, ChainError> {
        let Some(sent) = self
            .client
            .get_transaction(H256(tx.0))
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?
        else {
            return Ok(None);
        };

        let mut replay = TransactionRequest::new()
            .from(sent.from)
            .data(sent.input.clone())
            .value(sent.value)
            .gas(sent.gas);
        if let Some(to) = sent.to {
            replay = replay.to(to);
        }
        let at = BlockId::Number(BlockNumber::Number(block.into()));
        match self.client.provider().call(&replay.into(), Some(at)).await {
            Ok(_) => Ok(None),
            Err(err) => match provider_error(err) {
                ChainError::Reverted(reason) => Ok(Some(reason)),
                ChainError::StateNotFound => Ok(Some(super::chain::STATE_DOES_NOT_EXIST.into())),
                other => Err(other),
            },
        }
    }

    async fn block_info(&self, number: u64) -> Result<BlockInfo, ChainError> {
        let block = self
            .client
            .get_block(number)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?
            .ok_or_else(|| ChainError::Rpc(format!("block {number} not found")))?;
        Ok(BlockInfo {
            number: block.number.map(|n| n.as_u64()).unwrap_or(number),
            timestamp: block.timestamp.as_u64(),
        })
    }

    async fn state_exists(&self, state: &Hash) -> Result<bool, ChainError> {
        let result = self
            .contract
            .get_state_info_by_state(to_u256(&state.to_biguint())?)
            .call()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => match contract_error(err) {
                ChainError::StateNotFound => Ok(false),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_conversion() {
        assert_eq!(to_u256(&BigUint::from(258u16)).unwrap(), U256::from(258));
        let too_big = BigUint::from_bytes_be(&[1u8; 33]);
        assert!(matches!(
            to_u256(&too_big),
            Err(ChainError::InvalidArgument(_))
        ));
    }
}
