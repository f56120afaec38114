use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use alloy_consensus::{SignableTransaction as _, TxEip1559, TxEnvelope};
use alloy_eips::eip2718::Encodable2718 as _;
use alloy_network::TxSignerSync as _;
use alloy_primitives::{Address, Bytes, TxKind, U256};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use squall_driver::{RpcClient, RpcError, SignedTransaction};
use tracing::info;

/// Fee cap generous enough to never stall synthetic traffic.
const MAX_FEE_PER_GAS: u128 = 10_000_000_000_000; // 10k gwei
const TRANSFER_GAS_LIMIT: u64 = 21_000;

/// Funds granted to every generated user account.
const USER_FUNDS_WEI: u128 = 1_000_000_000_000_000_000; // 1 ether

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("invalid private key: {0}")]
    BadKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("user funding failed: {0}")]
    Funding(String),
    #[error("unknown application type {0}")]
    UnknownType(String),
}

/// An on-chain identity owning a key, a nonce counter and a chain id.
pub struct Account {
    signer: PrivateKeySigner,
    address: Address,
    chain_id: u64,
    nonce: AtomicU64,
}

impl Account {
    #[must_use]
    pub fn generate(chain_id: u64) -> Self {
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        Self {
            signer,
            address,
            chain_id,
            nonce: AtomicU64::new(0),
        }
    }

    pub fn from_private_key(key: &str, chain_id: u64) -> Result<Self, AppError> {
        let signer: PrivateKeySigner = key
            .trim_start_matches("0x")
            .parse()
            .map_err(|err| AppError::BadKey(format!("{err}")))?;
        let address = signer.address();
        Ok(Self {
            signer,
            address,
            chain_id,
            nonce: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Aligns the local nonce counter with the chain.
    pub async fn sync_nonce(&self, rpc: &Arc<dyn RpcClient>) -> Result<(), RpcError> {
        let nonce = rpc.nonce_at(self.address).await?;
        self.nonce.store(nonce, Ordering::SeqCst);
        Ok(())
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    /// Builds and signs one value transfer.
    pub fn sign_transfer(&self, to: Address, value: U256) -> Result<SignedTransaction, AppError> {
        self.sign_call(to, value, Bytes::new(), TRANSFER_GAS_LIMIT)
    }

    /// Builds and signs a call carrying a payload, e.g. a governance update.
    pub fn sign_call(
        &self,
        to: Address,
        value: U256,
        input: Bytes,
        gas_limit: u64,
    ) -> Result<SignedTransaction, AppError> {
        let nonce = self.next_nonce();
        let mut tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: MAX_FEE_PER_GAS,
            max_priority_fee_per_gas: 0,
            to: TxKind::Call(to),
            value,
            input,
            ..Default::default()
        };
        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|err| AppError::Signing(err.to_string()))?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let envelope: TxEnvelope = signed.into();
        Ok(SignedTransaction {
            hash,
            sender: self.address,
            nonce,
            raw: envelope.encoded_2718(),
        })
    }
}

/// Produces a stream of transactions to generate traffic on the chain.
/// Implementations count their own output; the count only ever grows.
pub trait User: Send + Sync {
    fn generate_tx(&self) -> Result<SignedTransaction, AppError>;

    fn sent_transactions(&self) -> u64;

    fn address(&self) -> Address;
}

/// User issuing plain value self-transfers, the cheapest traffic the chain
/// accepts.
pub struct TransferUser {
    account: Account,
    sent: AtomicU64,
}

impl TransferUser {
    #[must_use]
    pub fn new(account: Account) -> Self {
        Self {
            account,
            sent: AtomicU64::new(0),
        }
    }
}

impl User for TransferUser {
    fn generate_tx(&self) -> Result<SignedTransaction, AppError> {
        let tx = self.account.sign_transfer(self.account.address(), U256::ZERO)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(tx)
    }

    fn sent_transactions(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn address(&self) -> Address {
        self.account.address()
    }
}

/// Shared environment applications run in: one RPC connection and the
/// treasury that funds generated users.
pub struct AppContext {
    rpc: Arc<dyn RpcClient>,
    treasury: Account,
}

impl AppContext {
    pub async fn new(rpc: Arc<dyn RpcClient>, treasury: Account) -> Result<Self, AppError> {
        treasury.sync_nonce(&rpc).await?;
        Ok(Self { rpc, treasury })
    }

    #[must_use]
    pub fn rpc(&self) -> Arc<dyn RpcClient> {
        Arc::clone(&self.rpc)
    }

    #[must_use]
    pub fn treasury(&self) -> &Account {
        &self.treasury
    }
}

impl std::fmt::Debug for dyn Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application").finish()
    }
}

/// An application traffic is generated for.
#[async_trait]
pub trait Application: Send + Sync {
    /// Creates and funds users able to generate transactions for this
    /// application.
    async fn create_users(
        &self,
        context: &AppContext,
        num_users: usize,
    ) -> Result<Vec<Arc<dyn User>>, AppError>;

    /// Total number of this application's transactions the chain has
    /// processed so far.
    async fn received_transactions(&self, rpc: &Arc<dyn RpcClient>) -> Result<u64, AppError>;
}

/// Instantiates the application backing the scenario's `type` string.
pub fn new_application(
    app_type: &str,
    chain_id: u64,
    app_id: u32,
) -> Result<Arc<dyn Application>, AppError> {
    match app_type {
        "transfer" => Ok(Arc::new(TransferApplication::new(chain_id, app_id))),
        other => Err(AppError::UnknownType(other.to_owned())),
    }
}

/// Value-transfer application: users send self-transfers, and the chain-side
/// progress is the sum of their account nonces.
pub struct TransferApplication {
    chain_id: u64,
    app_id: u32,
    user_addresses: Mutex<Vec<Address>>,
}

impl TransferApplication {
    #[must_use]
    pub fn new(chain_id: u64, app_id: u32) -> Self {
        Self {
            chain_id,
            app_id,
            user_addresses: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Application for TransferApplication {
    async fn create_users(
        &self,
        context: &AppContext,
        num_users: usize,
    ) -> Result<Vec<Arc<dyn User>>, AppError> {
        info!(app_id = self.app_id, num_users, "creating users");

        let mut users: Vec<Arc<dyn User>> = Vec::with_capacity(num_users);
        let mut funding = Vec::with_capacity(num_users);
        for _ in 0..num_users {
            let account = Account::generate(self.chain_id);
            let grant = context
                .treasury
                .sign_transfer(account.address(), U256::from(USER_FUNDS_WEI))?;
            let hash = context.rpc.send_raw_transaction(&grant.raw).await?;
            funding.push(hash);
            users.push(Arc::new(TransferUser::new(account)));
        }

        for hash in funding {
            let receipt = context.rpc.wait_transaction_receipt(hash).await?;
            if !receipt.succeeded() {
                return Err(AppError::Funding(format!(
                    "funding transaction {hash} was rejected"
                )));
            }
        }

        self.user_addresses
            .lock()
            .expect("application poisoned")
            .extend(users.iter().map(|user| user.address()));
        Ok(users)
    }

    async fn received_transactions(&self, rpc: &Arc<dyn RpcClient>) -> Result<u64, AppError> {
        let addresses = self
            .user_addresses
            .lock()
            .expect("application poisoned")
            .clone();
        let mut total = 0u64;
        for address in addresses {
            total += rpc.nonce_at(address).await?;
        }
        Ok(total)
    }
}
