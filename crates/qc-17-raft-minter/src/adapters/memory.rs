//! In-memory pool, state and a value-transfer executor
//!
//! Used by single-node deployments and by tests. The executor implements
//! plain value transfers only; contract execution stays behind the
//! [`Executor`] port.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;
use sha3::{Digest, Keccak256};
use shared_types::entities::{Address, Hash, SignedTransaction, U256};

use crate::ports::{AccountState, BlockContext, ExecutionError, Executor, StateDb, TxPool};

/// Base cost of every transaction
pub const TX_BASE_GAS: u64 = 21_000;

/// Cost per byte of call data
pub const TX_DATA_GAS_PER_BYTE: u64 = 16;

/// FIFO transaction pool
#[derive(Default)]
pub struct InMemoryTxPool {
    pending: Mutex<Vec<SignedTransaction>>,
}

impl InMemoryTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transaction. Returns false if it is already pending.
    pub fn add(&self, tx: SignedTransaction) -> bool {
        let mut pending = self.pending.lock();
        let hash = tx.hash();
        if pending.iter().any(|queued| queued.hash() == hash) {
            return false;
        }
        pending.push(tx);
        true
    }
}

impl TxPool for InMemoryTxPool {
    fn pending(&self) -> Vec<SignedTransaction> {
        self.pending.lock().clone()
    }

    fn remove_included(&self, hashes: &[Hash]) {
        let included: HashSet<&Hash> = hashes.iter().collect();
        self.pending
            .lock()
            .retain(|tx| !included.contains(&tx.hash()));
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Account map with a Keccak commitment over its sorted entries
#[derive(Clone, Debug, Default)]
pub struct InMemoryStateDb {
    accounts: BTreeMap<Address, AccountState>,
}

impl InMemoryStateDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// State with pre-funded accounts
    pub fn with_balances(balances: &[(Address, U256)]) -> Self {
        let accounts = balances
            .iter()
            .map(|(address, balance)| {
                (
                    *address,
                    AccountState {
                        balance: *balance,
                        nonce: 0,
                    },
                )
            })
            .collect();
        Self { accounts }
    }
}

impl StateDb for InMemoryStateDb {
    fn root(&self) -> Hash {
        let mut hasher = Keccak256::new();
        let mut balance = [0u8; 32];
        for (address, account) in &self.accounts {
            account.balance.to_big_endian(&mut balance);
            hasher.update(address);
            hasher.update(balance);
            hasher.update(account.nonce.to_be_bytes());
        }
        hasher.finalize().into()
    }

    fn fork(&self) -> Box<dyn StateDb> {
        Box::new(self.clone())
    }

    fn account(&self, address: &Address) -> AccountState {
        self.accounts.get(address).cloned().unwrap_or_default()
    }

    fn set_account(&mut self, address: Address, account: AccountState) {
        self.accounts.insert(address, account);
    }
}

/// Executes value transfers with intrinsic gas accounting
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferExecutor;

impl TransferExecutor {
    pub fn intrinsic_gas(tx: &SignedTransaction) -> u64 {
        TX_BASE_GAS + TX_DATA_GAS_PER_BYTE * tx.data.len() as u64
    }
}

impl Executor for TransferExecutor {
    fn execute(
        &self,
        state: &mut dyn StateDb,
        tx: &SignedTransaction,
        _ctx: &BlockContext,
    ) -> Result<u64, ExecutionError> {
        let gas = Self::intrinsic_gas(tx);
        if gas > tx.gas_limit {
            return Err(ExecutionError::IntrinsicGas {
                required: gas,
                limit: tx.gas_limit,
            });
        }

        let mut sender = state.account(&tx.from);
        if sender.nonce != tx.nonce {
            return Err(ExecutionError::NonceMismatch {
                expected: sender.nonce,
                actual: tx.nonce,
            });
        }
        let cost = tx.value + tx.gas_price * U256::from(gas);
        if sender.balance < cost {
            return Err(ExecutionError::InsufficientBalance {
                required: cost,
                available: sender.balance,
            });
        }

        sender.balance -= cost;
        sender.nonce += 1;
        state.set_account(tx.from, sender);

        if let Some(to) = tx.to {
            let mut recipient = state.account(&to);
            recipient.balance += tx.value;
            state.set_account(to, recipient);
        }
        Ok(gas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: Address = [1u8; 20];
    const BOB: Address = [2u8; 20];

    fn ctx() -> BlockContext {
        BlockContext {
            height: 1,
            timestamp: 1,
            minter_id: 1,
        }
    }

    fn transfer(nonce: u64, value: u64) -> SignedTransaction {
        SignedTransaction {
            from: ALICE,
            to: Some(BOB),
            value: U256::from(value),
            nonce,
            gas_price: U256::from(1u64),
            gas_limit: 30_000,
            data: vec![0u8; 4],
            signature: [0u8; 64],
        }
    }

    #[test]
    fn test_pool_dedup_and_remove() {
        let pool = InMemoryTxPool::new();
        assert!(pool.add(transfer(0, 1)));
        assert!(!pool.add(transfer(0, 1)));
        assert!(pool.add(transfer(1, 1)));
        pool.remove_included(&[transfer(0, 1).hash()]);
        assert_eq!(pool.pending(), vec![transfer(1, 1)]);
    }

    #[test]
    fn test_transfer_moves_value_and_charges_gas() {
        let mut state = InMemoryStateDb::with_balances(&[(ALICE, U256::from(100_000u64))]);
        let gas = TransferExecutor
            .execute(&mut state, &transfer(0, 500), &ctx())
            .unwrap();
        assert_eq!(gas, 21_064);
        assert_eq!(state.account(&BOB).balance, U256::from(500u64));
        let alice = state.account(&ALICE);
        assert_eq!(alice.nonce, 1);
        assert_eq!(alice.balance, U256::from(100_000u64 - 500 - 21_064));
    }

    #[test]
    fn test_failures_leave_state_untouched() {
        let mut state = InMemoryStateDb::with_balances(&[(ALICE, U256::from(100u64))]);
        let root = state.root();
        assert!(matches!(
            TransferExecutor.execute(&mut state, &transfer(0, 50), &ctx()),
            Err(ExecutionError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            TransferExecutor.execute(&mut state, &transfer(3, 0), &ctx()),
            Err(ExecutionError::NonceMismatch { expected: 0, actual: 3 })
        ));
        assert_eq!(state.root(), root);
    }

    #[test]
    fn test_fork_is_independent() {
        let state = InMemoryStateDb::with_balances(&[(ALICE, U256::from(100_000u64))]);
        let mut fork = state.fork();
        TransferExecutor
            .execute(fork.as_mut(), &transfer(0, 1), &ctx())
            .unwrap();
        assert_ne!(fork.root(), state.root());
        assert_eq!(state.account(&ALICE).nonce, 0);
    }
}
