//! In-memory [`ChainBackend`] for tests and dry runs.
//!
//! [`FakeChain`] hands out deterministic addresses, records every deployment and call, and
//! answers reads from a table the test fills in. Failures can be injected per contract
//! (matched on the creation code prefix) or per method selector.
//!
//! Proxy bytecode registered with [`FakeChain::transparent_proxy`] or
//! [`FakeChain::self_administered_proxy`] behaves like a transparent proxy: its admin is
//! written to the ERC-1967 admin slot and calls from the admin are refused.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use alloy_core::primitives::{Address, B256, Bytes, keccak256};

use crate::{
    backend::{ChainBackend, DeployReceipt, TxReceipt},
    strategy::ERC1967_ADMIN_SLOT,
};

/// Number of accounts a fresh [`FakeChain`] exposes.
pub const FAKE_ACCOUNT_COUNT: usize = 10;

/// First address handed out to deployed contracts.
const FIRST_CONTRACT_ADDRESS: u64 = 0x1000;

/// A contract creation observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDeployment {
    pub address: Address,
    pub from: Address,
    pub init_code: Bytes,
}

/// A state-changing call observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub to: Address,
    pub from: Address,
    pub calldata: Bytes,
}

impl FakeCall {
    pub fn selector(&self) -> Option<[u8; 4]> {
        self.calldata.get(..4).and_then(|s| s.try_into().ok())
    }
}

#[derive(Debug)]
struct FakeState {
    accounts: Vec<Address>,
    next_address: u64,
    nonce: u64,
    code: HashMap<Address, B256>,
    reads: HashMap<(Address, Bytes), Bytes>,
    storage: HashMap<(Address, B256), B256>,
    /// Proxy creation code, and whether the proxy creates its own admin contract.
    transparent_code: Vec<(Bytes, bool)>,
    proxy_admins: HashMap<Address, Address>,
    deployments: Vec<FakeDeployment>,
    calls: Vec<FakeCall>,
    failing_init_code: Vec<Bytes>,
    failing_selectors: Vec<[u8; 4]>,
}

/// An in-memory chain.
#[derive(Debug)]
pub struct FakeChain {
    state: Mutex<FakeState>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    pub fn new() -> Self {
        let accounts = (1..=FAKE_ACCOUNT_COUNT as u8)
            .map(|i| Address::left_padding_from(&[0xac, i]))
            .collect();

        Self {
            state: Mutex::new(FakeState {
                accounts,
                next_address: FIRST_CONTRACT_ADDRESS,
                nonce: 0,
                code: HashMap::new(),
                reads: HashMap::new(),
                storage: HashMap::new(),
                transparent_code: Vec::new(),
                proxy_admins: HashMap::new(),
                deployments: Vec::new(),
                calls: Vec::new(),
                failing_init_code: Vec::new(),
                failing_selectors: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accounts the fake signs for, without going through the async trait.
    pub fn account_list(&self) -> Vec<Address> {
        self.state().accounts.clone()
    }

    /// Answer reads of `calldata` at `to` with `output`. Unset reads return one zero word.
    pub fn set_read(&self, to: Address, calldata: impl Into<Bytes>, output: impl Into<Bytes>) {
        self.state().reads.insert((to, calldata.into()), output.into());
    }

    /// Make every contract creation whose init code starts with `prefix` fail.
    pub fn fail_deployments_of(&self, prefix: impl Into<Bytes>) {
        self.state().failing_init_code.push(prefix.into());
    }

    /// Make every call with this 4-byte selector fail, as a revert would.
    pub fn fail_calls_with_selector(&self, selector: [u8; 4]) {
        self.state().failing_selectors.push(selector);
    }

    /// Treat contracts created from `bytecode` as transparent proxies taking
    /// `(logic, admin, ..)`.
    pub fn transparent_proxy(&self, bytecode: impl Into<Bytes>) {
        self.state().transparent_code.push((bytecode.into(), false));
    }

    /// Treat contracts created from `bytecode` as transparent proxies taking
    /// `(logic, initialOwner, ..)` that create their own admin contract.
    pub fn self_administered_proxy(&self, bytecode: impl Into<Bytes>) {
        self.state().transparent_code.push((bytecode.into(), true));
    }

    /// The admin of a transparent proxy.
    pub fn proxy_admin(&self, proxy: Address) -> Option<Address> {
        self.state().proxy_admins.get(&proxy).copied()
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_init_code.clear();
        state.failing_selectors.clear();
    }

    /// Drop all contract code, as a restarted development node would.
    pub fn wipe(&self) {
        let mut state = self.state();
        state.code.clear();
        state.reads.clear();
        state.storage.clear();
        state.proxy_admins.clear();
    }

    pub fn deployments(&self) -> Vec<FakeDeployment> {
        self.state().deployments.clone()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn deployment_count(&self) -> usize {
        self.state().deployments.len()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn has_code(&self, address: Address) -> bool {
        self.state().code.contains_key(&address)
    }

    fn next_address(state: &mut FakeState) -> Address {
        let address = Address::left_padding_from(&state.next_address.to_be_bytes());
        state.next_address += 1;
        address
    }

    /// Register the admin of a freshly created transparent proxy.
    fn administer(state: &mut FakeState, proxy: Address, init_code: &[u8]) {
        let Some((code_len, creates_admin)) = state
            .transparent_code
            .iter()
            .find(|(code, _)| init_code.starts_with(code) && init_code.len() >= code.len() + 64)
            .map(|(code, creates_admin)| (code.len(), *creates_admin))
        else {
            return;
        };

        // Second constructor word: the admin, or the owner of the admin contract.
        let word = &init_code[code_len + 32..code_len + 64];
        let admin = if creates_admin {
            let admin = Self::next_address(state);
            state.code.insert(admin, keccak256(word));
            admin
        } else {
            Address::from_slice(&word[12..])
        };

        state.proxy_admins.insert(proxy, admin);
        state.storage.insert((proxy, ERC1967_ADMIN_SLOT), admin.into_word());
    }

    fn next_tx_hash(state: &mut FakeState) -> B256 {
        state.nonce += 1;
        keccak256(state.nonce.to_be_bytes())
    }
}

impl ChainBackend for FakeChain {
    async fn accounts(&self) -> anyhow::Result<Vec<Address>> {
        Ok(self.account_list())
    }

    async fn deploy_contract(&self, init_code: Bytes, from: Address) -> anyhow::Result<DeployReceipt> {
        let mut state = self.state();

        if state
            .failing_init_code
            .iter()
            .any(|prefix| init_code.starts_with(prefix))
        {
            anyhow::bail!("contract creation reverted");
        }

        let address = Self::next_address(&mut state);
        state.code.insert(address, keccak256(&init_code));
        Self::administer(&mut state, address, &init_code);
        state.deployments.push(FakeDeployment {
            address,
            from,
            init_code,
        });

        Ok(DeployReceipt {
            address,
            transaction_hash: Self::next_tx_hash(&mut state),
        })
    }

    async fn send_call(&self, to: Address, calldata: Bytes, from: Address) -> anyhow::Result<TxReceipt> {
        let mut state = self.state();

        let call = FakeCall { to, from, calldata };
        if let Some(selector) = call.selector() {
            if state.failing_selectors.contains(&selector) {
                anyhow::bail!("execution reverted");
            }
        }
        if !state.code.contains_key(&to) {
            anyhow::bail!("call to {} which has no code", to);
        }
        if state.proxy_admins.get(&to) == Some(&from) {
            anyhow::bail!("execution reverted: admin cannot fallback to proxy target");
        }

        state.calls.push(call);
        let block_number = state.calls.len() as u64;

        Ok(TxReceipt {
            transaction_hash: Self::next_tx_hash(&mut state),
            block_number: Some(block_number),
        })
    }

    async fn read(&self, to: Address, calldata: Bytes) -> anyhow::Result<Bytes> {
        let state = self.state();
        Ok(state
            .reads
            .get(&(to, calldata))
            .cloned()
            .unwrap_or_else(|| Bytes::from(vec![0u8; 32])))
    }

    async fn storage_at(&self, address: Address, slot: B256) -> anyhow::Result<B256> {
        Ok(self
            .state()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }

    async fn code_hash(&self, address: Address) -> anyhow::Result<Option<B256>> {
        Ok(self.state().code.get(&address).copied())
    }
}
