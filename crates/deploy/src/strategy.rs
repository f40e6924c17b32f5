//! Per-unit deployment decisions.
//!
//! Each unit is compared against its stored record and the live chain, then either reused,
//! deployed, deployed behind a proxy, upgraded in place, or redeployed. A record is written only
//! once every transaction of the chosen path is confirmed.

use alloy_core::{
    dyn_abi::{DynSolValue, JsonAbiExt},
    json_abi::{Function, JsonAbi},
    primitives::{Address, B256, Bytes, b256},
};
use anyhow::{Context, Result};

use crate::{
    accounts::AccountResolver,
    args::{ArgResolver, select_function},
    artifacts::{ArtifactRegistry, ContractArtifact},
    backend::ChainBackend,
    external::ExternalRefLoader,
    store::{ArtifactStore, DeploymentRecord},
    unit::{ArgSpec, ProxyKind, Strategy, Unit},
};

/// ERC-1967 storage slot holding the admin of a transparent proxy.
pub const ERC1967_ADMIN_SLOT: B256 =
    b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

/// What processing a unit did on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeployOutcome {
    /// Configuration-only unit; nothing to deploy.
    Configured,
    /// Stored record matches the artifact and the contract is live.
    Reused,
    /// First deployment of a plain unit.
    Deployed,
    /// First deployment of an implementation behind a new proxy.
    ProxyDeployed,
    /// New implementation behind the existing proxy.
    Upgraded,
    /// Plain unit deployed again to a new address.
    Redeployed,
}

impl DeployOutcome {
    /// Whether this outcome submitted transactions.
    pub fn changed_chain(&self) -> bool {
        !matches!(self, Self::Configured | Self::Reused)
    }
}

/// Decide what to do with a unit.
///
/// `live` tells whether the caller-facing address of the existing record still holds code.
/// A record without live code is stale and leads to a fresh deployment.
pub fn decide(
    strategy: Strategy,
    existing: Option<&DeploymentRecord>,
    bytecode_hash: B256,
    live: bool,
) -> DeployOutcome {
    let fresh = match strategy {
        Strategy::Configure => return DeployOutcome::Configured,
        Strategy::Plain => DeployOutcome::Deployed,
        Strategy::Proxied => DeployOutcome::ProxyDeployed,
    };

    let Some(record) = existing else {
        return fresh;
    };
    if !live {
        return match strategy {
            Strategy::Plain => DeployOutcome::Redeployed,
            _ => fresh,
        };
    }
    if record.bytecode_hash == bytecode_hash {
        return DeployOutcome::Reused;
    }

    match (strategy, record.proxy_address) {
        (Strategy::Proxied, Some(_)) => DeployOutcome::Upgraded,
        (Strategy::Proxied, None) => DeployOutcome::ProxyDeployed,
        _ => DeployOutcome::Redeployed,
    }
}

/// The upgrade function of an admin contract: `(proxy, implementation)` or
/// `(proxy, implementation, data)`.
fn admin_upgrade_function<'a>(admin_abi: &'a JsonAbi, method: &str) -> Result<&'a Function> {
    select_function(admin_abi, method, 3)
        .or_else(|_| select_function(admin_abi, method, 2))
        .with_context(|| format!("Admin contract has no upgrade method `{}`", method))
}

fn admin_upgrade_args(function: &Function, proxy: Address, implementation: Address) -> Result<Vec<DynSolValue>> {
    let mut args = vec![DynSolValue::Address(proxy), DynSolValue::Address(implementation)];
    match function.inputs.len() {
        2 => {}
        3 => args.push(DynSolValue::Bytes(Vec::new())),
        n => anyhow::bail!("Upgrade method `{}` takes {} parameters", function.signature(), n),
    }
    Ok(args)
}

fn append_args(bytecode: &Bytes, args: Vec<u8>) -> Bytes {
    let mut init_code = bytecode.to_vec();
    init_code.extend(args);
    init_code.into()
}

/// Applies the deployment strategy of units.
pub struct DeploymentStrategy<'a, B> {
    backend: &'a B,
    artifacts: &'a ArtifactRegistry,
    accounts: &'a AccountResolver,
    external: &'a ExternalRefLoader,
}

impl<'a, B: ChainBackend> DeploymentStrategy<'a, B> {
    pub fn new(
        backend: &'a B,
        artifacts: &'a ArtifactRegistry,
        accounts: &'a AccountResolver,
        external: &'a ExternalRefLoader,
    ) -> Self {
        Self {
            backend,
            artifacts,
            accounts,
            external,
        }
    }

    fn resolver<'s, S: ArtifactStore>(&'s self, store: &'s S) -> ArgResolver<'s, B, S> {
        ArgResolver::new(self.backend, store, self.accounts, self.external)
    }

    /// Bring `unit` up to date and persist its record.
    pub async fn apply<S: ArtifactStore>(&self, store: &mut S, unit: &Unit) -> Result<DeployOutcome> {
        if unit.strategy == Strategy::Configure {
            tracing::debug!(unit = %unit.name, "Configuration-only unit, nothing to deploy");
            return Ok(DeployOutcome::Configured);
        }

        let artifact = self.artifacts.get(unit.contract_name())?;
        let bytecode_hash = artifact.bytecode_hash();
        let existing = store.get(&unit.name)?;

        let live = match &existing {
            Some(record) => self
                .backend
                .code_hash(record.caller_address())
                .await
                .context("Failed to check the deployed code")?
                .is_some(),
            None => false,
        };

        if let Some(record) = existing.as_ref().filter(|_| !live) {
            tracing::warn!(
                unit = %unit.name,
                address = %record.caller_address(),
                "Stored deployment has no code on chain, deploying again"
            );
        }

        let outcome = decide(unit.strategy, existing.as_ref(), bytecode_hash, live);
        let record = match outcome {
            DeployOutcome::Configured => return Ok(outcome),
            DeployOutcome::Reused => {
                if let Some(record) = &existing {
                    tracing::info!(
                        unit = %unit.name,
                        address = %record.caller_address(),
                        "Unit unchanged, reusing deployment"
                    );
                }
                return Ok(outcome);
            }
            DeployOutcome::Deployed | DeployOutcome::Redeployed => {
                self.deploy_plain(&*store, unit, artifact).await?
            }
            DeployOutcome::ProxyDeployed => self.deploy_proxied(&mut *store, unit, artifact).await?,
            DeployOutcome::Upgraded => {
                let existing = existing.as_ref().context("Upgrade requires a stored record")?;
                self.upgrade(&*store, unit, artifact, existing).await?
            }
        };

        store
            .put(&unit.name, &record)
            .with_context(|| format!("Failed to store the record of `{}`", unit.name))?;

        Ok(outcome)
    }

    async fn deploy_plain<S: ArtifactStore>(
        &self,
        store: &S,
        unit: &Unit,
        artifact: &ContractArtifact,
    ) -> Result<DeploymentRecord> {
        let signer = self.accounts.resolve(&unit.deployer)?;
        let init_code = self
            .resolver(store)
            .encode_constructor(artifact, &unit.init_args)
            .await
            .context("Failed to prepare constructor arguments")?;

        let receipt = self
            .backend
            .deploy_contract(init_code, signer.address)
            .await
            .with_context(|| format!("Failed to deploy `{}`", unit.contract_name()))?;

        tracing::info!(
            unit = %unit.name,
            contract = %unit.contract_name(),
            address = %receipt.address,
            tx_hash = %receipt.transaction_hash,
            "Contract deployed"
        );

        Ok(DeploymentRecord::new(
            unit.contract_name(),
            receipt.address,
            artifact.bytecode_hash(),
            artifact.abi.clone(),
        )
        .with_transaction(receipt.transaction_hash))
    }

    /// Deploy a parameterless implementation of `unit`.
    async fn deploy_implementation<S: ArtifactStore>(
        &self,
        store: &S,
        unit: &Unit,
        artifact: &ContractArtifact,
        from: Address,
    ) -> Result<Address> {
        let init_code = self
            .resolver(store)
            .encode_constructor(artifact, &[])
            .await
            .context("Implementations behind a proxy must have a parameterless constructor")?;

        let receipt = self
            .backend
            .deploy_contract(init_code, from)
            .await
            .with_context(|| format!("Failed to deploy implementation `{}`", unit.contract_name()))?;

        tracing::info!(
            unit = %unit.name,
            contract = %unit.contract_name(),
            address = %receipt.address,
            "Implementation deployed"
        );
        Ok(receipt.address)
    }

    /// The shared admin contract of transparent proxies, deployed on first use.
    ///
    /// It is recorded under its artifact name and never replaced while it holds code, since
    /// every transparent proxy of the network points at it.
    async fn ensure_proxy_admin<S: ArtifactStore>(&self, store: &mut S, unit: &Unit) -> Result<Address> {
        let name = unit.proxy.admin_contract.as_str();
        let owner = self.accounts.resolve(unit.proxy_admin())?;

        if let Some(record) = store.get(name)? {
            let live = self
                .backend
                .code_hash(record.address)
                .await
                .context("Failed to check the proxy admin code")?
                .is_some();

            if live {
                if record.owner.is_some_and(|recorded| recorded != owner.address) {
                    anyhow::bail!(
                        "Proxy admin `{}` at {} is owned by {:?}, but role `{}` resolves to {}",
                        name,
                        record.address,
                        record.owner,
                        owner.role,
                        owner.address
                    );
                }
                return Ok(record.address);
            }

            tracing::warn!(
                contract = %name,
                address = %record.address,
                "Stored proxy admin has no code on chain, deploying again"
            );
        }

        let artifact = self.artifacts.get(name)?;
        // OpenZeppelin 4 admins take their owner from the sender, 5 from the constructor.
        let owner_arg = [ArgSpec::role(unit.proxy_admin())];
        let args: &[ArgSpec] = match artifact.abi.constructor() {
            Some(constructor) if constructor.inputs.len() == 1 => &owner_arg,
            _ => &[],
        };
        let init_code = self
            .resolver(&*store)
            .encode_constructor(artifact, args)
            .await
            .context("Failed to prepare proxy admin constructor")?;

        let receipt = self
            .backend
            .deploy_contract(init_code, owner.address)
            .await
            .with_context(|| format!("Failed to deploy proxy admin `{}`", name))?;

        tracing::info!(
            contract = %name,
            address = %receipt.address,
            owner = %owner.address,
            "Proxy admin deployed"
        );

        let record = DeploymentRecord::new(name, receipt.address, artifact.bytecode_hash(), artifact.abi.clone())
            .with_owner(owner.address)
            .with_transaction(receipt.transaction_hash);
        store
            .put(name, &record)
            .with_context(|| format!("Failed to store the record of `{}`", name))?;

        Ok(receipt.address)
    }

    async fn deploy_proxied<S: ArtifactStore>(
        &self,
        store: &mut S,
        unit: &Unit,
        artifact: &ContractArtifact,
    ) -> Result<DeploymentRecord> {
        let proxy_artifact = self.artifacts.get(&unit.proxy.contract)?;
        let signer = self.accounts.resolve(&unit.deployer)?;
        let admin = self.accounts.resolve(unit.proxy_admin())?;

        // Everything the initializer needs is resolved before the first transaction.
        let has_initializer = artifact.abi.function(&unit.proxy.initializer).is_some();
        let init_call = if has_initializer || !unit.init_args.is_empty() {
            Some(
                self.resolver(&*store)
                    .encode_call(&artifact.abi, &unit.proxy.initializer, &unit.init_args)
                    .await
                    .with_context(|| format!("Failed to prepare `{}` call", unit.proxy.initializer))?,
            )
        } else {
            None
        };

        let constructor = proxy_artifact
            .abi
            .constructor()
            .with_context(|| format!("Proxy contract `{}` has no constructor", unit.proxy.contract))?;
        if unit.proxy.has_admin_contract() && constructor.inputs.len() < 2 {
            anyhow::bail!(
                "Transparent proxy contract `{}` must take an admin constructor argument",
                unit.proxy.contract
            );
        }

        // The account-owned admin of a transparent proxy could not call through it.
        let admin_arg = match unit.proxy.kind {
            ProxyKind::Transparent => self.ensure_proxy_admin(store, unit).await?,
            ProxyKind::TransparentV5 | ProxyKind::Owned => admin.address,
        };

        let implementation = self
            .deploy_implementation(&*store, unit, artifact, signer.address)
            .await?;

        let mut proxy_args = vec![DynSolValue::Address(implementation)];
        let initialized_on_construction = match constructor.inputs.len() {
            1 => false,
            2 => {
                proxy_args.push(DynSolValue::Address(admin_arg));
                false
            }
            3 => {
                proxy_args.push(DynSolValue::Address(admin_arg));
                let data = init_call.as_ref().map(|data| data.to_vec()).unwrap_or_default();
                proxy_args.push(DynSolValue::Bytes(data));
                true
            }
            n => anyhow::bail!(
                "Proxy contract `{}` has an unsupported constructor with {} parameters",
                unit.proxy.contract,
                n
            ),
        };

        let proxy_code = append_args(
            &proxy_artifact.bytecode,
            constructor
                .abi_encode_input(&proxy_args)
                .context("Failed to encode proxy constructor arguments")?,
        );
        let proxy = self
            .backend
            .deploy_contract(proxy_code, signer.address)
            .await
            .with_context(|| format!("Failed to deploy proxy `{}`", unit.proxy.contract))?;

        let proxy_admin = match unit.proxy.kind {
            ProxyKind::Transparent => Some(admin_arg),
            ProxyKind::TransparentV5 => Some(self.read_proxy_admin(proxy.address).await?),
            ProxyKind::Owned => None,
        };

        tracing::info!(
            unit = %unit.name,
            kind = %unit.proxy.kind,
            proxy = %proxy.address,
            implementation = %implementation,
            admin = %proxy_admin.unwrap_or(admin.address),
            "Proxy deployed"
        );

        match init_call {
            Some(_) if initialized_on_construction => {
                tracing::info!(
                    unit = %unit.name,
                    method = %unit.proxy.initializer,
                    "Initialized during proxy construction"
                );
            }
            Some(calldata) => {
                let receipt = self
                    .backend
                    .send_call(proxy.address, calldata, signer.address)
                    .await
                    .with_context(|| format!("Initializer `{}` failed", unit.proxy.initializer))?;
                tracing::info!(
                    unit = %unit.name,
                    method = %unit.proxy.initializer,
                    tx_hash = %receipt.transaction_hash,
                    "Proxy initialized"
                );
            }
            None => {}
        }

        Ok(DeploymentRecord::new(
            unit.contract_name(),
            implementation,
            artifact.bytecode_hash(),
            artifact.abi.clone(),
        )
        .with_proxy(proxy.address)
        .with_proxy_admin(proxy_admin)
        .with_transaction(proxy.transaction_hash))
    }

    /// The admin contract a transparent proxy stores in its ERC-1967 admin slot.
    async fn read_proxy_admin(&self, proxy: Address) -> Result<Address> {
        let word = self
            .backend
            .storage_at(proxy, ERC1967_ADMIN_SLOT)
            .await
            .context("Failed to read the proxy admin slot")?;

        let admin = Address::from_word(word);
        if admin.is_zero() {
            anyhow::bail!("Proxy {} has no admin in its ERC-1967 admin slot", proxy);
        }
        Ok(admin)
    }

    async fn upgrade<S: ArtifactStore>(
        &self,
        store: &S,
        unit: &Unit,
        artifact: &ContractArtifact,
        existing: &DeploymentRecord,
    ) -> Result<DeploymentRecord> {
        let proxy = existing
            .proxy_address
            .context("Upgrade requires a stored proxy address")?;
        let signer = self.accounts.resolve(&unit.deployer)?;
        let admin = self.accounts.resolve(unit.proxy_admin())?;
        let method = unit.proxy.upgrade_method();

        // Resolve the upgrade call before deploying anything.
        let (target, function) = if unit.proxy.has_admin_contract() {
            let admin_contract = existing.proxy_admin.with_context(|| {
                format!("Stored record of `{}` has no proxy admin to upgrade through", unit.name)
            })?;
            let admin_abi = &self.artifacts.get(&unit.proxy.admin_contract)?.abi;
            (admin_contract, admin_upgrade_function(admin_abi, method)?.clone())
        } else {
            let proxy_abi = &self.artifacts.get(&unit.proxy.contract)?.abi;
            let function = select_function(proxy_abi, method, 1).with_context(|| {
                format!("Proxy contract `{}` has no upgrade method `{}`", unit.proxy.contract, method)
            })?;
            (proxy, function.clone())
        };

        let implementation = self
            .deploy_implementation(store, unit, artifact, signer.address)
            .await?;

        let args = if unit.proxy.has_admin_contract() {
            admin_upgrade_args(&function, proxy, implementation)?
        } else {
            vec![DynSolValue::Address(implementation)]
        };
        let calldata = function
            .abi_encode_input(&args)
            .context("Failed to encode upgrade call")?;
        let receipt = self
            .backend
            .send_call(target, calldata.into(), admin.address)
            .await
            .with_context(|| format!("Upgrade call `{}` failed", function.signature()))?;

        tracing::info!(
            unit = %unit.name,
            proxy = %proxy,
            implementation = %implementation,
            via = %target,
            tx_hash = %receipt.transaction_hash,
            "Proxy upgraded"
        );

        Ok(DeploymentRecord::new(
            unit.contract_name(),
            implementation,
            artifact.bytecode_hash(),
            artifact.abi.clone(),
        )
        .with_proxy(proxy)
        .with_proxy_admin(existing.proxy_admin)
        .with_transaction(receipt.transaction_hash))
    }
}
