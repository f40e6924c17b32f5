//! Argument resolution and ABI encoding.
//!
//! Declared arguments are turned into ABI values at execution time, against the parameter types
//! of the function (or constructor) being called. Literals are coerced from their textual form;
//! placeholders are resolved from the deployment store, the account resolver, the external
//! reference loader, or a read-only call.

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, FunctionExt, JsonAbiExt, Specifier},
    json_abi::{Function, JsonAbi, Param},
    primitives::{Address, Bytes},
};
use anyhow::{Context, Result};

use crate::{
    accounts::AccountResolver,
    artifacts::ContractArtifact,
    backend::ChainBackend,
    error::DeployError,
    external::{ExternalLookup, ExternalRefLoader},
    store::{ArtifactStore, DeploymentRecord},
    unit::{ArgSpec, Placeholder, ReadCall},
};

/// Find the function `method` taking `arity` arguments.
///
/// A method containing `(` is matched against full signatures (`grantRole(bytes32,address)`),
/// which disambiguates overloads.
pub fn select_function<'a>(abi: &'a JsonAbi, method: &str, arity: usize) -> Result<&'a Function> {
    if method.contains('(') {
        let signature: String = method.chars().filter(|c| !c.is_whitespace()).collect();
        return abi
            .functions()
            .find(|function| function.signature() == signature)
            .with_context(|| format!("No method with signature `{}`", method));
    }

    let candidates: Vec<&Function> = abi
        .function(method)
        .map(|overloads| {
            overloads
                .iter()
                .filter(|function| function.inputs.len() == arity)
                .collect()
        })
        .unwrap_or_default();

    match candidates.as_slice() {
        [function] => Ok(function),
        [] => anyhow::bail!("No method `{}` taking {} argument(s)", method, arity),
        _ => anyhow::bail!(
            "Method `{}` is overloaded with {} argument(s); use its full signature",
            method,
            arity
        ),
    }
}

/// Coerce a textual literal into a value of type `ty`.
fn coerce(ty: &DynSolType, literal: &str) -> Result<DynSolValue> {
    ty.coerce_str(literal)
        .with_context(|| format!("Cannot convert '{}' to {}", literal, ty.sol_type_name()))
}

fn address_value(ty: &DynSolType, address: Address) -> Result<DynSolValue> {
    match ty {
        DynSolType::Address => Ok(DynSolValue::Address(address)),
        _ => coerce(ty, &address.to_string()),
    }
}

/// Resolves declared arguments for one run.
pub struct ArgResolver<'a, B, S> {
    backend: &'a B,
    store: &'a S,
    accounts: &'a AccountResolver,
    external: &'a ExternalRefLoader,
}

impl<'a, B, S> ArgResolver<'a, B, S>
where
    B: ChainBackend,
    S: ArtifactStore,
{
    pub fn new(
        backend: &'a B,
        store: &'a S,
        accounts: &'a AccountResolver,
        external: &'a ExternalRefLoader,
    ) -> Self {
        Self {
            backend,
            store,
            accounts,
            external,
        }
    }

    /// The stored record of `unit`, which must already be deployed.
    pub fn record(&self, unit: &str) -> Result<DeploymentRecord> {
        self.store
            .get(unit)?
            .with_context(|| format!("Unit `{}` has no deployment record", unit))
    }

    /// Resolve one argument against the parameter type it is passed as.
    pub async fn resolve(&self, arg: &ArgSpec, ty: &DynSolType) -> Result<DynSolValue> {
        match arg {
            ArgSpec::Placeholder(Placeholder::Read(call)) => {
                let value = self.read(call).await?;
                if !ty.matches(&value) {
                    anyhow::bail!(
                        "`{}.{}` does not return a {}",
                        call.unit,
                        call.method,
                        ty.sol_type_name()
                    );
                }
                Ok(value)
            }
            other => self.resolve_static(other, ty),
        }
    }

    /// Resolve an argument that needs no chain access.
    fn resolve_static(&self, arg: &ArgSpec, ty: &DynSolType) -> Result<DynSolValue> {
        match arg {
            ArgSpec::Bool(value) => match ty {
                DynSolType::Bool => Ok(DynSolValue::Bool(*value)),
                _ => coerce(ty, &value.to_string()),
            },
            ArgSpec::Int(value) => coerce(ty, &value.to_string()),
            ArgSpec::Text(value) => coerce(ty, value),
            ArgSpec::Placeholder(Placeholder::Read(call)) => anyhow::bail!(
                "Nested read of `{}.{}` is not supported",
                call.unit,
                call.method
            ),
            ArgSpec::Placeholder(placeholder) => address_value(ty, self.address_of(placeholder)?),
        }
    }

    fn address_of(&self, placeholder: &Placeholder) -> Result<Address> {
        match placeholder {
            Placeholder::Unit(name) => Ok(self.record(name)?.caller_address()),
            Placeholder::Implementation(name) => Ok(self.record(name)?.address),
            Placeholder::Role(role) => Ok(self.accounts.resolve(role)?.address),
            Placeholder::External(key) => Ok(self.external.lookup(key)),
            Placeholder::RequireExternal(key) => match self.external.try_lookup(key) {
                ExternalLookup::Found(address) => Ok(address),
                ExternalLookup::Unavailable { reason } => {
                    Err(anyhow::Error::new(DeployError::ExternalReferenceUnavailable {
                        key: key.clone(),
                    })
                    .context(reason))
                }
            },
            Placeholder::Read(call) => {
                anyhow::bail!("`{}.{}` is not an address", call.unit, call.method)
            }
        }
    }

    /// Resolve `args` against `params`, which must have the same length.
    pub async fn resolve_values(&self, params: &[Param], args: &[ArgSpec]) -> Result<Vec<DynSolValue>> {
        if params.len() != args.len() {
            anyhow::bail!("Expected {} argument(s), got {}", params.len(), args.len());
        }

        let mut values = Vec::with_capacity(args.len());
        for (i, (param, arg)) in params.iter().zip(args).enumerate() {
            let ty = param
                .resolve()
                .with_context(|| format!("Unsupported parameter type `{}`", param.ty))?;
            let value = self
                .resolve(arg, &ty)
                .await
                .with_context(|| format!("Failed to resolve argument #{} (`{}`)", i, param.name))?;
            values.push(value);
        }

        Ok(values)
    }

    /// Calldata for `method(args)` on a contract with interface `abi`.
    pub async fn encode_call(&self, abi: &JsonAbi, method: &str, args: &[ArgSpec]) -> Result<Bytes> {
        let function = select_function(abi, method, args.len())?;
        let values = self.resolve_values(&function.inputs, args).await?;
        let calldata = function
            .abi_encode_input(&values)
            .with_context(|| format!("Failed to encode call to `{}`", function.signature()))?;
        Ok(calldata.into())
    }

    /// Creation code for `artifact`: its bytecode followed by the encoded constructor arguments.
    pub async fn encode_constructor(&self, artifact: &ContractArtifact, args: &[ArgSpec]) -> Result<Bytes> {
        let encoded = match artifact.abi.constructor() {
            Some(constructor) => {
                let values = self.resolve_values(&constructor.inputs, args).await?;
                constructor
                    .abi_encode_input(&values)
                    .context("Failed to encode constructor arguments")?
            }
            None if args.is_empty() => Vec::new(),
            None => anyhow::bail!(
                "Contract has no constructor but {} argument(s) were given",
                args.len()
            ),
        };

        let mut init_code = artifact.bytecode.to_vec();
        init_code.extend_from_slice(&encoded);
        Ok(init_code.into())
    }

    /// Call `function` read-only at `address` and return its first output.
    pub async fn call_getter(
        &self,
        address: Address,
        function: &Function,
        values: &[DynSolValue],
    ) -> Result<DynSolValue> {
        let calldata = function
            .abi_encode_input(values)
            .with_context(|| format!("Failed to encode call to `{}`", function.signature()))?;
        let output = self.backend.read(address, calldata.into()).await?;

        function
            .abi_decode_output(&output, true)
            .with_context(|| format!("Failed to decode output of `{}`", function.signature()))?
            .into_iter()
            .next()
            .with_context(|| format!("`{}` returns nothing", function.signature()))
    }

    /// Evaluate a `read` placeholder against the unit's caller-facing address.
    pub async fn read(&self, call: &ReadCall) -> Result<DynSolValue> {
        let record = self.record(&call.unit)?;
        let function = select_function(&record.abi, &call.method, call.args.len())?;
        // A full signature selects by name, so the argument count is checked here.
        if function.inputs.len() != call.args.len() {
            anyhow::bail!(
                "`{}.{}` expects {} argument(s), got {}",
                call.unit,
                function.signature(),
                function.inputs.len(),
                call.args.len()
            );
        }

        let mut values = Vec::with_capacity(call.args.len());
        for (param, arg) in function.inputs.iter().zip(&call.args) {
            let ty = param.resolve()?;
            values.push(self.resolve_static(arg, &ty)?);
        }

        let value = self
            .call_getter(record.caller_address(), function, &values)
            .await
            .with_context(|| format!("Failed to read `{}.{}`", call.unit, call.method))?;

        tracing::debug!(unit = %call.unit, method = %call.method, value = ?value, "Read value from unit");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accounts::{RoleAssignment, RoleTable},
        store::MemoryStore,
        testing::FakeChain,
    };
    use alloy_core::primitives::{B256, U256};
    use std::collections::BTreeMap;
    use tempdir::TempDir;

    const VAULT_ROLE: &str = "0x31e0210044b4f6757ce6aa31f9c6e8d4896d24a755014887391a926c5224d959";

    fn vault_abi() -> JsonAbi {
        JsonAbi::parse([
            "function grantRole(bytes32 role, address account)",
            "function hasRole(bytes32 role, address account) view returns (bool)",
            "function VAULT_ROLE() view returns (bytes32)",
            "function setFee(uint256 fee)",
            "function mint(address to)",
            "function mint(address to, uint256 id)",
        ])
        .unwrap()
    }

    fn roles() -> RoleTable {
        BTreeMap::from([(
            "deployer".to_string(),
            BTreeMap::from([("default".to_string(), RoleAssignment::Index(0))]),
        )])
    }

    struct Fixture {
        chain: FakeChain,
        store: MemoryStore,
        accounts: AccountResolver,
        external: ExternalRefLoader,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new("mintwright-args").expect("Failed to create temp dir");
            let chain = FakeChain::new();
            let mut store = MemoryStore::new();
            store
                .put(
                    "NFT2Vault",
                    &DeploymentRecord::new(
                        "NFT2Vault",
                        Address::with_last_byte(0xa1),
                        B256::ZERO,
                        vault_abi(),
                    )
                    .with_proxy(Address::with_last_byte(0xa2)),
                )
                .unwrap();

            Self {
                accounts: AccountResolver::new("localhost", roles(), chain.account_list()),
                external: ExternalRefLoader::new(dir.path()),
                chain,
                store,
                _dir: dir,
            }
        }

        fn resolver(&self) -> ArgResolver<'_, FakeChain, MemoryStore> {
            ArgResolver::new(&self.chain, &self.store, &self.accounts, &self.external)
        }
    }

    #[test]
    fn test_select_function_by_arity_and_signature() {
        let abi = vault_abi();

        assert_eq!(select_function(&abi, "mint", 1).unwrap().inputs.len(), 1);
        assert_eq!(select_function(&abi, "mint", 2).unwrap().inputs.len(), 2);
        assert!(select_function(&abi, "mint", 3).is_err());
        assert!(select_function(&abi, "burn", 0).is_err());

        let by_signature = select_function(&abi, "grantRole(bytes32, address)", 0).unwrap();
        assert_eq!(by_signature.name, "grantRole");
    }

    #[tokio::test]
    async fn test_encode_call_resolves_placeholders() {
        let fixture = Fixture::new();
        let resolver = fixture.resolver();

        let calldata = resolver
            .encode_call(
                &vault_abi(),
                "grantRole",
                &[ArgSpec::text(VAULT_ROLE), ArgSpec::unit("NFT2Vault")],
            )
            .await
            .unwrap();

        let abi = vault_abi();
        let function = select_function(&abi, "grantRole", 2).unwrap();
        let expected = function
            .abi_encode_input(&[
                DynSolValue::FixedBytes(VAULT_ROLE.parse::<B256>().unwrap(), 32),
                DynSolValue::Address(Address::with_last_byte(0xa2)),
            ])
            .unwrap();
        assert_eq!(calldata, Bytes::from(expected));
    }

    #[tokio::test]
    async fn test_literals_are_coerced_to_parameter_types() {
        let fixture = Fixture::new();
        let resolver = fixture.resolver();

        let value = resolver.resolve(&ArgSpec::Int(250), &DynSolType::Uint(256)).await.unwrap();
        assert_eq!(value, DynSolValue::Uint(U256::from(250), 256));

        let value = resolver.resolve(&ArgSpec::Bool(true), &DynSolType::Bool).await.unwrap();
        assert_eq!(value, DynSolValue::Bool(true));

        let err = resolver
            .resolve(&ArgSpec::text("not a number"), &DynSolType::Uint(256))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("uint256"));
    }

    #[tokio::test]
    async fn test_implementation_and_role_placeholders() {
        let fixture = Fixture::new();
        let resolver = fixture.resolver();

        let implementation = resolver
            .resolve(&ArgSpec::implementation("NFT2Vault"), &DynSolType::Address)
            .await
            .unwrap();
        assert_eq!(implementation, DynSolValue::Address(Address::with_last_byte(0xa1)));

        let deployer = resolver
            .resolve(&ArgSpec::role("deployer"), &DynSolType::Address)
            .await
            .unwrap();
        assert_eq!(deployer, DynSolValue::Address(fixture.chain.account_list()[0]));
    }

    #[tokio::test]
    async fn test_missing_record_fails() {
        let fixture = Fixture::new();
        let err = fixture
            .resolver()
            .resolve(&ArgSpec::unit("NFTFactory"), &DynSolType::Address)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NFTFactory"));
    }

    #[tokio::test]
    async fn test_external_degrades_but_require_external_fails() {
        let fixture = Fixture::new();
        let resolver = fixture.resolver();

        let degraded = resolver
            .resolve(&ArgSpec::external(".AMM_ROUTER"), &DynSolType::Address)
            .await
            .unwrap();
        assert_eq!(degraded, DynSolValue::Address(Address::ZERO));

        let err = resolver
            .resolve(&ArgSpec::require_external(".AMM_ROUTER"), &DynSolType::Address)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::ExternalReferenceUnavailable { key }) if key == ".AMM_ROUTER"
        ));
    }

    #[tokio::test]
    async fn test_read_placeholder_decodes_first_output() {
        let fixture = Fixture::new();
        let abi = vault_abi();
        let getter = select_function(&abi, "VAULT_ROLE", 0).unwrap();
        let calldata = getter.abi_encode_input(&[]).unwrap();
        fixture.chain.set_read(
            Address::with_last_byte(0xa2),
            calldata,
            VAULT_ROLE.parse::<B256>().unwrap().to_vec(),
        );

        let value = fixture
            .resolver()
            .resolve(&ArgSpec::read("NFT2Vault", "VAULT_ROLE"), &DynSolType::FixedBytes(32))
            .await
            .unwrap();
        assert_eq!(value, DynSolValue::FixedBytes(VAULT_ROLE.parse().unwrap(), 32));

        let mismatch = fixture
            .resolver()
            .resolve(&ArgSpec::read("NFT2Vault", "VAULT_ROLE"), &DynSolType::Address)
            .await;
        assert!(mismatch.is_err());
    }

    #[tokio::test]
    async fn test_nested_reads_are_rejected() {
        let fixture = Fixture::new();
        let nested = ArgSpec::Placeholder(Placeholder::Read(ReadCall {
            unit: "NFT2Vault".into(),
            method: "hasRole".into(),
            args: vec![ArgSpec::read("NFT2Vault", "VAULT_ROLE"), ArgSpec::unit("NFT2Vault")],
        }));

        let err = fixture
            .resolver()
            .resolve(&nested, &DynSolType::Bool)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Nested read"));
    }

    #[tokio::test]
    async fn test_read_with_extra_arguments_is_rejected() {
        let fixture = Fixture::new();
        let read = ArgSpec::Placeholder(Placeholder::Read(ReadCall {
            unit: "NFT2Vault".into(),
            method: "VAULT_ROLE()".into(),
            args: vec![ArgSpec::unit("NFT2Vault")],
        }));

        let err = fixture
            .resolver()
            .resolve(&read, &DynSolType::FixedBytes(32))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("expects 0 argument(s), got 1"));
    }

    #[tokio::test]
    async fn test_encode_constructor_appends_arguments() {
        let fixture = Fixture::new();
        let artifact = ContractArtifact::new(
            JsonAbi::parse(["constructor(address owner)"]).unwrap(),
            Bytes::from_static(&[0x60, 0x80]),
        );

        let init_code = fixture
            .resolver()
            .encode_constructor(&artifact, &[ArgSpec::unit("NFT2Vault")])
            .await
            .unwrap();
        assert_eq!(init_code.len(), 2 + 32);
        assert_eq!(&init_code[..2], &[0x60, 0x80]);
        assert_eq!(init_code[2 + 31], 0xa2);

        let no_constructor = ContractArtifact::new(JsonAbi::default(), Bytes::from_static(&[0x60]));
        assert!(
            fixture
                .resolver()
                .encode_constructor(&no_constructor, &[ArgSpec::Int(1)])
                .await
                .is_err()
        );
    }
}
