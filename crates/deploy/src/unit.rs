//! Declarative unit definitions.
//!
//! A [`Unit`] is pure data: what to deploy, with which arguments, after which other units,
//! and which configuration calls to run once it is live. Units are usually read from the
//! `[[units]]` tables of the manifest, but can be built in code for tests.

use serde::{Deserialize, Serialize};

/// The role used to sign deployments and actions when none is given.
pub const DEFAULT_SIGNER_ROLE: &str = "deployer";

/// Default proxy contract artifact.
pub const DEFAULT_PROXY_CONTRACT: &str = "TransparentUpgradeableProxy";
/// Default admin contract artifact of transparent proxies.
pub const DEFAULT_PROXY_ADMIN_CONTRACT: &str = "ProxyAdmin";
/// Default initializer invoked through a freshly deployed proxy.
pub const DEFAULT_INITIALIZER: &str = "initialize";

/// How a unit is deployed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Strategy {
    /// Deploy the contract directly.
    #[default]
    Plain,
    /// Deploy the contract as the implementation behind a proxy.
    Proxied,
    /// Deploy nothing; only run the unit's actions.
    Configure,
}

/// How a proxy is administered and upgraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProxyKind {
    /// Transparent proxy administered by one shared admin contract per network.
    ///
    /// The admin contract is deployed on first use, owned by the unit's admin role, and passed
    /// as the proxy's admin. Upgrades go through `admin.upgradeAndCall(proxy, implementation, "")`.
    #[default]
    Transparent,
    /// Transparent proxy whose constructor creates its own admin contract, owned by the admin
    /// role. The admin contract is read from the ERC-1967 admin slot after deployment.
    TransparentV5,
    /// Proxy owned by an account, upgraded by calling `upgradeTo(implementation)` on the proxy.
    Owned,
}

/// Proxy settings for [`Strategy::Proxied`] units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    pub kind: ProxyKind,
    /// Artifact name of the proxy contract.
    ///
    /// Its constructor receives `(implementation)`, `(implementation, admin)` or
    /// `(implementation, admin, data)` depending on its arity. With the three-argument form
    /// `data` carries the initializer calldata, so initialization happens during construction.
    pub contract: String,
    /// Artifact of the admin contract of transparent proxies.
    pub admin_contract: String,
    /// Initializer method, called through the proxy exactly once after construction.
    pub initializer: String,
    /// Upgrade method. Called on the admin contract for transparent proxies and on the proxy
    /// itself for owned ones. Defaults to `upgradeAndCall` and `upgradeTo` respectively.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_method: Option<String>,
    /// Role owning the proxy, or its admin contract. Defaults to the unit's deployer role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<String>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            kind: ProxyKind::default(),
            contract: DEFAULT_PROXY_CONTRACT.to_string(),
            admin_contract: DEFAULT_PROXY_ADMIN_CONTRACT.to_string(),
            initializer: DEFAULT_INITIALIZER.to_string(),
            upgrade_method: None,
            admin: None,
        }
    }
}

impl ProxyOptions {
    pub fn upgrade_method(&self) -> &str {
        match (&self.upgrade_method, self.kind) {
            (Some(method), _) => method.as_str(),
            (None, ProxyKind::Owned) => "upgradeTo",
            (None, _) => "upgradeAndCall",
        }
    }

    /// Whether the proxy is administered by a contract rather than an account.
    pub fn has_admin_contract(&self) -> bool {
        self.kind != ProxyKind::Owned
    }
}

/// A value resolved at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placeholder {
    /// Caller-facing address of a unit (the proxy address for proxied units).
    Unit(String),
    /// Implementation address of a unit.
    Implementation(String),
    /// Address of the signer a role resolves to.
    Role(String),
    /// Externally recorded address, degrading to the zero address when unavailable.
    External(String),
    /// Externally recorded address that must be present.
    RequireExternal(String),
    /// Result of a read-only call on a deployed unit.
    Read(ReadCall),
}

/// A read-only call whose first return value is used as an argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCall {
    pub unit: String,
    pub method: String,
    /// Arguments of the read. Nested reads are not supported.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgSpec>,
}

/// An argument as declared: a literal coerced to the ABI parameter type, or a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    Bool(bool),
    Int(i64),
    Text(String),
    Placeholder(Placeholder),
}

impl ArgSpec {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn unit(name: impl Into<String>) -> Self {
        Self::Placeholder(Placeholder::Unit(name.into()))
    }

    pub fn implementation(name: impl Into<String>) -> Self {
        Self::Placeholder(Placeholder::Implementation(name.into()))
    }

    pub fn role(name: impl Into<String>) -> Self {
        Self::Placeholder(Placeholder::Role(name.into()))
    }

    pub fn external(key: impl Into<String>) -> Self {
        Self::Placeholder(Placeholder::External(key.into()))
    }

    pub fn require_external(key: impl Into<String>) -> Self {
        Self::Placeholder(Placeholder::RequireExternal(key.into()))
    }

    pub fn read(unit: impl Into<String>, method: impl Into<String>) -> Self {
        Self::Placeholder(Placeholder::Read(ReadCall {
            unit: unit.into(),
            method: method.into(),
            args: Vec::new(),
        }))
    }

    /// Units this argument needs to be deployed before it can be resolved.
    pub fn referenced_units(&self) -> Vec<&str> {
        match self {
            Self::Placeholder(Placeholder::Unit(name))
            | Self::Placeholder(Placeholder::Implementation(name)) => vec![name],
            Self::Placeholder(Placeholder::Read(read)) => std::iter::once(read.unit.as_str())
                .chain(read.args.iter().flat_map(ArgSpec::referenced_units))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Read-only pre-check that lets an action be skipped when the chain already holds the
/// desired post-state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCheck {
    /// Getter called on the action's target.
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgSpec>,
    /// Value the getter returns once the action has taken effect.
    pub expect: ArgSpec,
}

/// A post-deploy configuration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Unit whose caller-facing address receives the call.
    pub target: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgSpec>,
    #[serde(default = "default_signer")]
    pub signer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_unchanged: Option<SkipCheck>,
}

impl Action {
    pub fn call(target: impl Into<String>, method: impl Into<String>, args: Vec<ArgSpec>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            args,
            signer: default_signer(),
            skip_if_unchanged: None,
        }
    }

    pub fn signed_by(mut self, role: impl Into<String>) -> Self {
        self.signer = role.into();
        self
    }

    pub fn skip_if(mut self, method: impl Into<String>, args: Vec<ArgSpec>, expect: ArgSpec) -> Self {
        self.skip_if_unchanged = Some(SkipCheck {
            method: method.into(),
            args,
            expect,
        });
        self
    }

    /// Units this action needs to be deployed before it runs.
    pub fn referenced_units(&self) -> Vec<&str> {
        let check = self.skip_if_unchanged.iter().flat_map(|check| {
            check
                .args
                .iter()
                .chain(std::iter::once(&check.expect))
                .flat_map(ArgSpec::referenced_units)
        });

        std::iter::once(self.target.as_str())
            .chain(self.args.iter().flat_map(ArgSpec::referenced_units))
            .chain(check)
            .collect()
    }
}

fn default_signer() -> String {
    DEFAULT_SIGNER_ROLE.to_string()
}

/// A named deployable (or configuration-only) component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    /// Contract artifact to deploy. Defaults to the unit name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub proxy: ProxyOptions,
    /// Role signing the deployment.
    #[serde(default = "default_signer")]
    pub deployer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_args: Vec<ArgSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_actions: Vec<Action>,
}

impl Unit {
    fn with_strategy(name: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            name: name.into(),
            contract: None,
            tags: Vec::new(),
            dependencies: Vec::new(),
            strategy,
            proxy: ProxyOptions::default(),
            deployer: default_signer(),
            init_args: Vec::new(),
            post_actions: Vec::new(),
        }
    }

    pub fn plain(name: impl Into<String>) -> Self {
        Self::with_strategy(name, Strategy::Plain)
    }

    pub fn proxied(name: impl Into<String>) -> Self {
        Self::with_strategy(name, Strategy::Proxied)
    }

    pub fn configure(name: impl Into<String>) -> Self {
        Self::with_strategy(name, Strategy::Configure)
    }

    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn init_args(mut self, args: Vec<ArgSpec>) -> Self {
        self.init_args = args;
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.post_actions.push(action);
        self
    }

    /// The contract artifact this unit deploys.
    pub fn contract_name(&self) -> &str {
        self.contract.as_deref().unwrap_or(&self.name)
    }

    /// Role owning the proxy, or the admin contract, of a proxied unit.
    pub fn proxy_admin(&self) -> &str {
        self.proxy.admin.as_deref().unwrap_or(&self.deployer)
    }

    /// Contract artifacts needed to process this unit.
    pub fn required_contracts(&self) -> Vec<&str> {
        match self.strategy {
            Strategy::Plain => vec![self.contract_name()],
            Strategy::Proxied if self.proxy.has_admin_contract() => vec![
                self.contract_name(),
                self.proxy.contract.as_str(),
                self.proxy.admin_contract.as_str(),
            ],
            Strategy::Proxied => vec![self.contract_name(), self.proxy.contract.as_str()],
            Strategy::Configure => Vec::new(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_defaults_from_toml() {
        let unit: Unit = toml::from_str(
            r#"
            name = "NFT2"
            tags = ["NFT2"]
            "#,
        )
        .unwrap();

        assert_eq!(unit.strategy, Strategy::Plain);
        assert_eq!(unit.contract_name(), "NFT2");
        assert_eq!(unit.deployer, DEFAULT_SIGNER_ROLE);
        assert_eq!(unit.proxy, ProxyOptions::default());
        assert!(unit.post_actions.is_empty());
    }

    #[test]
    fn test_placeholders_from_toml() {
        let unit: Unit = toml::from_str(
            r#"
            name = "FeeController"
            strategy = "proxied"
            dependencies = ["NFTFactory"]
            init_args = [
                { external = ".AMM_ROUTER" },
                { require_external = ".DARENFT_TOKEN" },
                { role = "deployer" },
                42,
                true,
            ]

            [proxy]
            admin = "proxy_admin"

            [[post_actions]]
            target = "NFTFactory"
            method = "setFeeController"
            args = [{ unit = "FeeController" }]
            "#,
        )
        .unwrap();

        assert_eq!(unit.strategy, Strategy::Proxied);
        assert_eq!(unit.proxy_admin(), "proxy_admin");
        assert_eq!(unit.proxy.initializer, DEFAULT_INITIALIZER);
        assert_eq!(
            unit.init_args,
            vec![
                ArgSpec::external(".AMM_ROUTER"),
                ArgSpec::require_external(".DARENFT_TOKEN"),
                ArgSpec::role("deployer"),
                ArgSpec::Int(42),
                ArgSpec::Bool(true),
            ]
        );
        assert_eq!(unit.post_actions[0].signer, DEFAULT_SIGNER_ROLE);
        assert_eq!(unit.post_actions[0].args, vec![ArgSpec::unit("FeeController")]);
    }

    #[test]
    fn test_action_with_read_and_skip_check() {
        let action: Action = toml::from_str(
            r#"
            target = "TokenTransferProxy"
            method = "grantRole"
            args = [
                { read = { unit = "TokenTransferProxy", method = "TRANSFERABLE_ROLE" } },
                { unit = "NFT2Vault" },
            ]

            [skip_if_unchanged]
            method = "hasRole"
            args = [
                { read = { unit = "TokenTransferProxy", method = "TRANSFERABLE_ROLE" } },
                { unit = "NFT2Vault" },
            ]
            expect = true
            "#,
        )
        .unwrap();

        let check = action.skip_if_unchanged.as_ref().unwrap();
        assert_eq!(check.expect, ArgSpec::Bool(true));
        assert_eq!(
            action.referenced_units(),
            vec![
                "TokenTransferProxy",
                "TokenTransferProxy",
                "NFT2Vault",
                "TokenTransferProxy",
                "NFT2Vault"
            ]
        );
    }

    #[test]
    fn test_proxy_kinds() {
        let transparent = Unit::proxied("NFT2Vault");
        assert_eq!(transparent.proxy.kind, ProxyKind::Transparent);
        assert_eq!(transparent.proxy.upgrade_method(), "upgradeAndCall");
        assert_eq!(
            transparent.required_contracts(),
            vec!["NFT2Vault", DEFAULT_PROXY_CONTRACT, DEFAULT_PROXY_ADMIN_CONTRACT]
        );

        let owned: Unit = toml::from_str(
            r#"
            name = "TokenTransferProxy"
            strategy = "proxied"

            [proxy]
            kind = "owned"
            contract = "EIP173Proxy"
            "#,
        )
        .unwrap();
        assert_eq!(owned.proxy.upgrade_method(), "upgradeTo");
        assert_eq!(owned.required_contracts(), vec!["TokenTransferProxy", "EIP173Proxy"]);

        let v5: ProxyOptions = toml::from_str(
            r#"
            kind = "transparent_v5"
            upgrade_method = "upgradeAndCall(address,address,bytes)"
            "#,
        )
        .unwrap();
        assert!(v5.has_admin_contract());
        assert_eq!(v5.upgrade_method(), "upgradeAndCall(address,address,bytes)");
    }

    #[test]
    fn test_hex_literal_stays_text() {
        let args: Vec<ArgSpec> = toml::from_str::<toml::Table>(
            r#"args = ["0x31e0210044b4f6757ce6aa31f9c6e8d4896d24a755014887391a926c5224d959"]"#,
        )
        .unwrap()["args"]
            .clone()
            .try_into()
            .unwrap();

        assert!(matches!(&args[0], ArgSpec::Text(s) if s.starts_with("0x31e0")));
    }
}
