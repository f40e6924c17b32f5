//! mintwright deploys, upgrades and wires together interdependent contracts from a manifest.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::Table;

use cli::{Cli, Command};
use mintwright_deploy::{
    AccountResolver, ArtifactRegistry, ArtifactStore, ExecutionPlan, JsonRpcBackend, Manifest,
    RunReport, Scheduler, Selection, Strategy,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let manifest = Manifest::load(&cli.config)?.with_overrides(cli.network, cli.rpc_url)?;

    match cli.command {
        Command::Deploy(selection) => deploy(&manifest, &selection.into()).await,
        Command::Plan(selection) => plan(&manifest, &selection.into()),
        Command::Status => status(&manifest),
        Command::Forget { unit } => forget(&manifest, &unit),
    }
}

async fn deploy(manifest: &Manifest, selection: &Selection) -> Result<()> {
    // Graph errors and missing artifacts surface before connecting to the network.
    let plan = manifest.graph()?.plan(selection)?;
    if plan.is_empty() {
        tracing::warn!("Selection matches no unit, nothing to deploy");
        return Ok(());
    }
    let artifacts = ArtifactRegistry::load(&manifest.artifacts_dir, plan.contract_names())?;

    let backend = JsonRpcBackend::new(&manifest.rpc_url)?;
    let chain_id = backend
        .chain_id()
        .await
        .with_context(|| format!("Failed to reach {}", manifest.rpc_url))?;
    tracing::info!(
        network = %manifest.network,
        chain_id,
        rpc_url = %manifest.rpc_url,
        "Connected to network"
    );

    let accounts =
        AccountResolver::connect(&manifest.network, manifest.roles.clone(), &backend).await?;
    let external = manifest.external_loader();
    let mut store = manifest.open_store()?;

    let report = Scheduler::new(&backend, &mut store, &artifacts, &accounts, &external)
        .execute(&plan)
        .await?;

    print_report(&report);
    Ok(())
}

fn plan(manifest: &Manifest, selection: &Selection) -> Result<()> {
    let plan = manifest.graph()?.plan(selection)?;
    print_plan(&plan);
    Ok(())
}

fn status(manifest: &Manifest) -> Result<()> {
    let store = manifest.open_store()?;

    let mut table = Table::new();
    table.set_header(vec!["Unit", "Contract", "Address", "Implementation", "Deployed at"]);

    for unit in &manifest.units {
        if unit.strategy == Strategy::Configure {
            continue;
        }

        match store.get(&unit.name)? {
            Some(record) => {
                let implementation = match record.proxy_address {
                    Some(_) => record.address.to_string(),
                    None => "-".to_string(),
                };
                let deployed_at = chrono::DateTime::from_timestamp(record.deployed_at, 0)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| record.deployed_at.to_string());

                table.add_row(vec![
                    unit.name.clone(),
                    record.contract.clone(),
                    record.caller_address().to_string(),
                    implementation,
                    deployed_at,
                ]);
            }
            None => {
                table.add_row(vec![
                    unit.name.clone(),
                    unit.contract_name().to_string(),
                    "not deployed".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                ]);
            }
        }
    }

    // Shared proxy admins, and records of units no longer declared in the manifest.
    for (name, record) in store.list()? {
        if manifest.units.iter().all(|unit| unit.name != name) {
            let label = match record.owner {
                Some(_) => "proxy admin",
                None => "undeclared",
            };
            table.add_row(vec![
                name,
                format!("{} ({})", record.contract, label),
                record.caller_address().to_string(),
                "-".to_string(),
                "-".to_string(),
            ]);
        }
    }

    println!("Network: {}", manifest.network);
    println!("{table}");
    Ok(())
}

fn forget(manifest: &Manifest, unit: &str) -> Result<()> {
    if manifest.units.iter().all(|declared| declared.name != unit) {
        tracing::warn!(unit = %unit, "Unit is not declared in the manifest");
    }

    let mut store = manifest.open_store()?;
    if store.remove(unit)? {
        tracing::info!(unit = %unit, network = %manifest.network, "Deployment record removed");
    } else {
        tracing::warn!(unit = %unit, network = %manifest.network, "No deployment record to remove");
    }
    Ok(())
}

fn print_plan(plan: &ExecutionPlan) {
    let mut table = Table::new();
    table.set_header(vec!["#", "Unit", "Strategy", "Contract", "Dependencies", "Actions"]);

    for (i, unit) in plan.units().iter().enumerate() {
        let contract = match unit.strategy {
            Strategy::Configure => "-".to_string(),
            Strategy::Plain => unit.contract_name().to_string(),
            Strategy::Proxied => format!("{} via {}", unit.contract_name(), unit.proxy.contract),
        };
        let unchecked = unit
            .post_actions
            .iter()
            .filter(|action| action.skip_if_unchanged.is_none())
            .count();

        table.add_row(vec![
            (i + 1).to_string(),
            unit.name.clone(),
            unit.strategy.to_string(),
            contract,
            unit.dependencies.join(", "),
            format!("{} ({} unchecked)", unit.post_actions.len(), unchecked),
        ]);
    }

    println!("{table}");
}

fn print_report(report: &RunReport) {
    let mut table = Table::new();
    table.set_header(vec!["Unit", "Outcome", "Actions submitted", "Actions skipped"]);

    for unit in &report.units {
        table.add_row(vec![
            unit.name.clone(),
            unit.outcome.to_string(),
            unit.actions.submitted.to_string(),
            unit.actions.skipped.to_string(),
        ]);
    }

    println!("{table}");
    println!("{report}");
}
