//! Dependency graph construction and execution ordering.

use std::collections::{BTreeSet, HashMap};

use crate::{
    error::DeployError,
    unit::{Action, Strategy, Unit},
};

/// The units a run targets: explicit unit names and/or tags.
///
/// An empty selection targets every declared unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub units: Vec<String>,
    pub tags: Vec<String>,
}

impl Selection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn units<I, T>(units: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            units: units.into_iter().map(Into::into).collect(),
            tags: Vec::new(),
        }
    }

    pub fn tags<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            units: Vec::new(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.tags.is_empty()
    }
}

/// The declared units with their dependency edges resolved to indices.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    units: Vec<Unit>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Build the graph, rejecting duplicate names and references to undeclared units.
    ///
    /// References must point at units that deploy a contract, and no unit may take the name
    /// under which the shared proxy admin contract is recorded.
    pub fn new(units: Vec<Unit>) -> Result<Self, DeployError> {
        let mut index = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if index.insert(unit.name.clone(), i).is_some() {
                return Err(DeployError::DuplicateUnit(unit.name.clone()));
            }
        }

        let admin_records: BTreeSet<&str> = units
            .iter()
            .filter(|unit| unit.strategy == Strategy::Proxied && unit.proxy.has_admin_contract())
            .map(|unit| unit.proxy.admin_contract.as_str())
            .collect();
        if let Some(name) = admin_records.iter().find(|name| index.contains_key(**name)) {
            return Err(DeployError::ReservedUnitName(name.to_string()));
        }

        let lookup = |name: &str, by: &Unit| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| DeployError::UnknownUnit {
                    name: name.to_string(),
                    referenced_by: Some(by.name.clone()),
                })
        };

        let mut deps = Vec::with_capacity(units.len());
        for unit in &units {
            let edges = unit
                .dependencies
                .iter()
                .map(|dep| lookup(dep, unit))
                .collect::<Result<Vec<_>, _>>()?;

            for reference in references(unit) {
                if units[lookup(reference, unit)?].strategy == Strategy::Configure {
                    return Err(DeployError::NotDeployable {
                        unit: unit.name.clone(),
                        reference: reference.to_string(),
                    });
                }
            }

            deps.push(edges);
        }

        Ok(Self { units, index, deps })
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn get(&self, name: &str) -> Option<&Unit> {
        self.index.get(name).map(|&i| &self.units[i])
    }

    /// Resolve a selection into a total execution order.
    ///
    /// The order contains the selected units and everything they transitively depend on.
    /// Dependencies always come before dependents; ties are broken by declaration order.
    pub fn plan(&self, selection: &Selection) -> Result<ExecutionPlan, DeployError> {
        let roots = self.select(selection)?;
        let in_closure = self.closure(&roots);

        if let Some(cycle) = self.find_cycle(&in_closure) {
            return Err(DeployError::CyclicDependency { cycle });
        }

        let order = self.order(&in_closure);
        self.check_references(&order)?;

        tracing::debug!(
            units = ?order.iter().map(|&i| &self.units[i].name).collect::<Vec<_>>(),
            "Resolved execution order"
        );

        Ok(ExecutionPlan {
            units: order.into_iter().map(|i| self.units[i].clone()).collect(),
        })
    }

    fn select(&self, selection: &Selection) -> Result<Vec<usize>, DeployError> {
        if selection.is_empty() {
            return Ok((0..self.units.len()).collect());
        }

        let mut roots = Vec::new();
        for name in &selection.units {
            let i = self
                .index
                .get(name)
                .copied()
                .ok_or_else(|| DeployError::UnknownUnit {
                    name: name.clone(),
                    referenced_by: None,
                })?;
            roots.push(i);
        }

        for tag in &selection.tags {
            let before = roots.len();
            roots.extend(
                self.units
                    .iter()
                    .enumerate()
                    .filter(|(_, unit)| unit.has_tag(tag))
                    .map(|(i, _)| i),
            );
            if roots.len() == before {
                tracing::warn!(tag = %tag, "No unit carries the selected tag");
            }
        }

        Ok(roots)
    }

    fn closure(&self, roots: &[usize]) -> Vec<bool> {
        let mut in_closure = vec![false; self.units.len()];
        let mut stack = roots.to_vec();

        while let Some(i) = stack.pop() {
            if in_closure[i] {
                continue;
            }
            in_closure[i] = true;
            stack.extend(self.deps[i].iter().copied());
        }

        in_closure
    }

    fn find_cycle(&self, in_closure: &[bool]) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.units.len()];
        let mut path = Vec::new();

        (0..self.units.len())
            .filter(|&i| in_closure[i])
            .find_map(|i| self.visit(i, &mut marks, &mut path))
    }

    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<String>> {
        match marks[node] {
            Mark::Done => return None,
            Mark::Active => {
                let start = path.iter().rposition(|&i| i == node).unwrap_or_default();
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.units[i].name.clone())
                    .collect();
                cycle.push(self.units[node].name.clone());
                return Some(cycle);
            }
            Mark::Unvisited => {}
        }

        marks[node] = Mark::Active;
        path.push(node);

        for &dep in &self.deps[node] {
            if let Some(cycle) = self.visit(dep, marks, path) {
                return Some(cycle);
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Kahn's algorithm over the closure, always releasing the earliest declared ready unit.
    fn order(&self, in_closure: &[bool]) -> Vec<usize> {
        let mut pending = vec![0usize; self.units.len()];
        let mut dependents = vec![Vec::new(); self.units.len()];

        for i in (0..self.units.len()).filter(|&i| in_closure[i]) {
            let mut seen = BTreeSet::new();
            for &dep in &self.deps[i] {
                if seen.insert(dep) {
                    pending[i] += 1;
                    dependents[dep].push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.units.len())
            .filter(|&i| in_closure[i] && pending[i] == 0)
            .collect();
        let mut order = Vec::new();

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &dependent in &dependents[i] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        order
    }

    /// Every unit referenced by a unit's arguments or actions must be deployed before it runs.
    fn check_references(&self, order: &[usize]) -> Result<(), DeployError> {
        let mut ancestors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.units.len()];

        for &i in order {
            let mut reachable = BTreeSet::new();
            for &dep in &self.deps[i] {
                reachable.insert(dep);
                reachable.extend(ancestors[dep].iter().copied());
            }
            ancestors[i] = reachable;

            let unit = &self.units[i];
            let undeclared = |reference: &str, allow_self: bool| {
                let r = self.index[reference];
                !(ancestors[i].contains(&r) || (allow_self && r == i))
            };

            let init_refs = unit.init_args.iter().flat_map(|arg| arg.referenced_units());
            for reference in init_refs {
                if undeclared(reference, false) {
                    return Err(undeclared_dependency(unit, reference));
                }
            }

            let action_refs = unit.post_actions.iter().flat_map(Action::referenced_units);
            for reference in action_refs {
                // Actions run after the unit itself is deployed, so self-references are fine.
                if undeclared(reference, unit.strategy != Strategy::Configure) {
                    return Err(undeclared_dependency(unit, reference));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

fn references(unit: &Unit) -> impl Iterator<Item = &str> {
    unit.init_args
        .iter()
        .flat_map(|arg| arg.referenced_units())
        .chain(unit.post_actions.iter().flat_map(Action::referenced_units))
}

fn undeclared_dependency(unit: &Unit, reference: &str) -> DeployError {
    DeployError::UndeclaredDependency {
        unit: unit.name.clone(),
        reference: reference.to_string(),
    }
}

/// Units in the order a run processes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    units: Vec<Unit>,
}

impl ExecutionPlan {
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(|unit| unit.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Contract artifacts the plan needs, including proxy contracts.
    pub fn contract_names(&self) -> BTreeSet<&str> {
        self.units
            .iter()
            .flat_map(Unit::required_contracts)
            .collect()
    }

    /// Actions resubmitted on every run because they carry no `skip_if_unchanged` check.
    pub fn unchecked_actions(&self) -> impl Iterator<Item = (&Unit, &Action)> {
        self.units.iter().flat_map(|unit| {
            unit.post_actions
                .iter()
                .filter(|action| action.skip_if_unchanged.is_none())
                .map(move |action| (unit, action))
        })
    }
}
