//! Per-host action scheduling
//!
//! Turns desired product states into an ordered, conflict-free list of
//! actions for each host:
//!
//! 1. merge desired states onto the host's current snapshot
//! 2. order by product priority (stable)
//! 3. propagate actions along product dependencies
//! 4. correct the sequence for `before`/`after` requirements
//! 5. apply the action processing filter
//!
//! Resolution is a pure function of its inputs. Callers must not resolve the
//! same host concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::ResolverConfig;
use crate::error::{FleetpkgError, Result};
use crate::package::{
    ActionRequest, DependencyTarget, InstallationStatus, Product, ProductDependency,
    ProductOnClient, Requirement, RequirementType,
};
use crate::storage::Storage;

/// Number of sequence correction passes before giving up
const CORRECTION_PASSES: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct ResolverOptions {
    pub process_priorities: bool,
    pub process_dependencies: bool,
    /// Fall back to a topological sort when correction passes don't converge
    pub force_accurate_sequence: bool,
    /// Only these products keep their actions
    pub action_processing_filter: Option<HashSet<String>>,
}

impl From<&ResolverConfig> for ResolverOptions {
    fn from(config: &ResolverConfig) -> Self {
        Self {
            process_priorities: config.process_priorities,
            process_dependencies: config.process_dependencies,
            force_accurate_sequence: config.force_accurate_sequence,
            action_processing_filter: None,
        }
    }
}

/// Requested state of one product on a host; unset fields are left alone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub product_id: String,
    #[serde(default)]
    pub installation_status: Option<InstallationStatus>,
    #[serde(default)]
    pub action_request: Option<ActionRequest>,
}

/// Products on the depot with their declared dependencies
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    products: Vec<Product>,
    dependencies: Vec<ProductDependency>,
}

impl ProductCatalog {
    pub fn new(products: Vec<Product>, dependencies: Vec<ProductDependency>) -> Self {
        Self {
            products,
            dependencies,
        }
    }

    /// Products installed on a depot, in storage order
    pub fn from_storage(storage: &dyn Storage, depot_id: &str) -> Result<Self> {
        let mut catalog = Self::default();
        for record in storage.get_products_on_depot(depot_id)? {
            let key = record.key();
            match storage.get_product(&key)? {
                Some(product) => {
                    catalog
                        .dependencies
                        .extend(storage.get_product_dependencies(&key)?);
                    catalog.products.push(product);
                }
                None => tracing::warn!("No product definition for {} on {}", key, depot_id),
            }
        }
        Ok(catalog)
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn get(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id == product_id)
    }

    fn priority(&self, product_id: &str) -> i32 {
        self.get(product_id).map(|p| p.priority).unwrap_or(0)
    }

    /// Dependency edges of `product_id` for `action`
    fn dependencies_for<'a>(
        &'a self,
        product_id: &'a str,
        action: ActionRequest,
    ) -> impl Iterator<Item = &'a ProductDependency> + 'a {
        self.dependencies
            .iter()
            .filter(move |d| d.product_id == product_id && d.action == action)
    }

    /// Product ids a dependency edge points at
    fn targets(&self, dependency: &ProductDependency) -> Vec<String> {
        let targets: Vec<String> = match &dependency.target {
            DependencyTarget::Product(id) => self
                .get(id)
                .map(|p| vec![p.id.clone()])
                .unwrap_or_default(),
            DependencyTarget::ProductClass(class) => self
                .products
                .iter()
                .filter(|p| p.product_class_ids.iter().any(|c| c == class))
                .map(|p| p.id.clone())
                .collect(),
        };

        if targets.is_empty() {
            tracing::warn!(
                "Dependency of {} on unknown {:?} skipped",
                dependency.product_id,
                dependency.target
            );
        }
        targets
    }
}

/// Resolve every host in `desired`
pub fn resolve(
    catalog: &ProductCatalog,
    current: &BTreeMap<String, Vec<ProductOnClient>>,
    desired: &BTreeMap<String, Vec<DesiredState>>,
    options: &ResolverOptions,
) -> Result<BTreeMap<String, Vec<ProductOnClient>>> {
    let mut plans = BTreeMap::new();
    for (host_id, states) in desired {
        let snapshot = current.get(host_id).map(Vec::as_slice).unwrap_or(&[]);
        let plan = resolve_host(host_id, catalog, snapshot, states, options)?;
        plans.insert(host_id.clone(), plan);
    }
    Ok(plans)
}

/// Resolve a single host
pub fn resolve_host(
    host_id: &str,
    catalog: &ProductCatalog,
    snapshot: &[ProductOnClient],
    desired: &[DesiredState],
    options: &ResolverOptions,
) -> Result<Vec<ProductOnClient>> {
    tracing::debug!("Resolving {} desired states for {}", desired.len(), host_id);

    let mut sequence = merge(host_id, catalog, snapshot, desired);

    if options.process_priorities {
        // Stable sort keeps declaration order within a priority
        sequence.sort_by_key(|poc| std::cmp::Reverse(catalog.priority(&poc.product_id)));
    }

    if options.process_dependencies {
        propagate_all(catalog, &mut sequence)?;
        correct_sequence(catalog, &mut sequence, options.force_accurate_sequence)?;
    }

    if let Some(allowed) = &options.action_processing_filter {
        for poc in sequence.iter_mut() {
            if !allowed.contains(&poc.product_id) && poc.action_request != ActionRequest::None {
                tracing::debug!("Filtered action {} of {}", poc.action_request, poc.product_id);
                poc.action_request = ActionRequest::None;
            }
        }
    }

    Ok(sequence)
}

/// Snapshot order first, then depot products the snapshot lacks
fn merge(
    host_id: &str,
    catalog: &ProductCatalog,
    snapshot: &[ProductOnClient],
    desired: &[DesiredState],
) -> Vec<ProductOnClient> {
    let mut sequence: Vec<ProductOnClient> = snapshot
        .iter()
        .map(|poc| ProductOnClient {
            host_id: host_id.to_string(),
            ..poc.clone()
        })
        .collect();

    for product in catalog.products() {
        if !sequence.iter().any(|poc| poc.product_id == product.id) {
            sequence.push(ProductOnClient::new(&product.id, host_id));
        }
    }

    for state in desired {
        if catalog.get(&state.product_id).is_none() {
            tracing::warn!(
                "Desired state for {} on {} skipped: product not on depot",
                state.product_id,
                host_id
            );
            continue;
        }
        if let Some(poc) = sequence
            .iter_mut()
            .find(|poc| poc.product_id == state.product_id)
        {
            if let Some(status) = state.installation_status {
                poc.installation_status = status;
            }
            if let Some(action) = state.action_request {
                poc.action_request = action;
            }
        }
    }

    sequence
}

fn propagate_all(catalog: &ProductCatalog, sequence: &mut [ProductOnClient]) -> Result<()> {
    let mut visited = HashSet::new();
    let pending: Vec<(String, ActionRequest)> = sequence
        .iter()
        .filter(|poc| poc.action_request.is_pending())
        .map(|poc| (poc.product_id.clone(), poc.action_request))
        .collect();

    for (product_id, action) in pending {
        propagate(catalog, sequence, &product_id, action, &mut visited)?;
    }
    Ok(())
}

fn propagate(
    catalog: &ProductCatalog,
    sequence: &mut [ProductOnClient],
    product_id: &str,
    action: ActionRequest,
    visited: &mut HashSet<(String, ActionRequest)>,
) -> Result<()> {
    if !visited.insert((product_id.to_string(), action)) {
        return Ok(());
    }

    for dependency in catalog.dependencies_for(product_id, action) {
        for target in catalog.targets(dependency) {
            let Some(entry) = sequence.iter_mut().find(|poc| poc.product_id == target) else {
                continue;
            };

            let required = match dependency.requirement {
                Requirement::Action(required) => required,
                Requirement::Status(status) => {
                    if entry.installation_status == status {
                        continue;
                    }
                    match status {
                        InstallationStatus::Installed => ActionRequest::Setup,
                        InstallationStatus::NotInstalled => ActionRequest::Uninstall,
                        other => {
                            tracing::warn!(
                                "Cannot derive an action for required status {} of {}",
                                other,
                                target
                            );
                            continue;
                        }
                    }
                }
            };

            if !required.is_pending() {
                continue;
            }

            let current = entry.action_request;
            if current.is_pending() && current != required {
                return Err(FleetpkgError::Unaccomplishable(format!(
                    "{} ({}) requires {} ({}), but {} already has action {}",
                    product_id, action, target, required, target, current
                )));
            }

            if current != required {
                tracing::debug!(
                    "Setting {} to {} required by {} ({})",
                    target,
                    required,
                    product_id,
                    action
                );
                entry.action_request = required;
            }

            propagate(catalog, sequence, &target, required, visited)?;
        }
    }

    Ok(())
}

/// Required relative order of two products
#[derive(Debug, Clone, PartialEq, Eq)]
struct Constraint {
    /// The required product
    dependency: String,
    /// The product declaring the requirement
    dependent: String,
    requirement_type: RequirementType,
}

impl Constraint {
    /// (runs first, runs second)
    fn order(&self) -> (&str, &str) {
        match self.requirement_type {
            RequirementType::Before => (&self.dependency, &self.dependent),
            RequirementType::After => (&self.dependent, &self.dependency),
        }
    }
}

fn constraints(catalog: &ProductCatalog, sequence: &[ProductOnClient]) -> Vec<Constraint> {
    let present: HashSet<&str> = sequence.iter().map(|p| p.product_id.as_str()).collect();
    let mut constraints = Vec::new();

    for poc in sequence.iter().filter(|p| p.action_request.is_pending()) {
        for dependency in catalog.dependencies_for(&poc.product_id, poc.action_request) {
            let Some(requirement_type) = dependency.requirement_type else {
                continue;
            };
            for target in catalog.targets(dependency) {
                if target == poc.product_id || !present.contains(target.as_str()) {
                    continue;
                }
                let constraint = Constraint {
                    dependency: target,
                    dependent: poc.product_id.clone(),
                    requirement_type,
                };
                if !constraints.contains(&constraint) {
                    constraints.push(constraint);
                }
            }
        }
    }

    constraints
}

fn correct_sequence(
    catalog: &ProductCatalog,
    sequence: &mut Vec<ProductOnClient>,
    force_accurate_sequence: bool,
) -> Result<()> {
    let constraints = constraints(catalog, sequence);
    if constraints.is_empty() {
        return Ok(());
    }

    apply_constraints(sequence, &constraints, force_accurate_sequence)
}

fn apply_constraints(
    sequence: &mut Vec<ProductOnClient>,
    constraints: &[Constraint],
    force_accurate_sequence: bool,
) -> Result<()> {
    check_cycles(constraints)?;

    for _ in 0..CORRECTION_PASSES {
        for constraint in constraints {
            move_if_violated(sequence, constraint);
        }
    }

    let violated: Vec<&Constraint> = constraints
        .iter()
        .filter(|c| is_violated(sequence, c))
        .collect();
    if violated.is_empty() {
        return Ok(());
    }

    if force_accurate_sequence {
        tracing::info!(
            "Sequence correction left {} violations, sorting topologically",
            violated.len()
        );
        topological_sort(sequence, constraints);
        return Ok(());
    }

    let c = violated[0];
    Err(FleetpkgError::Unaccomplishable(format!(
        "cannot place {} {} {} after {} correction passes",
        c.dependency, c.requirement_type, c.dependent, CORRECTION_PASSES
    )))
}

fn position(sequence: &[ProductOnClient], product_id: &str) -> Option<usize> {
    sequence.iter().position(|p| p.product_id == product_id)
}

fn is_violated(sequence: &[ProductOnClient], constraint: &Constraint) -> bool {
    let (first, second) = constraint.order();
    match (position(sequence, first), position(sequence, second)) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

/// Move the dependency directly before/after the dependent
fn move_if_violated(sequence: &mut Vec<ProductOnClient>, constraint: &Constraint) {
    if !is_violated(sequence, constraint) {
        return;
    }
    let (Some(dep_pos), Some(_)) = (
        position(sequence, &constraint.dependency),
        position(sequence, &constraint.dependent),
    ) else {
        return;
    };

    let moved = sequence.remove(dep_pos);
    let Some(dependent_pos) = position(sequence, &constraint.dependent) else {
        sequence.insert(dep_pos, moved);
        return;
    };
    let insert_at = match constraint.requirement_type {
        RequirementType::Before => dependent_pos,
        RequirementType::After => dependent_pos + 1,
    };

    tracing::debug!(
        "Moving {} {} {}",
        constraint.dependency,
        constraint.requirement_type,
        constraint.dependent
    );
    sequence.insert(insert_at, moved);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Reject cyclic before/after requirements, naming the chain
fn check_cycles(constraints: &[Constraint]) -> Result<()> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut nodes: Vec<&str> = Vec::new();
    for constraint in constraints {
        let (first, second) = constraint.order();
        edges.entry(first).or_default().push(second);
        for node in [first, second] {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = nodes.iter().map(|n| (*n, Mark::White)).collect();
    let mut path = Vec::new();

    for node in &nodes {
        if marks[node] == Mark::White {
            visit(node, &edges, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    marks.insert(node, Mark::Gray);
    path.push(node);

    for &next in edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
        match marks.get(next).copied().unwrap_or(Mark::White) {
            Mark::Gray => {
                let start = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut chain: Vec<&str> = path[start..].to_vec();
                chain.push(next);
                return Err(FleetpkgError::Unaccomplishable(format!(
                    "circular sequence requirement: {}",
                    chain.join(" -> ")
                )));
            }
            Mark::White => visit(next, edges, marks, path)?,
            Mark::Black => {}
        }
    }

    path.pop();
    marks.insert(node, Mark::Black);
    Ok(())
}

/// Kahn's algorithm, always taking the earliest ready product
fn topological_sort(sequence: &mut Vec<ProductOnClient>, constraints: &[Constraint]) {
    let mut remaining: Vec<ProductOnClient> = std::mem::take(sequence);
    let mut indegree: HashMap<String, usize> = HashMap::new();
    for constraint in constraints {
        let (_, second) = constraint.order();
        *indegree.entry(second.to_string()).or_default() += 1;
    }

    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .position(|p| indegree.get(&p.product_id).copied().unwrap_or(0) == 0)
            .unwrap_or(0);
        let poc = remaining.remove(next);

        for constraint in constraints {
            let (first, second) = constraint.order();
            if first == poc.product_id {
                if let Some(count) = indegree.get_mut(second) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        sequence.push(poc);
    }
}
