//! Stage 1: Resolving the Build Plan
//!
//! Builds the dependency graph of the configuration and orders it.
//!
//! ## Graph
//!
//! Nodes are, in declaration order, every upstream (a fetch), every layer
//! and every file patch. A layer depends on whatever its `source` names: an
//! upstream, or another layer whose output it builds on. A file patch
//! depends on its upstream.
//!
//! ## Ordering
//!
//! Kahn's algorithm, always taking the ready node that was declared first.
//! The result is a pure function of the configuration, so two runs over the
//! same file produce the same plan. This stage never touches the
//! filesystem; a cycle is reported before any fetch or apply work starts.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use super::{BuildPlan, PlanEntry, PlanStep};
use crate::config::Config;
use crate::error::{Error, Result};

/// Execute Stage 1: compute the build plan for `config`
pub fn execute(config: &Config) -> Result<BuildPlan> {
    let mut steps: Vec<PlanStep> = Vec::new();
    let mut ids: HashMap<&str, usize> = HashMap::new();

    for upstream in &config.upstreams {
        ids.insert(upstream.name.as_str(), steps.len());
        steps.push(PlanStep::Fetch {
            upstream: upstream.name.clone(),
        });
    }
    for layer in &config.layers {
        ids.insert(layer.name.as_str(), steps.len());
        steps.push(PlanStep::Apply {
            layer: layer.name.clone(),
        });
    }
    for (index, file_patch) in config.file_patches.iter().enumerate() {
        steps.push(PlanStep::FilePatch {
            index,
            output: file_patch.output.to_string_lossy().replace('\\', "/"),
        });
    }

    // deps[node] = nodes it consumes
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let layer_base = config.upstreams.len();
    for (offset, layer) in config.layers.iter().enumerate() {
        let source = ids.get(layer.source.as_str()).ok_or_else(|| Error::NotFound {
            what: format!("source of layer '{}'", layer.name),
            path: layer.source.clone(),
        })?;
        deps[layer_base + offset].push(*source);
    }
    let file_base = layer_base + config.layers.len();
    for (offset, file_patch) in config.file_patches.iter().enumerate() {
        let upstream = config
            .upstreams
            .iter()
            .position(|u| u.name == file_patch.upstream)
            .ok_or_else(|| Error::NotFound {
                what: format!("upstream of file patch '{}'", file_patch.path),
                path: file_patch.upstream.clone(),
            })?;
        deps[file_base + offset].push(upstream);
    }

    let order = topological_order(&steps, &deps)?;

    let mut position = vec![0usize; steps.len()];
    for (index, node) in order.iter().enumerate() {
        position[*node] = index;
    }
    let chains = chain_ids(&order, &deps);

    let mut entries: Vec<PlanEntry> = Vec::with_capacity(order.len());
    for (index, node) in order.iter().enumerate() {
        let mut depends_on: Vec<usize> = deps[*node].iter().map(|d| position[*d]).collect();
        depends_on.sort_unstable();
        let level = depends_on
            .iter()
            .map(|d| entries[*d].level + 1)
            .max()
            .unwrap_or(0);
        entries.push(PlanEntry {
            index,
            step: steps[*node].clone(),
            depends_on,
            level,
            chain: chains[*node],
        });
    }

    debug!("Resolved plan with {} entries", entries.len());
    Ok(BuildPlan { entries })
}

/// Kahn's algorithm with declaration order as the tie-break
fn topological_order(steps: &[PlanStep], deps: &[Vec<usize>]) -> Result<Vec<usize>> {
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (node, node_deps) in deps.iter().enumerate() {
        for dep in node_deps {
            dependents[*dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|n| remaining[*n] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for dependent in &dependents[node] {
            remaining[*dependent] -= 1;
            if remaining[*dependent] == 0 {
                ready.insert(*dependent);
            }
        }
    }

    if order.len() < steps.len() {
        let stuck = (0..steps.len())
            .find(|n| remaining[*n] > 0)
            .unwrap_or_default();
        return Err(Error::CyclicDependency {
            cycle: describe_cycle(stuck, steps, deps),
        });
    }
    Ok(order)
}

/// Follow dependencies from `start` until a node repeats
///
/// Every node left over by Kahn's algorithm has an unresolved dependency,
/// so the walk always ends on a cycle.
fn describe_cycle(start: usize, steps: &[PlanStep], deps: &[Vec<usize>]) -> String {
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(next) = deps[current].first().copied() else {
            break;
        };
        if let Some(pos) = path.iter().position(|n| *n == next) {
            let mut cycle: Vec<usize> = path[pos..].to_vec();
            // Report in data-flow order: source first
            cycle.reverse();
            cycle.push(cycle[0]);
            return cycle
                .iter()
                .map(|n| steps[*n].node_name())
                .collect::<Vec<_>>()
                .join(" -> ");
        }
        path.push(next);
        current = next;
    }
    steps[start].node_name()
}

/// Connected components, numbered in order of first appearance in `order`
fn chain_ids(order: &[usize], deps: &[Vec<usize>]) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..deps.len()).collect();
    fn find(parent: &mut [usize], mut node: usize) -> usize {
        while parent[node] != node {
            parent[node] = parent[parent[node]];
            node = parent[node];
        }
        node
    }
    for (node, node_deps) in deps.iter().enumerate() {
        for dep in node_deps {
            let a = find(&mut parent, node);
            let b = find(&mut parent, *dep);
            if a != b {
                parent[a] = b;
            }
        }
    }

    let mut numbering: HashMap<usize, usize> = HashMap::new();
    let mut chains = vec![0usize; deps.len()];
    for node in order {
        let root = find(&mut parent, *node);
        let next = numbering.len();
        chains[*node] = *numbering.entry(root).or_insert(next);
    }
    chains
}
