//! Stage 2: Materializing Upstreams
//!
//! Every fetch entry of the plan is handed to the [`Materializer`]. Fetches
//! belong to different chains (two layers built on the same upstream share
//! its single fetch entry), so they are all independent and run in parallel
//! on the rayon pool. Each fetch gets its own deadline.
//!
//! A failure in one fetch does not cancel the others; once all have
//! finished, the first error in plan order is returned.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info};
use rayon::prelude::*;

use super::{BuildPlan, PlanStep};
use crate::config::Config;
use crate::control::{CancelToken, Deadline};
use crate::error::{Error, Result};
use crate::repository::{Materialized, Materializer};

/// Execute Stage 2: materialize every upstream the plan fetches
///
/// Returns the snapshots keyed by upstream name.
pub fn execute(
    plan: &BuildPlan,
    config: &Config,
    materializer: &Materializer,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<HashMap<String, Materialized>> {
    let fetches: Vec<(usize, &str)> = plan
        .entries
        .iter()
        .filter_map(|e| match &e.step {
            PlanStep::Fetch { upstream } => Some((e.index, upstream.as_str())),
            _ => None,
        })
        .collect();

    if fetches.is_empty() {
        debug!("No upstreams to materialize");
        return Ok(HashMap::new());
    }
    info!("Materializing {} upstream(s)", fetches.len());

    let errors: Mutex<Vec<(usize, Error)>> = Mutex::new(Vec::new());
    let trees: Mutex<HashMap<String, Materialized>> = Mutex::new(HashMap::new());

    fetches.par_iter().for_each(|(index, name)| {
        let result = cancel.check("materialize").and_then(|_| {
            let project = config.upstream(name).ok_or_else(|| Error::NotFound {
                what: "upstream".to_string(),
                path: name.to_string(),
            })?;
            materializer.materialize(project, Deadline::after(timeout))
        });
        match result {
            Ok(materialized) => {
                debug!(
                    "{} at {} ({})",
                    name,
                    materialized.resolved,
                    if materialized.cache_hit { "cached" } else { "fetched" }
                );
                if let Ok(mut trees) = trees.lock() {
                    trees.insert(name.to_string(), materialized);
                }
            }
            Err(e) => {
                if let Ok(mut errors) = errors.lock() {
                    errors.push((*index, e));
                }
            }
        }
    });

    let mut errors = errors.into_inner().map_err(|_| Error::LockPoisoned {
        context: "materialize stage errors".to_string(),
    })?;
    if !errors.is_empty() {
        errors.sort_by_key(|(index, _)| *index);
        let (_, first) = errors.remove(0);
        return Err(first);
    }

    trees.into_inner().map_err(|_| Error::LockPoisoned {
        context: "materialize stage results".to_string(),
    })
}
