//! The stage resolver: partitions the snapshot into ordered stages by
//! staging index, highest (earliest-firing) first, and works out when
//! each part separates from the vehicle.

use itertools::Itertools;
use tracing::warn;

use crate::vessel::{PartId, SimVessel, NEVER_DECOUPLED};

/// One stage of the burn sequence: its number, the parts still
/// attached while it burns, and the engines firing during it.
#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    /// Separation order. The highest number fires first; simulation
    /// walks from the highest down to zero.
    pub number: i32,
    pub parts: Vec<PartId>,
    /// Indices into `SimVessel::engines`.
    pub engines: Vec<usize>,
}

/// Partitions `vessel` into stages, highest number first. Writes
/// `decoupled_in_stage` on every part as a side effect.
///
/// Stages with no engines are retained with empty engine sets so that
/// consumers always see a 1:1 mapping between stage numbers and
/// results.
pub fn resolve_stages(vessel: &mut SimVessel) -> Vec<Stage> {
    let Some(root) = vessel.root() else {
        return Vec::new();
    };

    analyze_decoupling(vessel, root);

    let top = vessel
        .parts
        .iter()
        .map(|(_, p)| p.stage)
        .max()
        .unwrap_or(0)
        .max(0);

    (0..=top)
        .rev()
        .map(|number| Stage {
            number,
            parts: vessel
                .parts
                .iter()
                .filter(|(_, p)| p.decoupled_in_stage < number)
                .map(|(id, _)| id)
                .collect(),
            engines: vessel
                .engines
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    let part = &vessel.parts[e.part];
                    // Ignited already, and still attached.
                    part.stage >= number && part.decoupled_in_stage < number
                })
                .map(|(i, _)| i)
                .collect(),
        })
        .collect()
}

/// Walks the part tree from the root, assigning the stage in which
/// each part separates. A decoupler detaches itself and its whole
/// subtree when its own stage fires; nested decouplers inherit the
/// earliest-firing (highest-numbered) applicable one.
fn analyze_decoupling(vessel: &mut SimVessel, root: PartId) {
    for (_, part) in vessel.parts.iter_mut() {
        part.decoupled_in_stage = NEVER_DECOUPLED;
    }

    let mut stack = vec![(root, NEVER_DECOUPLED)];
    let mut seen = vec![false; vessel.parts.len()];

    while let Some((id, inherited)) = stack.pop() {
        if std::mem::replace(&mut seen[id.0 as usize], true) {
            // Tree input should never revisit; bail rather than loop.
            warn!("part {id:?} reached twice during decoupling analysis");
            continue;
        }

        let part = &mut vessel.parts[id];
        let own = if part.decoupler {
            inherited.max(part.stage)
        } else {
            inherited
        };
        part.decoupled_in_stage = own;

        for child in vessel.parts[id].children.clone() {
            stack.push((child, own));
        }
    }

    let orphans = vessel
        .parts
        .iter()
        .filter(|(id, _)| !seen[id.0 as usize])
        .map(|(id, _)| id)
        .collect_vec();
    if !orphans.is_empty() {
        warn!(
            "{} part(s) unreachable from the root, treating as never decoupled",
            orphans.len()
        );
    }
}
