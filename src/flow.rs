//! The propellant flow graph builder. For one engine and one mixture
//! component it produces the ordered list of candidate supplier parts,
//! ranked by flow priority: stack-reachable crossfeed parts nearest
//! first, then parts reachable only over explicit fuel lines, in
//! declaration order. Edges are derived, never stored on parts, and
//! rebuilt per drain step because consumption changes which suppliers
//! are still non-empty.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::vessel::{Attachment, PartId, ResourceId, SimVessel};

/// A directed supply relation: `supplier` can feed `resource` to the
/// requesting engine. Lower rank drains first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlowEdge {
    pub supplier: PartId,
    pub resource: ResourceId,
    pub rank: i32,
}

/// Tie-break between stack adjacency and explicit fuel lines when both
/// are eligible. The original rule is not observable from the host
/// interfaces, so it is configurable; stack-first is the default.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum FlowPolicy {
    #[default]
    StackFirst,
    FuelLinesFirst,
}

/// Resolves the ranked suppliers of `resource` for the engine mounted
/// on `engine_part`, against the current (possibly partially drained)
/// resource state. Only non-empty pools are returned.
pub fn resolve_suppliers(
    vessel: &SimVessel,
    engine_part: PartId,
    resource: ResourceId,
    policy: FlowPolicy,
) -> Vec<FlowEdge> {
    if !vessel.parts.contains(engine_part) {
        return Vec::new();
    }

    let mut visited = HashSet::new();
    let stack = stack_reach(vessel, engine_part, &mut visited);
    let line_groups = fuel_line_groups(vessel, &mut visited);

    let mut edges = Vec::new();
    match policy {
        FlowPolicy::StackFirst => {
            let mut base = collect_group(vessel, &stack, resource, 0, &mut edges);
            for group in &line_groups {
                base = collect_group(vessel, group, resource, base, &mut edges);
            }
        }
        FlowPolicy::FuelLinesFirst => {
            let mut base = 0;
            for group in &line_groups {
                base = collect_group(vessel, group, resource, base, &mut edges);
            }
            collect_group(vessel, &stack, resource, base, &mut edges);
        }
    }

    edges.sort_by_key(|e| e.rank);
    edges
}

/// Breadth-first walk over stack joints from `start`, nearest first.
/// The visited set is the cycle guard: malformed connectivity ends the
/// walk with the parts found so far instead of looping.
fn stack_reach(
    vessel: &SimVessel,
    start: PartId,
    visited: &mut HashSet<PartId>,
) -> Vec<(PartId, i32)> {
    let mut reach = Vec::new();
    let mut queue = VecDeque::new();

    visited.insert(start);
    queue.push_back((start, 0));

    // Every part enters the queue at most once; anything past this
    // bound means the connectivity arrays are inconsistent.
    let budget = vessel.parts.len() + 1;
    let mut processed = 0;

    while let Some((id, depth)) = queue.pop_front() {
        processed += 1;
        if processed > budget {
            warn!("flow traversal exceeded {budget} parts, assuming a cycle");
            break;
        }

        reach.push((id, depth));

        let part = &vessel.parts[id];
        let neighbors = part.parent.iter().copied().chain(part.children.iter().copied());
        for neighbor in neighbors {
            if visited.contains(&neighbor) || !vessel.parts.contains(neighbor) {
                continue;
            }

            if !joint_passes_fuel(vessel, id, neighbor) {
                continue;
            }

            let next = &vessel.parts[neighbor];
            if !next.crossfeed || next.blocks_crossfeed {
                continue;
            }

            visited.insert(neighbor);
            queue.push_back((neighbor, depth + 1));
        }
    }

    reach
}

/// A stack joint always passes fuel; a surface joint passes it only
/// when the surface-mounted side has crossfeed enabled.
fn joint_passes_fuel(vessel: &SimVessel, a: PartId, b: PartId) -> bool {
    // The child end of the joint is the one carrying the attachment
    // kind; `b` is the child when its parent is `a`, and vice versa.
    let child = if vessel.parts[b].parent == Some(a) {
        b
    } else {
        a
    };
    match vessel.parts[child].attachment {
        Attachment::Stack => true,
        Attachment::Surface => vessel.parts[child].crossfeed,
    }
}

/// Finds parts reachable only via explicit fuel-line crossfeed, one
/// group per line source, in declaration order. Chained lines resolve
/// by iterating until no new source connects.
fn fuel_line_groups(vessel: &SimVessel, visited: &mut HashSet<PartId>) -> Vec<Vec<(PartId, i32)>> {
    let mut groups = Vec::new();

    for _ in 0..vessel.parts.len() {
        let mut added = false;

        for (id, part) in vessel.parts.iter() {
            if visited.contains(&id) || !part.crossfeed || part.blocks_crossfeed {
                continue;
            }

            if part.fuel_lines_to.iter().any(|t| visited.contains(t)) {
                groups.push(stack_reach(vessel, id, visited));
                added = true;
            }
        }

        if !added {
            break;
        }
    }

    groups
}

/// Emits edges for one reach group starting at `base` rank; returns
/// the base for the next group. Host-side resource priority biases the
/// rank within (or, for large offsets, across) a group.
fn collect_group(
    vessel: &SimVessel,
    reach: &[(PartId, i32)],
    resource: ResourceId,
    base: i32,
    edges: &mut Vec<FlowEdge>,
) -> i32 {
    let mut max_depth = -1;

    for &(id, depth) in reach {
        max_depth = max_depth.max(depth);
        if vessel.parts[id].has_resource(resource) {
            edges.push(FlowEdge {
                supplier: id,
                resource,
                rank: base + depth - vessel.parts[id].resource_priority,
            });
        }
    }

    base + max_depth + 1
}
