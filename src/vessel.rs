//! The vehicle snapshot: an immutable capture of the part tree and
//! resource state at the instant a simulation run begins. A run clones
//! the snapshot and drains the clone; the live vehicle is never touched.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    arena::{Arena, IdLike},
    engine::Engine,
};

/// Amounts at or below this are treated as an empty pool.
pub const DRAIN_EPSILON: f64 = 1e-10;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct PartId(pub u32);

impl IdLike for PartId {
    fn from_raw(index: usize) -> Self {
        Self(index as u32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct ResourceId(pub i32);

impl IdLike for ResourceId {
    fn from_raw(index: usize) -> Self {
        Self(index as i32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

/// How a part joins its parent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Attachment {
    /// Stack node joint; part of the main structural stack.
    #[default]
    Stack,
    /// Radial/surface joint; passes fuel only when the attached part
    /// has crossfeed enabled.
    Surface,
}

/// A propellant pool held by a part.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Resource {
    /// How much of this resource is stored, in units.
    pub amount: f64,
    /// The maximum amount of this resource that this part can hold.
    pub max_amount: f64,
    /// Density of the resource, in kg per unit.
    pub density: f64,
    /// The name of the resource.
    pub name: Arc<str>,
}

impl Resource {
    /// Removes `resource_drain` units, clamping at zero. Amounts never
    /// go negative.
    pub fn drain(&mut self, resource_drain: f64) {
        self.amount -= resource_drain;
        if self.amount < 0.0 {
            self.amount = 0.0;
        }
    }

    pub fn mass(&self) -> f64 {
        self.amount * self.density
    }

    pub fn is_empty(&self) -> bool {
        self.amount <= DRAIN_EPSILON
    }
}

/// Sentinel for a part that is never decoupled.
pub const NEVER_DECOUPLED: i32 = -1;

/// One part of the snapshot: dry mass, resource pools, connectivity,
/// staging data. Engine data lives in [`Engine`] records on the
/// vessel, keyed back to their part.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SimPart {
    pub name: String,
    /// Mass without any resources, in kg.
    pub dry_mass: f64,
    /// Staging index. Highest fires first.
    pub stage: i32,
    pub parent: Option<PartId>,
    pub children: Vec<PartId>,
    pub attachment: Attachment,
    /// Does fuel flow through this part at all?
    pub crossfeed: bool,
    /// Flow-blocking marker; decouplers without crossfeed block the
    /// stack search from crossing them.
    pub blocks_crossfeed: bool,
    /// Explicit fuel-line targets, in declaration order.
    pub fuel_lines_to: Vec<PartId>,
    pub resources: HashMap<ResourceId, Resource>,
    /// Decoupler/separator marker: this part and everything beneath it
    /// detach when its own stage fires.
    pub decoupler: bool,
    /// Host-supplied bias: higher-priority pools are drained first
    /// within the same flow rank.
    pub resource_priority: i32,

    /// Stage in which this part separates from the vehicle, filled in
    /// by the stage resolver. [`NEVER_DECOUPLED`] if it never does.
    pub decoupled_in_stage: i32,

    #[serde(skip)]
    pub(crate) resource_drains: HashMap<ResourceId, f64>,
}

impl SimPart {
    pub fn new(name: impl Into<String>, dry_mass: f64, stage: i32) -> Self {
        Self {
            name: name.into(),
            dry_mass,
            stage,
            parent: None,
            children: Vec::new(),
            attachment: Attachment::Stack,
            crossfeed: true,
            blocks_crossfeed: false,
            fuel_lines_to: Vec::new(),
            resources: HashMap::new(),
            decoupler: false,
            resource_priority: 0,
            decoupled_in_stage: NEVER_DECOUPLED,
            resource_drains: HashMap::new(),
        }
    }

    /// Current mass: dry mass plus all stored resources.
    pub fn mass(&self) -> f64 {
        let mut mass = self.dry_mass;
        for resource in self.resources.values() {
            mass += resource.mass();
        }
        mass
    }

    pub fn has_resource(&self, res: ResourceId) -> bool {
        self.resources.get(&res).is_some_and(|r| !r.is_empty())
    }

    pub(crate) fn clear_resource_drains(&mut self) {
        self.resource_drains.clear();
    }

    pub(crate) fn add_drain(&mut self, res: ResourceId, consumption: f64) {
        self.resource_drains
            .entry(res)
            .and_modify(|x| *x += consumption)
            .or_insert(consumption);
    }

    pub(crate) fn apply_drains(&mut self, dt: f64) {
        for (id, drain) in &self.resource_drains {
            if let Some(resource) = self.resources.get_mut(id) {
                resource.drain(*drain * dt);
            }
        }
    }

    /// Time until the first drained pool on this part runs dry.
    pub(crate) fn max_time(&self) -> f64 {
        let mut max_time = f64::MAX;

        for (res, resource) in &self.resources {
            if resource.is_empty() {
                continue;
            }

            if let Some(drain) = self.resource_drains.get(res) {
                if *drain > 0.0 {
                    max_time = max_time.min(resource.amount / drain);
                }
            }
        }

        max_time
    }
}

impl fmt::Display for SimPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        write!(f, "  Resources:")?;
        for resource in self.resources.values() {
            write!(f, " {}={}*{}", resource.name, resource.amount, resource.density)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "  Stage: {} DecoupledInStage: {}",
            self.stage, self.decoupled_in_stage
        )
    }
}

/// Ambient inputs supplied by the telemetry provider.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Conditions {
    /// Ambient pressure, normalized: 0.0 = vacuum, 1.0 = reference
    /// sea level.
    pub atm_pressure: f64,
    /// Local gravitational acceleration magnitude, m/s^2.
    pub gravity: f64,
}

impl Default for Conditions {
    fn default() -> Self {
        Self {
            atm_pressure: 0.0,
            gravity: crate::sim::G0,
        }
    }
}

/// The snapshot proper. Owned by one simulation run, never mutated by
/// it (the run drains a clone), discarded when the run completes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SimVessel {
    pub parts: Arena<PartId, SimPart>,
    pub engines: Vec<Engine>,
}

impl SimVessel {
    /// The root of the part tree: the first part without a parent.
    pub fn root(&self) -> Option<PartId> {
        self.parts
            .iter()
            .find(|(_, p)| p.parent.is_none())
            .map(|(id, _)| id)
    }

    pub fn total_mass(&self) -> f64 {
        self.parts.iter().map(|(_, p)| p.mass()).sum()
    }

    /// Mass of everything still attached during stage `stage`.
    pub fn stage_mass(&self, stage: i32) -> f64 {
        self.parts
            .iter()
            .filter(|(_, p)| p.decoupled_in_stage < stage)
            .map(|(_, p)| p.mass())
            .sum()
    }

    /// Drops connectivity references that point outside the arena.
    /// Malformed input degrades to weaker connectivity, never a panic.
    pub fn validate_links(&mut self) {
        let len = self.parts.len();
        let in_arena = |id: &PartId| (id.0 as usize) < len;

        for (id, part) in self.parts.iter_mut() {
            if part.parent.is_some_and(|p| !in_arena(&p) || p == id) {
                warn!("part {id:?} has a dangling parent link, detaching");
                part.parent = None;
            }
            let before = part.children.len() + part.fuel_lines_to.len();
            part.children.retain(|c| in_arena(c) && *c != id);
            part.fuel_lines_to.retain(|t| in_arena(t) && *t != id);
            let after = part.children.len() + part.fuel_lines_to.len();
            if before != after {
                warn!("part {id:?} had {} dangling links", before - after);
            }
        }
        self.engines.retain(|e| {
            let ok = (e.part.0 as usize) < len;
            if !ok {
                warn!("engine references missing part {:?}, dropping", e.part);
            }
            ok
        });
    }
}

/// Seam between the simulator and the host's telemetry layer. The
/// simulator has no hidden global vehicle dependency: every run starts
/// from an explicit snapshot handed over by this trait, so synthetic
/// vehicles drive unit tests directly.
pub trait SnapshotSource {
    /// A fresh capture of the active vehicle, or `None` when no
    /// vehicle is available.
    fn snapshot(&self) -> Option<SimVessel>;

    fn conditions(&self) -> Conditions;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn lf() -> Resource {
        Resource {
            amount: 100.0,
            max_amount: 100.0,
            density: 1.0,
            name: "LiquidFuel".into(),
        }
    }

    #[test]
    fn drain_clamps_at_zero() {
        let mut r = lf();
        r.drain(40.0);
        assert!((r.amount - 60.0).abs() < 1e-12);
        r.drain(1000.0);
        assert_eq!(r.amount, 0.0);
    }

    #[test]
    fn part_mass_includes_resources() {
        let mut part = SimPart::new("tank", 50.0, 0);
        part.resources.insert(ResourceId(0), lf());
        assert!((part.mass() - 150.0).abs() < 1e-12);
    }

    #[test]
    fn validate_links_drops_dangling_references() {
        let mut vessel = SimVessel::default();
        let a = vessel.parts.push(SimPart::new("pod", 100.0, 0));
        let mut tank = SimPart::new("tank", 50.0, 0);
        tank.parent = Some(a);
        tank.children.push(PartId(17));
        tank.fuel_lines_to.push(PartId(99));
        let b = vessel.parts.push(tank);
        vessel.parts[a].children.push(b);

        vessel.validate_links();
        assert!(vessel.parts[b].children.is_empty());
        assert!(vessel.parts[b].fuel_lines_to.is_empty());
        assert_eq!(vessel.parts[a].children, vec![b]);
        assert_eq!(vessel.root(), Some(a));
    }

    proptest! {
        #[test]
        fn drained_amounts_never_go_negative(
            amount in 0.0..1e6f64,
            drains in proptest::collection::vec(0.0..1e6f64, 0..8),
        ) {
            let mut r = Resource {
                amount,
                max_amount: 1e6,
                density: 1.0,
                name: "LiquidFuel".into(),
            };
            for drain in drains {
                r.drain(drain);
                prop_assert!(r.amount >= 0.0);
            }
        }

        #[test]
        fn part_mass_is_dry_mass_plus_resource_mass(
            dry in 0.0..1e6f64,
            amount in 0.0..1e6f64,
            density in 0.0..100.0f64,
        ) {
            let mut part = SimPart::new("tank", dry, 0);
            part.resources.insert(
                ResourceId(0),
                Resource {
                    amount,
                    max_amount: 1e6,
                    density,
                    name: "LiquidFuel".into(),
                },
            );
            prop_assert!((part.mass() - (dry + amount * density)).abs() < 1e-6);
        }
    }
}
