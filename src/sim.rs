//! The stage simulator: drains the flow graph stage by stage and
//! applies the rocket equation, producing one [`StageStats`] per
//! stage. Time advances in depletion-bounded steps; within a step the
//! active engine set, thrust and mass flow are constant, so each step
//! integrates the rocket equation exactly.

use std::collections::{HashMap, HashSet};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{trace, warn};

use crate::{
    flow::{resolve_suppliers, FlowPolicy},
    stage::{resolve_stages, Stage},
    vessel::{Conditions, PartId, ResourceId, SimVessel},
};

/// Standard gravitational acceleration, m/s^2.
pub const G0: f64 = 9.80665;

/// Drain steps allowed per stage before the result is declared
/// indeterminate. Bounds worst-case cost when the flow graph never
/// drains.
pub const MAX_STEPS: usize = 100;

/// Predicted performance of one stage. Immutable once published;
/// superseded wholesale by the next run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StageStats {
    /// Stage number; the highest burns first.
    pub stage: i32,
    /// Rated vacuum thrust of the engines that fired, N.
    pub thrust: f64,
    /// Throttle- and pressure-adjusted thrust at stage start, N.
    pub actual_thrust: f64,
    /// Burn-weighted effective specific impulse, s.
    pub isp: f64,
    /// Delta-v delivered by this stage, m/s.
    pub deltav: f64,
    /// Thrust-to-weight ratio at stage start, against local gravity.
    pub twr: f64,
    /// Mass before the stage burns, kg.
    pub start_mass: f64,
    /// Mass at burnout, kg.
    pub end_mass: f64,
    /// Burn duration, s.
    pub burn_time: f64,
    /// Set when the drain loop hit its iteration cap; delta-v is
    /// reported as zero rather than trusted.
    pub indeterminate: bool,
}

impl StageStats {
    /// Propellant mass expended by this stage, kg.
    pub fn resource_mass(&self) -> f64 {
        self.start_mass - self.end_mass
    }

    /// Acceleration at burnout, m/s^2.
    pub fn max_accel(&self) -> f64 {
        if self.end_mass > 0.0 {
            self.actual_thrust / self.end_mass
        } else {
            0.0
        }
    }

    pub fn start_twr(&self, gravity: f64) -> f64 {
        if self.start_mass > 0.0 && gravity > 0.0 {
            self.actual_thrust / (self.start_mass * gravity)
        } else {
            0.0
        }
    }

    pub fn max_twr(&self, gravity: f64) -> f64 {
        if gravity > 0.0 {
            self.max_accel() / gravity
        } else {
            0.0
        }
    }
}

impl fmt::Display for StageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stage: {} Thrust: {} Time: {} StartMass: {} EndMass: {} DeltaV: {} ISP: {}",
            self.stage,
            self.actual_thrust,
            self.burn_time,
            self.start_mass,
            self.end_mass,
            self.deltav,
            self.isp
        )
    }
}

/// One full simulation pass over a vessel. The vessel handed to
/// [`Self::run`] is the run's private clone of the snapshot; it is
/// drained in place and discarded by the caller afterwards.
#[derive(Debug, Default)]
pub struct StageSimulation {
    pub stats: Vec<StageStats>,
    policy: FlowPolicy,
    parts_with_resource_drains: HashSet<PartId>,
}

impl StageSimulation {
    pub fn new(policy: FlowPolicy) -> Self {
        Self {
            stats: Vec::new(),
            policy,
            parts_with_resource_drains: HashSet::new(),
        }
    }

    /// Runs every stage from the highest number down to zero, carrying
    /// the drained resource state across stage boundaries.
    pub fn run(&mut self, vessel: &mut SimVessel, conditions: Conditions) {
        self.stats.clear();

        for stage in resolve_stages(vessel) {
            let stats = self.run_stage(vessel, &stage, conditions);
            trace!("StageSimulation::run: {stats}");
            self.stats.push(stats);
        }
    }

    fn run_stage(
        &mut self,
        vessel: &mut SimVessel,
        stage: &Stage,
        conditions: Conditions,
    ) -> StageStats {
        let start_mass = vessel.stage_mass(stage.number);
        let mut stats = StageStats {
            stage: stage.number,
            start_mass,
            end_mass: start_mass,
            ..StageStats::default()
        };

        let mut time = 0.0;
        let mut deltav = 0.0;
        let mut steps = 0;
        let mut capped = false;

        loop {
            let active = self.active_engines(vessel, stage, conditions);
            if active.is_empty() {
                break;
            }

            if steps == 0 {
                stats.thrust = active
                    .iter()
                    .map(|&i| vessel.engines[i].vac_thrust)
                    .sum();
                stats.actual_thrust = active
                    .iter()
                    .map(|&i| vessel.engines[i].thrust_at(conditions.atm_pressure))
                    .sum();
            }

            steps += 1;
            if steps > MAX_STEPS {
                warn!(
                    "stage {} exceeded {MAX_STEPS} drain steps, marking indeterminate",
                    stage.number
                );
                capped = true;
                break;
            }

            self.update_resource_drains(vessel, stage, &active, conditions);
            let dt = self.resource_max_time(vessel);
            trace!("StageSimulation::run_stage: stage={} dt={dt}", stage.number);

            if dt <= 0.0 || dt >= f64::MAX {
                warn!(
                    "stage {} cannot make drain progress, marking indeterminate",
                    stage.number
                );
                capped = true;
                break;
            }

            let mass_before = vessel.stage_mass(stage.number);
            let thrust: f64 = active
                .iter()
                .map(|&i| vessel.engines[i].thrust_at(conditions.atm_pressure))
                .sum();
            let flow: f64 = active
                .iter()
                .map(|&i| vessel.engines[i].mass_flow_rate(conditions.atm_pressure))
                .sum();

            self.apply_resource_drains(vessel, dt);
            time += dt;

            let mass_after = vessel.stage_mass(stage.number);
            if flow > 0.0 && mass_before > mass_after {
                let exhaust_velocity = thrust / flow;
                deltav += exhaust_velocity * libm::log(mass_before / mass_after);
            }
        }

        self.clear_resource_drains(vessel);

        stats.end_mass = vessel.stage_mass(stage.number);
        stats.burn_time = time;
        stats.indeterminate = capped;
        if !capped {
            stats.deltav = deltav;
            stats.isp = if start_mass > stats.end_mass {
                deltav / (G0 * libm::log(start_mass / stats.end_mass))
            } else {
                0.0
            };
        }
        stats.twr = stats.start_twr(conditions.gravity);
        stats
    }

    /// Engines able to fire right now: ignited in this stage, still
    /// attached, producing thrust, and with at least one reachable
    /// non-empty supplier for every mixture component. An engine that
    /// fails the supply check contributes zero thrust without
    /// aborting the rest of the stage.
    fn active_engines(
        &self,
        vessel: &SimVessel,
        stage: &Stage,
        conditions: Conditions,
    ) -> Vec<usize> {
        let mut active = Vec::new();

        'engines: for &i in &stage.engines {
            let engine = &vessel.engines[i];
            if engine.thrust_at(conditions.atm_pressure) <= 0.0 {
                continue;
            }

            let rates = engine.consumption_rates(conditions.atm_pressure);
            if rates.is_empty() {
                continue;
            }

            for &res in rates.keys() {
                if self
                    .suppliers(vessel, stage.number, engine.part, res)
                    .is_empty()
                {
                    continue 'engines;
                }
            }

            active.push(i);
        }

        active
    }

    /// Flow resolution restricted to parts still attached during the
    /// stage; pools on already-separated parts no longer supply.
    fn suppliers(
        &self,
        vessel: &SimVessel,
        stage_number: i32,
        engine_part: PartId,
        res: ResourceId,
    ) -> Vec<crate::flow::FlowEdge> {
        let mut edges = resolve_suppliers(vessel, engine_part, res, self.policy);
        edges.retain(|e| vessel.parts[e.supplier].decoupled_in_stage < stage_number);
        edges
    }

    /// Rebuilds the drain table for this step: every active engine's
    /// demand goes to the suppliers of the best (lowest) rank, split
    /// evenly within that rank.
    fn update_resource_drains(
        &mut self,
        vessel: &mut SimVessel,
        stage: &Stage,
        active: &[usize],
        conditions: Conditions,
    ) {
        for part in &self.parts_with_resource_drains {
            vessel.parts[*part].clear_resource_drains();
        }
        self.parts_with_resource_drains.clear();

        let demands: Vec<(PartId, HashMap<ResourceId, f64>)> = active
            .iter()
            .map(|&i| {
                let engine = &vessel.engines[i];
                (engine.part, engine.consumption_rates(conditions.atm_pressure))
            })
            .collect();

        for (engine_part, rates) in demands {
            for (res, rate) in rates {
                if rate <= 0.0 {
                    continue;
                }

                let edges = self.suppliers(vessel, stage.number, engine_part, res);
                let Some(best) = edges.first().map(|e| e.rank) else {
                    continue;
                };
                let sources: Vec<PartId> = edges
                    .iter()
                    .take_while(|e| e.rank == best)
                    .map(|e| e.supplier)
                    .collect();

                let share = rate / sources.len() as f64;
                for source in sources {
                    vessel.parts[source].add_drain(res, share);
                    self.parts_with_resource_drains.insert(source);
                }
            }
        }
    }

    fn apply_resource_drains(&mut self, vessel: &mut SimVessel, dt: f64) {
        for part in &self.parts_with_resource_drains {
            vessel.parts[*part].apply_drains(dt);
        }
    }

    fn clear_resource_drains(&mut self, vessel: &mut SimVessel) {
        for part in &self.parts_with_resource_drains {
            vessel.parts[*part].clear_resource_drains();
        }
        self.parts_with_resource_drains.clear();
    }

    /// Time until the first drained pool anywhere runs dry.
    fn resource_max_time(&self, vessel: &SimVessel) -> f64 {
        let mut max_time = f64::MAX;

        for part in &self.parts_with_resource_drains {
            max_time = std::cmp::min(
                OrderedFloat(vessel.parts[*part].max_time()),
                OrderedFloat(max_time),
            )
            .0;
        }

        max_time
    }
}
