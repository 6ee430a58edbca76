//! The simulation manager: the host-facing scheduler that owns the
//! published results. Recompute requests coalesce into a dirty flag;
//! a tick runs at most one simulation and swaps the whole result table
//! at once, so readers holding the previous [`Arc`] keep a coherent
//! view.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    flow::FlowPolicy,
    sim::{StageSimulation, StageStats},
    vessel::SnapshotSource,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SimState {
    #[default]
    Idle,
    RecomputationPending,
}

/// One complete, internally consistent set of per-stage predictions.
/// Replaced wholesale on every run; never edited in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultTable {
    /// Per-stage predictions, in burn order (highest stage first).
    pub stats: Vec<StageStats>,
}

impl ResultTable {
    pub fn total_deltav(&self) -> f64 {
        self.stats.iter().map(|s| s.deltav).sum()
    }

    /// The soonest-to-burn stage that actually expends propellant;
    /// engineless or dry stages ahead of it are skipped.
    pub fn current_stage(&self) -> Option<&StageStats> {
        self.stats.iter().find(|s| s.resource_mass() > 0.0)
    }
}

/// Owns the snapshot source and the published results. Single
/// consumer; the host calls [`Self::request_recompute`] whenever the
/// vehicle or ambient conditions change and [`Self::tick`] from its
/// update loop.
pub struct SimulationManager<S> {
    source: S,
    state: SimState,
    policy: FlowPolicy,
    results: Arc<ResultTable>,
    completed_runs: u64,
}

impl<S: SnapshotSource> SimulationManager<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: SimState::Idle,
            policy: FlowPolicy::default(),
            results: Arc::new(ResultTable::default()),
            completed_runs: 0,
        }
    }

    pub fn with_policy(source: S, policy: FlowPolicy) -> Self {
        let mut manager = Self::new(source);
        manager.policy = policy;
        manager
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    /// Marks the published results stale. Any number of calls before
    /// the next tick collapse into a single recomputation.
    pub fn request_recompute(&mut self) {
        trace!("SimulationManager::request_recompute");
        self.state = SimState::RecomputationPending;
    }

    /// Runs at most one simulation. Returns whether a run happened.
    pub fn tick(&mut self) -> bool {
        if self.state != SimState::RecomputationPending {
            return false;
        }
        self.state = SimState::Idle;

        let results = match self.source.snapshot() {
            Some(mut vessel) => {
                vessel.validate_links();
                let mut sim = StageSimulation::new(self.policy);
                sim.run(&mut vessel, self.source.conditions());
                ResultTable { stats: sim.stats }
            }
            None => {
                debug!("no vehicle available, publishing an empty result table");
                ResultTable::default()
            }
        };

        self.results = Arc::new(results);
        self.completed_runs += 1;
        true
    }

    /// The most recently published results. Cheap to clone and safe to
    /// hold across later recomputations.
    pub fn results(&self) -> Arc<ResultTable> {
        Arc::clone(&self.results)
    }

    pub fn total_deltav(&self) -> f64 {
        self.results.total_deltav()
    }

    pub fn current_stage(&self) -> Option<StageStats> {
        self.results.current_stage().copied()
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{Engine, Propellant},
        vessel::{Conditions, PartId, Resource, ResourceId, SimPart, SimVessel},
    };

    const LF: ResourceId = ResourceId(0);

    struct FixedSource {
        vessel: Option<SimVessel>,
    }

    impl SnapshotSource for FixedSource {
        fn snapshot(&self) -> Option<SimVessel> {
            self.vessel.clone()
        }

        fn conditions(&self) -> Conditions {
            Conditions::default()
        }
    }

    fn test_vessel() -> SimVessel {
        let mut vessel = SimVessel::default();
        let tank = vessel.parts.push(SimPart::new("tank", 800.0, 0));
        vessel.parts[tank].resources.insert(
            LF,
            Resource {
                amount: 200.0,
                max_amount: 200.0,
                density: 1.0,
                name: "LiquidFuel".into(),
            },
        );
        let mut nozzle = SimPart::new("engine", 0.0, 0);
        nozzle.parent = Some(tank);
        let eng = vessel.parts.push(nozzle);
        vessel.parts[tank].children.push(eng);

        let mut engine = Engine::new(eng, 10_000.0, 300.0, 280.0);
        engine.propellants.push(Propellant {
            resource: LF,
            ratio: 1.0,
            density: 1.0,
        });
        vessel.engines.push(engine);
        vessel
    }

    #[test]
    fn repeated_requests_coalesce_into_one_run() {
        let mut manager = SimulationManager::new(FixedSource {
            vessel: Some(test_vessel()),
        });

        manager.request_recompute();
        manager.request_recompute();
        manager.request_recompute();
        assert_eq!(manager.state(), SimState::RecomputationPending);

        assert!(manager.tick());
        assert_eq!(manager.completed_runs(), 1);
        assert_eq!(manager.state(), SimState::Idle);

        // Nothing pending: ticking again is a no-op.
        assert!(!manager.tick());
        assert_eq!(manager.completed_runs(), 1);
    }

    #[test]
    fn missing_vehicle_publishes_an_empty_table() {
        let mut manager = SimulationManager::new(FixedSource { vessel: None });
        manager.request_recompute();
        assert!(manager.tick());

        assert!(manager.results().stats.is_empty());
        assert_eq!(manager.total_deltav(), 0.0);
        assert!(manager.current_stage().is_none());
    }

    #[test]
    fn current_stage_skips_stages_that_burn_nothing() {
        // Bumping the tank's stage index inserts an engineless stage
        // ahead of the burn.
        let mut vessel = test_vessel();
        vessel.parts[PartId(0)].stage = 1;

        let mut manager = SimulationManager::new(FixedSource {
            vessel: Some(vessel),
        });
        manager.request_recompute();
        manager.tick();

        assert_eq!(manager.results().stats.len(), 2);
        let current = manager.current_stage().unwrap();
        assert_eq!(current.stage, 0);
        assert!(current.deltav > 0.0);
    }

    #[test]
    fn recomputing_an_unchanged_vehicle_is_idempotent() {
        let mut manager = SimulationManager::new(FixedSource {
            vessel: Some(test_vessel()),
        });

        manager.request_recompute();
        manager.tick();
        let first = manager.results();

        manager.request_recompute();
        manager.tick();
        let second = manager.results();

        // The source is pure, so reruns reproduce the table exactly.
        assert_eq!(*first, *second);
        assert!(first.total_deltav() > 0.0);
    }

    #[test]
    fn readers_keep_the_table_they_were_handed() {
        let mut manager = SimulationManager::new(FixedSource {
            vessel: Some(test_vessel()),
        });
        manager.request_recompute();
        manager.tick();

        let held = manager.results();
        let held_total = held.total_deltav();

        manager.request_recompute();
        manager.tick();

        // The swap replaced the Arc, not the table behind ours.
        assert_eq!(held.total_deltav(), held_total);
        assert_eq!(manager.completed_runs(), 2);
    }

    #[test]
    fn dangling_links_are_scrubbed_before_the_run() {
        let mut vessel = test_vessel();
        vessel.parts[PartId(0)].fuel_lines_to.push(PartId(40));

        let mut manager = SimulationManager::new(FixedSource {
            vessel: Some(vessel),
        });
        manager.request_recompute();
        assert!(manager.tick());
        assert!(manager.total_deltav() > 0.0);
    }
}
