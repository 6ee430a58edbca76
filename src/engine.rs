//! The engine performance model: thrust and specific impulse as a
//! function of ambient pressure and throttle, interpolated between
//! vacuum and sea-level ratings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    sim::G0,
    vessel::{PartId, ResourceId},
};

/// One component of an engine's propellant mixture.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Propellant {
    pub resource: ResourceId,
    /// Consumption ratio relative to the rest of the mixture, in
    /// volume units.
    pub ratio: f64,
    /// Density of the propellant, in kg per unit.
    pub density: f64,
}

/// An engine module. Belongs to exactly one part; ignites when that
/// part's stage fires.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Engine {
    pub part: PartId,
    pub propellants: Vec<Propellant>,
    /// Rated thrust in vacuum, N.
    pub vac_thrust: f64,
    /// Specific impulse in vacuum, s.
    pub vac_isp: f64,
    /// Specific impulse at reference sea-level pressure, s.
    pub sl_isp: f64,
    /// Throttle setting, 0.0..=1.0.
    pub throttle: f64,
}

impl Engine {
    pub fn new(part: PartId, vac_thrust: f64, vac_isp: f64, sl_isp: f64) -> Self {
        Self {
            part,
            propellants: Vec::new(),
            vac_thrust,
            vac_isp,
            sl_isp,
            throttle: 1.0,
        }
    }

    /// Effective Isp at `atm_pressure`, linear between the vacuum and
    /// sea-level ratings and clamped beyond them.
    pub fn isp_at(&self, atm_pressure: f64) -> f64 {
        lerp(self.vac_isp, self.sl_isp, atm_pressure.clamp(0.0, 1.0))
    }

    /// Effective thrust at `atm_pressure`: the vacuum rating scaled by
    /// throttle and by the Isp ratio, so thrust falls off with
    /// backpressure the way Isp does.
    pub fn thrust_at(&self, atm_pressure: f64) -> f64 {
        if self.vac_isp <= 0.0 {
            return 0.0;
        }
        self.vac_thrust * self.throttle.clamp(0.0, 1.0) * self.isp_at(atm_pressure) / self.vac_isp
    }

    /// Total propellant mass flow at `atm_pressure`, kg/s.
    pub fn mass_flow_rate(&self, atm_pressure: f64) -> f64 {
        let isp = self.isp_at(atm_pressure);
        if isp <= 0.0 {
            return 0.0;
        }
        self.thrust_at(atm_pressure) / (isp * G0)
    }

    /// Per-resource volume consumption rates (units/s), splitting the
    /// mass flow across the mixture by ratio and density. Empty when
    /// the mixture carries no mass.
    pub fn consumption_rates(&self, atm_pressure: f64) -> HashMap<ResourceId, f64> {
        let mut rates = HashMap::new();

        let mut total_density = 0.0;
        for propellant in &self.propellants {
            if propellant.density <= 0.0 {
                continue;
            }
            total_density += propellant.ratio * propellant.density;
        }

        if total_density <= 0.0 {
            return rates;
        }

        let volume_flow_rate = self.mass_flow_rate(atm_pressure) / total_density;

        for propellant in &self.propellants {
            if propellant.density <= 0.0 {
                continue;
            }

            rates
                .entry(propellant.resource)
                .and_modify(|x| *x += propellant.ratio * volume_flow_rate)
                .or_insert(propellant.ratio * volume_flow_rate);
        }

        rates
    }
}

pub(crate) fn lerp(x: f64, y: f64, t: f64) -> f64 {
    x + t * (y - x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        let mut e = Engine::new(PartId(0), 215_000.0, 320.0, 250.0);
        e.propellants.push(Propellant {
            resource: ResourceId(0),
            ratio: 0.9,
            density: 5.0,
        });
        e.propellants.push(Propellant {
            resource: ResourceId(1),
            ratio: 1.1,
            density: 5.0,
        });
        e
    }

    #[test]
    fn isp_interpolates_and_clamps() {
        let e = engine();
        assert_eq!(e.isp_at(0.0), 320.0);
        assert_eq!(e.isp_at(1.0), 250.0);
        assert!((e.isp_at(0.5) - 285.0).abs() < 1e-12);
        // Beyond the reference endpoints the ratings hold flat.
        assert_eq!(e.isp_at(-2.0), 320.0);
        assert_eq!(e.isp_at(4.0), 250.0);
    }

    #[test]
    fn thrust_tracks_isp_ratio_and_throttle() {
        let mut e = engine();
        assert!((e.thrust_at(0.0) - 215_000.0).abs() < 1e-9);
        assert!((e.thrust_at(1.0) - 215_000.0 * 250.0 / 320.0).abs() < 1e-9);
        e.throttle = 0.5;
        assert!((e.thrust_at(0.0) - 107_500.0).abs() < 1e-9);
    }

    #[test]
    fn mass_flow_is_throttle_scaled_and_pressure_invariant() {
        let e = engine();
        // thrust/isp shrink together, so the flow rate stays put.
        let vac = e.mass_flow_rate(0.0);
        let asl = e.mass_flow_rate(1.0);
        assert!((vac - asl).abs() < 1e-12);
        assert!((vac - 215_000.0 / (320.0 * G0)).abs() < 1e-9);
    }

    #[test]
    fn consumption_rates_follow_mixture_ratios() {
        let e = engine();
        let rates = e.consumption_rates(0.0);
        let lf = rates[&ResourceId(0)];
        let ox = rates[&ResourceId(1)];
        assert!((ox / lf - 1.1 / 0.9).abs() < 1e-12);
        // Mass flow recovered from the volume rates matches.
        let mass_flow = lf * 5.0 + ox * 5.0;
        assert!((mass_flow - e.mass_flow_rate(0.0)).abs() < 1e-12);
    }

    #[test]
    fn massless_mixture_has_no_consumption() {
        let mut e = engine();
        for p in &mut e.propellants {
            p.density = 0.0;
        }
        assert!(e.consumption_rates(0.0).is_empty());
    }
}
