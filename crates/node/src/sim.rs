//! Stateful machine telemetry simulator for local development.
//!
//! Models plausible industrial sensor behaviour:
//! - Readings wander smoothly (mean-reverting walk), never teleport
//! - Correlated channels (power and pressure track rotation speed)
//! - Per-reading electronic noise and occasional spikes
//! - Idle cycles (machine spins down, cools off, reports IDLE)
//! - Scenario presets driving long-term drift and status transitions

use std::fmt;

// ---------------------------------------------------------------------------
// Noise source
// ---------------------------------------------------------------------------

/// Roughly-normal unit noise: twelve uniform draws summed and centred.
/// Sensor electronics are bell-curve-ish, and fastrand only hands out
/// uniforms, so this stands in for a real normal sampler.
fn unit_noise() -> f64 {
    let sum: f64 = (0..12).map(|_| fastrand::f64()).sum();
    sum - 6.0
}

/// Scaled noise around `mean`.  Every jittered channel — walk steps,
/// per-reading sensor noise, spikes, calibration scatter — goes through
/// here with its own sigma.
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * unit_noise()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Fault profiles for a simulated machine, chosen with `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Healthy machine: stable temperature and vibration, occasional idle
    /// cycles.  Nothing should trip the analysis engine.
    Steady,
    /// Bearing wear: vibration creeps upward over time until the hub
    /// starts flagging WARNING and then CRITICAL readings.
    Degrading,
    /// Cooling failure: temperature climbs steadily toward and past the
    /// critical threshold.
    Overheating,
    /// Noisy sensors: fat-tailed noise and spikes.  Exercises validation
    /// and the z-score pass without a true fault.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "degrading" => Self::Degrading,
            "overheating" => Self::Overheating,
            "flaky" => Self::Flaky,
            _ => Self::Steady, // anything unrecognized runs healthy
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Degrading => write!(f, "degrading"),
            Self::Overheating => write!(f, "overheating"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One tick of simulated sensor values plus the derived status.
#[derive(Debug, Clone)]
pub struct Sample {
    pub temperature: f64,
    pub vibration: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub power_consumption: f64,
    pub rotation_speed: f64,
    pub status: &'static str,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct MachineSim {
    // Slow-moving "true" values; evolve each tick.
    temp_base: f64,
    vib_base: f64,
    rotation_base: f64,

    // Long-term drift and mean-reversion per tick (scenario-dependent; a
    // runaway scenario simply has no reversion on the runaway channel).
    temp_drift: f64,
    vib_drift: f64,
    temp_reversion: f64,
    vib_reversion: f64,

    // Noise parameters.
    noise_scale: f64,
    spike_prob: f32,

    // Idle cycling.
    idle_ticks_left: u32,
    idle_prob: f32,

    humidity_base: f64,
}

impl MachineSim {
    pub fn new(scenario: Scenario) -> Self {
        let (temp_drift, vib_drift, temp_rev, vib_rev, noise_scale, spike_prob, idle_prob) =
            match scenario {
                Scenario::Steady => (0.0, 0.0, 0.03, 0.02, 1.0, 0.005_f32, 0.02_f32),
                Scenario::Degrading => (0.0, 0.0015, 0.03, 0.0, 1.0, 0.01, 0.01),
                Scenario::Overheating => (0.18, 0.0, 0.0, 0.02, 1.0, 0.01, 0.0),
                Scenario::Flaky => (0.0, 0.0, 0.03, 0.02, 3.0, 0.10, 0.02),
            };
        Self {
            temp_base: gaussian(68.0, 4.0),
            vib_base: gaussian(0.35, 0.05).clamp(0.1, 0.6),
            rotation_base: gaussian(1500.0, 100.0),
            temp_drift,
            vib_drift,
            temp_reversion: temp_rev,
            vib_reversion: vib_rev,
            noise_scale,
            spike_prob,
            idle_ticks_left: 0,
            idle_prob,
            humidity_base: gaussian(45.0, 5.0).clamp(20.0, 70.0),
        }
    }

    /// Produce the next tick.  Order matters: the internal bases evolve
    /// with every call.
    pub fn sample(&mut self) -> Sample {
        if self.idle_ticks_left > 0 {
            self.idle_ticks_left -= 1;
            return self.idle_sample();
        }
        // A cool machine may spin down for a while.  (A hot one reporting
        // IDLE would be contradictory telemetry, which is the hub's job to
        // reject, not ours to produce.)
        if self.temp_base < 75.0 && fastrand::f32() < self.idle_prob {
            self.idle_ticks_left = fastrand::u32(5..30);
            return self.idle_sample();
        }

        // -- Evolve the base values ---------------------------------------
        self.temp_base +=
            self.temp_drift + self.temp_reversion * (70.0 - self.temp_base) + gaussian(0.0, 0.8);
        self.vib_base +=
            self.vib_drift + self.vib_reversion * (0.35 - self.vib_base) + gaussian(0.0, 0.01);
        self.rotation_base += 0.05 * (1500.0 - self.rotation_base) + gaussian(0.0, 15.0);

        self.temp_base = self.temp_base.clamp(-20.0, 150.0);
        self.vib_base = self.vib_base.clamp(0.0, 1.0);

        // -- Instantaneous reading ----------------------------------------
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, 12.0)
        } else {
            0.0
        };
        let temperature = self.temp_base + gaussian(0.0, 0.6 * self.noise_scale) + spike;
        let vibration = self.vib_base + gaussian(0.0, 0.015 * self.noise_scale);
        let rotation_speed = self.rotation_base + gaussian(0.0, 10.0 * self.noise_scale);

        // Power and pressure track the load.
        let load = rotation_speed / 1500.0;
        let power_consumption = 150.0 * load + gaussian(0.0, 6.0 * self.noise_scale);
        let pressure = 2.4 * load + gaussian(0.0, 0.08 * self.noise_scale);
        let humidity = self.humidity_base + gaussian(0.0, 1.5);

        let temperature = temperature.clamp(-20.0, 180.0);
        let vibration = vibration.clamp(0.0, 1.0);

        Sample {
            temperature,
            vibration,
            pressure: pressure.clamp(0.0, 10.0),
            humidity: humidity.clamp(0.0, 100.0),
            power_consumption: power_consumption.clamp(0.0, 10_000.0),
            rotation_speed: rotation_speed.clamp(0.0, 5_000.0),
            status: derive_status(temperature, vibration, false),
        }
    }

    fn idle_sample(&mut self) -> Sample {
        // Cool toward ambient while stopped.
        self.temp_base += 0.2 * (30.0 - self.temp_base);
        let temperature = (self.temp_base + gaussian(0.0, 0.4)).clamp(-20.0, 79.0);
        let vibration = gaussian(0.03, 0.01).clamp(0.0, 0.2);
        Sample {
            temperature,
            vibration,
            pressure: gaussian(0.1, 0.02).clamp(0.0, 10.0),
            humidity: (self.humidity_base + gaussian(0.0, 1.5)).clamp(0.0, 100.0),
            power_consumption: gaussian(8.0, 1.0).clamp(0.0, 10_000.0),
            rotation_speed: 0.0,
            status: derive_status(temperature, vibration, true),
        }
    }
}

/// Status follows the measured values so the hub's cross-field quality
/// rules always hold for simulated traffic.
fn derive_status(temperature: f64, vibration: f64, idle: bool) -> &'static str {
    if temperature >= 100.0 || vibration >= 0.8 {
        "CRITICAL"
    } else if temperature >= 90.0 || vibration >= 0.7 {
        "WARNING"
    } else if idle {
        "IDLE"
    } else {
        "RUNNING"
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(sim: &mut MachineSim, n: usize) -> Vec<Sample> {
        (0..n).map(|_| sim.sample()).collect()
    }

    #[test]
    fn values_stay_inside_wire_ranges() {
        for scenario in [
            Scenario::Steady,
            Scenario::Degrading,
            Scenario::Overheating,
            Scenario::Flaky,
        ] {
            let mut sim = MachineSim::new(scenario);
            for s in collect(&mut sim, 500) {
                assert!((-50.0..=200.0).contains(&s.temperature), "{scenario}: {s:?}");
                assert!((0.0..=1.0).contains(&s.vibration), "{scenario}: {s:?}");
                assert!((0.0..=10.0).contains(&s.pressure), "{scenario}: {s:?}");
                assert!((0.0..=100.0).contains(&s.humidity), "{scenario}: {s:?}");
                assert!(
                    (0.0..=10_000.0).contains(&s.power_consumption),
                    "{scenario}: {s:?}"
                );
                assert!(
                    (0.0..=5_000.0).contains(&s.rotation_speed),
                    "{scenario}: {s:?}"
                );
            }
        }
    }

    #[test]
    fn status_never_contradicts_the_quality_rules() {
        for scenario in [Scenario::Steady, Scenario::Flaky, Scenario::Overheating] {
            let mut sim = MachineSim::new(scenario);
            for s in collect(&mut sim, 1000) {
                if s.status == "IDLE" {
                    assert!(s.temperature <= 80.0, "hot idle sample: {s:?}");
                }
                if s.status == "CRITICAL" {
                    assert!(
                        s.temperature >= 50.0 || s.vibration >= 0.5,
                        "cold quiet critical sample: {s:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn overheating_trends_upward() {
        let mut sim = MachineSim::new(Scenario::Overheating);
        let early: f64 = collect(&mut sim, 20)
            .iter()
            .map(|s| s.temperature)
            .sum::<f64>()
            / 20.0;
        // Let it cook.
        collect(&mut sim, 200);
        let late: f64 = collect(&mut sim, 20)
            .iter()
            .map(|s| s.temperature)
            .sum::<f64>()
            / 20.0;
        assert!(
            late > early + 10.0,
            "expected a clear climb: early={early:.1} late={late:.1}"
        );
    }

    #[test]
    fn degrading_vibration_grows() {
        let mut sim = MachineSim::new(Scenario::Degrading);
        let early: f64 = collect(&mut sim, 20).iter().map(|s| s.vibration).sum::<f64>() / 20.0;
        collect(&mut sim, 400);
        let late: f64 = collect(&mut sim, 20).iter().map(|s| s.vibration).sum::<f64>() / 20.0;
        assert!(
            late > early,
            "expected vibration growth: early={early:.3} late={late:.3}"
        );
    }

    #[test]
    fn steady_machine_stays_healthy_mostly() {
        let mut sim = MachineSim::new(Scenario::Steady);
        let samples = collect(&mut sim, 300);
        let critical = samples.iter().filter(|s| s.status == "CRITICAL").count();
        // Spikes can trip an occasional reading, but a steady machine must
        // not look broken.
        assert!(critical < 10, "too many CRITICAL samples: {critical}");
    }

    #[test]
    fn consecutive_samples_stay_close() {
        let mut sim = MachineSim::new(Scenario::Steady);
        let temps: Vec<f64> = collect(&mut sim, 100).iter().map(|s| s.temperature).collect();
        let max_jump = temps
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0, f64::max);
        // Idle transitions step down sharply; anything beyond that bound
        // would mean the walk lost coherence.
        assert!(max_jump < 60.0, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn scenario_parsing_is_lossy_and_case_blind() {
        assert_eq!(Scenario::from_str_lossy("steady"), Scenario::Steady);
        assert_eq!(Scenario::from_str_lossy("DEGRADING"), Scenario::Degrading);
        assert_eq!(Scenario::from_str_lossy("Overheating"), Scenario::Overheating);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Steady);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Steady);
    }

    #[test]
    fn scenario_display_round_trips() {
        for s in [
            Scenario::Steady,
            Scenario::Degrading,
            Scenario::Overheating,
            Scenario::Flaky,
        ] {
            assert_eq!(Scenario::from_str_lossy(&s.to_string()), s);
        }
    }

    #[test]
    fn derive_status_boundaries() {
        assert_eq!(derive_status(100.0, 0.1, false), "CRITICAL");
        assert_eq!(derive_status(70.0, 0.8, false), "CRITICAL");
        assert_eq!(derive_status(90.0, 0.1, false), "WARNING");
        assert_eq!(derive_status(70.0, 0.7, false), "WARNING");
        assert_eq!(derive_status(70.0, 0.3, true), "IDLE");
        assert_eq!(derive_status(70.0, 0.3, false), "RUNNING");
    }
}
