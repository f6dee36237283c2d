//! Injectable fault and latency policy
//!
//! The store consults a [`FaultPolicy`] on every write: it sleeps for the
//! returned latency, then asks whether the write should fail with a simulated
//! transient timeout. Tests script exact outcomes with [`ScriptedFaults`].

use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait FaultPolicy: Send + Sync {
    /// Latency to inject before the operation
    fn latency(&self) -> Duration;

    /// Whether this attempt should fail with a simulated timeout
    fn should_time_out(&self) -> bool;
}

/// Never injects anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultPolicy for NoFaults {
    fn latency(&self) -> Duration {
        Duration::ZERO
    }

    fn should_time_out(&self) -> bool {
        false
    }
}

/// Randomized faults for load simulation
#[derive(Debug, Clone)]
pub struct RandomFaults {
    /// Probability in `[0, 1]` that a write times out
    pub timeout_probability: f64,
    /// Add a cosine-shaped latency of up to one second
    pub simulate_latency: bool,
}

impl Default for RandomFaults {
    fn default() -> Self {
        Self {
            timeout_probability: 0.1,
            simulate_latency: true,
        }
    }
}

impl FaultPolicy for RandomFaults {
    fn latency(&self) -> Duration {
        if !self.simulate_latency {
            return Duration::ZERO;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        cosine_latency(now)
    }

    fn should_time_out(&self) -> bool {
        self.timeout_probability > 0.0
            && rand::thread_rng().gen_bool(self.timeout_probability.min(1.0))
    }
}

/// `(cos(t) + 1) / 2` seconds, so latency swings smoothly between 0 and 1s
pub fn cosine_latency(t_secs: f64) -> Duration {
    Duration::from_secs_f64((t_secs.cos() + 1.0) * 0.5)
}

/// Pre-scripted outcomes, consumed one per write. Once the script runs out,
/// every further write succeeds.
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    timeouts: Mutex<VecDeque<bool>>,
    latency: Duration,
}

impl ScriptedFaults {
    pub fn new(timeouts: impl IntoIterator<Item = bool>) -> Self {
        Self {
            timeouts: Mutex::new(timeouts.into_iter().collect()),
            latency: Duration::ZERO,
        }
    }

    /// Fail every write
    pub fn always_time_out(count: usize) -> Self {
        Self::new(std::iter::repeat(true).take(count))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Outcomes not yet consumed
    pub fn remaining(&self) -> usize {
        self.timeouts.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl FaultPolicy for ScriptedFaults {
    fn latency(&self) -> Duration {
        self.latency
    }

    fn should_time_out(&self) -> bool {
        self.timeouts
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_latency_bounds() {
        assert_eq!(cosine_latency(0.0), Duration::from_secs(1));
        assert!(cosine_latency(std::f64::consts::PI) < Duration::from_millis(1));
        for t in 0..100 {
            assert!(cosine_latency(t as f64 * 0.37) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_scripted_sequence() {
        let faults = ScriptedFaults::new([true, false, true]);
        assert!(faults.should_time_out());
        assert!(!faults.should_time_out());
        assert!(faults.should_time_out());
        assert_eq!(faults.remaining(), 0);
        assert!(!faults.should_time_out());
    }

    #[test]
    fn test_random_faults_disabled() {
        let faults = RandomFaults {
            timeout_probability: 0.0,
            simulate_latency: false,
        };
        assert_eq!(faults.latency(), Duration::ZERO);
        assert!((0..1000).all(|_| !faults.should_time_out()));
    }

    #[test]
    fn test_random_faults_certain() {
        let faults = RandomFaults {
            timeout_probability: 1.0,
            simulate_latency: false,
        };
        assert!(faults.should_time_out());
    }
}
