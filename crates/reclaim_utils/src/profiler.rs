use std::time::{Duration, Instant};

/// Records named timing measurements for collector phases.
#[derive(Debug, Default, Clone)]
pub struct Profiler {
    phases: Vec<PhaseTiming>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_phase<F, T>(&mut self, name: &'static str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let output = f();
        self.phases.push(PhaseTiming {
            name,
            duration: start.elapsed(),
        });
        output
    }

    pub fn push_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push(PhaseTiming { name, duration });
    }

    pub fn phases(&self) -> &[PhaseTiming] {
        &self.phases
    }

    /// Sum of every recorded phase called `name`.
    pub fn total(&self, name: &str) -> Duration {
        self.phases
            .iter()
            .filter(|phase| phase.name == name)
            .map(|phase| phase.duration)
            .sum()
    }

    pub fn into_phases(self) -> Vec<PhaseTiming> {
        self.phases
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseTiming {
    pub name: &'static str,
    pub duration: Duration,
}
