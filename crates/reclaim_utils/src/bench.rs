use std::fmt;
use std::time::{Duration, Instant};

/// Repeats a measured operation and summarises the samples.
///
/// Every iteration gets a fresh input from `setup`, which is not timed. The
/// collector benchmarks need this because a collection consumes its garbage.
pub struct Benchmark {
    name: String,
    iterations: usize,
    warmup: usize,
}

impl Benchmark {
    pub fn new(name: impl Into<String>, iterations: usize) -> Self {
        let iterations = iterations.max(1);
        Self {
            name: name.into(),
            iterations,
            warmup: (iterations / 10).min(10),
        }
    }

    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn run<S, I, F, T>(&self, mut setup: S, mut f: F) -> BenchmarkResult
    where
        S: FnMut() -> I,
        F: FnMut(I) -> T,
    {
        for _ in 0..self.warmup {
            let _ = f(setup());
        }

        let mut samples = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let input = setup();
            let start = Instant::now();
            let _ = f(input);
            samples.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            samples,
        }
    }
}

/// Result of a benchmark run
#[derive(Clone, Debug)]
pub struct BenchmarkResult {
    pub name: String,
    pub samples: Vec<Duration>,
}

impl BenchmarkResult {
    pub fn iterations(&self) -> usize {
        self.samples.len()
    }

    pub fn mean(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn median(&self) -> Duration {
        let mut sorted = self.samples.clone();
        sorted.sort();
        sorted.get(sorted.len() / 2).copied().unwrap_or_default()
    }

    pub fn min(&self) -> Duration {
        self.samples.iter().min().copied().unwrap_or_default()
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or_default()
    }

    pub fn std_dev(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mean = self.mean().as_secs_f64();
        let variance = self
            .samples
            .iter()
            .map(|sample| {
                let diff = sample.as_secs_f64() - mean;
                diff * diff
            })
            .sum::<f64>()
            / self.samples.len() as f64;
        Duration::from_secs_f64(variance.sqrt())
    }

    /// Items per second, given `items` processed per iteration.
    pub fn throughput(&self, items: usize) -> f64 {
        let mean = self.mean().as_secs_f64();
        if mean == 0.0 { 0.0 } else { items as f64 / mean }
    }
}

impl fmt::Display for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Benchmark: {}", self.name)?;
        writeln!(f, "  Iterations: {}", self.iterations())?;
        writeln!(f, "  Mean:       {:?}", self.mean())?;
        writeln!(f, "  Median:     {:?}", self.median())?;
        writeln!(f, "  Min:        {:?}", self.min())?;
        writeln!(f, "  Max:        {:?}", self.max())?;
        writeln!(f, "  Std Dev:    {:?}", self.std_dev())?;
        Ok(())
    }
}
