use std::time::{Duration, Instant};

/// Wall-clock stopwatch with an optional soft deadline.
///
/// The incremental purge polls [`Stopwatch::exceeded`] every few objects
/// rather than after each one, so the deadline is soft by construction.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
    limit: Option<Duration>,
}

impl Stopwatch {
    pub fn start_new() -> Self {
        Self {
            start: Instant::now(),
            limit: None,
        }
    }

    pub fn with_limit(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit: Some(limit),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// True once the configured limit has passed. Always false without a limit.
    pub fn exceeded(&self) -> bool {
        self.limit.is_some_and(|limit| self.start.elapsed() > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_exceeds() {
        let watch = Stopwatch::start_new();
        std::thread::sleep(Duration::from_millis(1));
        assert!(!watch.exceeded());
        assert!(watch.elapsed() >= Duration::from_millis(1));
    }

    #[test]
    fn test_zero_limit_exceeds() {
        let watch = Stopwatch::with_limit(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(1));
        assert!(watch.exceeded());
    }
}
