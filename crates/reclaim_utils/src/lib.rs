pub mod bench;
pub mod logger;
pub mod profiler;
pub mod timer;

pub use bench::{Benchmark, BenchmarkResult};
pub use logger::init_logging;
pub use profiler::{PhaseTiming, Profiler};
pub use timer::Stopwatch;
