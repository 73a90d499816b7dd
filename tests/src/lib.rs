// End-to-end scenarios for mqprobe
//
// The publisher and subscriber drivers run against the in-process mock
// broker under paused tokio time, so every latency below is exact.

pub mod test_harness;

pub use test_harness::{init_tracing, TestHarness, TestResult, FIXED_STAMP};
