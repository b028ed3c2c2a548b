//! Engine statistics: sampled per tick, never locked.

use std::time::{Duration, Instant};

use tracing::info;

/// Snapshot of system and iteration state for one engine tick.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    // System state.
    pub num_running: usize,
    pub num_swapped: usize,
    pub num_waiting: usize,
    /// Fraction of device blocks in use.
    pub gpu_cache_usage: f32,
    /// Fraction of host blocks in use.
    pub cpu_cache_usage: f32,
    pub gpu_prefix_cache_hit_rate: f32,

    // Iteration state.
    pub num_prompt_tokens_iter: usize,
    pub num_generation_tokens_iter: usize,
    pub num_preempted_iter: usize,
    pub time_to_first_tokens_iter: Vec<Duration>,
    pub time_per_output_tokens_iter: Vec<Duration>,

    // Finished-request state.
    pub time_e2e_requests: Vec<Duration>,
    pub num_finished_requests: usize,
}

/// Sink for per-tick stats snapshots.
pub trait StatLogger: Send {
    fn log(&mut self, stats: &Stats);
}

/// Logs a throughput summary through `tracing` at a fixed interval.
pub struct LoggingStatLogger {
    interval: Duration,
    last_log: Instant,
    prompt_tokens: usize,
    generation_tokens: usize,
    preemptions: usize,
}

const LOCAL_LOGGING_INTERVAL: Duration = Duration::from_secs(5);

impl Default for LoggingStatLogger {
    fn default() -> Self {
        Self::new(LOCAL_LOGGING_INTERVAL)
    }
}

impl LoggingStatLogger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_log: Instant::now(),
            prompt_tokens: 0,
            generation_tokens: 0,
            preemptions: 0,
        }
    }
}

impl StatLogger for LoggingStatLogger {
    fn log(&mut self, stats: &Stats) {
        self.prompt_tokens += stats.num_prompt_tokens_iter;
        self.generation_tokens += stats.num_generation_tokens_iter;
        self.preemptions += stats.num_preempted_iter;

        let elapsed = self.last_log.elapsed();
        if elapsed < self.interval {
            return;
        }
        let secs = elapsed.as_secs_f32();
        info!(
            prompt_tokens_per_s = self.prompt_tokens as f32 / secs,
            generation_tokens_per_s = self.generation_tokens as f32 / secs,
            running = stats.num_running,
            swapped = stats.num_swapped,
            waiting = stats.num_waiting,
            gpu_cache_usage = stats.gpu_cache_usage,
            cpu_cache_usage = stats.cpu_cache_usage,
            preemptions = self.preemptions,
            "engine throughput"
        );
        self.prompt_tokens = 0;
        self.generation_tokens = 0;
        self.preemptions = 0;
        self.last_log = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_logger_accumulates_between_intervals() {
        let mut logger = LoggingStatLogger::new(Duration::from_secs(3600));
        let stats = Stats {
            num_prompt_tokens_iter: 10,
            num_generation_tokens_iter: 3,
            ..Default::default()
        };
        logger.log(&stats);
        logger.log(&stats);
        assert_eq!(logger.prompt_tokens, 20);
        assert_eq!(logger.generation_tokens, 6);
    }
}
