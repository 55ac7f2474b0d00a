//! Run-level fuses and per-task budgets.
//!
//! Three outer fuses terminate the loop cleanly: wall clock, total LM
//! calls, and run iterations. Per-task LM budgets stop a single task from
//! draining the run's whole call allowance.

use std::collections::HashMap;
use std::time::Instant;

use crate::config::RuntimeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseTrip {
    /// MAX_PLAN_RUNTIME_SECONDS exceeded.
    Plan,
    /// max_llm_calls_per_run exceeded.
    LlmCalls,
    /// max_run_iterations exceeded.
    Iterations,
}

impl FuseTrip {
    pub fn scope(&self) -> &'static str {
        match self {
            FuseTrip::Plan => "PLAN",
            FuseTrip::LlmCalls => "LLM_CALLS",
            FuseTrip::Iterations => "ITERATIONS",
        }
    }
}

pub struct Guardrails {
    started: Instant,
    iterations: u64,
    llm_calls: u64,
    per_task_calls: HashMap<String, i64>,
    max_runtime_seconds: u64,
    max_llm_calls: u64,
    max_iterations: u64,
    max_calls_per_task: i64,
}

impl Guardrails {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            started: Instant::now(),
            iterations: 0,
            llm_calls: 0,
            per_task_calls: HashMap::new(),
            max_runtime_seconds: config.max_plan_runtime_seconds,
            max_llm_calls: config.guardrails.max_llm_calls_per_run,
            max_iterations: config.guardrails.max_run_iterations,
            max_calls_per_task: config.guardrails.max_llm_calls_per_task,
        }
    }

    /// Call once at the top of each tick. Returns the fuse that tripped,
    /// if any.
    pub fn begin_tick(&mut self) -> Option<FuseTrip> {
        self.iterations += 1;
        if self.started.elapsed().as_secs() > self.max_runtime_seconds {
            return Some(FuseTrip::Plan);
        }
        if self.iterations > self.max_iterations {
            return Some(FuseTrip::Iterations);
        }
        if self.llm_calls > self.max_llm_calls {
            return Some(FuseTrip::LlmCalls);
        }
        None
    }

    pub fn record_llm_call(&mut self) {
        self.llm_calls += 1;
    }

    pub fn llm_calls(&self) -> u64 {
        self.llm_calls
    }

    /// Consume one unit of a task's LM budget; false means the task has
    /// exhausted its per-run allowance.
    pub fn consume_task_budget(&mut self, task_id: &str) -> bool {
        let count = self.per_task_calls.entry(task_id.to_string()).or_insert(0);
        if *count >= self.max_calls_per_task {
            return false;
        }
        *count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(max_iterations: u64, max_calls: u64, per_task: i64) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.guardrails.max_run_iterations = max_iterations;
        config.guardrails.max_llm_calls_per_run = max_calls;
        config.guardrails.max_llm_calls_per_task = per_task;
        config
    }

    #[test]
    fn test_iteration_fuse() {
        let mut guardrails = Guardrails::new(&config_with(2, 100, 10));
        assert!(guardrails.begin_tick().is_none());
        assert!(guardrails.begin_tick().is_none());
        assert_eq!(guardrails.begin_tick(), Some(FuseTrip::Iterations));
    }

    #[test]
    fn test_llm_call_fuse() {
        let mut guardrails = Guardrails::new(&config_with(100, 2, 10));
        guardrails.record_llm_call();
        guardrails.record_llm_call();
        assert!(guardrails.begin_tick().is_none());
        guardrails.record_llm_call();
        assert_eq!(guardrails.begin_tick(), Some(FuseTrip::LlmCalls));
    }

    #[test]
    fn test_per_task_budget() {
        let mut guardrails = Guardrails::new(&config_with(100, 100, 2));
        assert!(guardrails.consume_task_budget("t1"));
        assert!(guardrails.consume_task_budget("t1"));
        assert!(!guardrails.consume_task_budget("t1"));
        // Other tasks have their own budget.
        assert!(guardrails.consume_task_budget("t2"));
    }
}
