//! Structured summaries of a search run.
//!
//! A [`SearchReport`] condenses a list of `(result, trace)` pairs
//! into the numbers a harness wants to archive: how many schedules
//! ran, how they ended, how long the traces got. It does not print
//! or persist anything itself; `to_json` produces a stable shape for
//! artifact storage.

use std::collections::BTreeMap;

use crate::error::ExecResult;
use crate::trace::Trace;

/// Summary of one search invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReport {
    /// Executions explored.
    pub executions: usize,
    /// Executions that ended with the initial thread's result.
    pub successes: usize,
    /// Count per failure kind, keyed by its display form.
    pub failures: BTreeMap<String, usize>,
    /// Length of the longest recorded trace.
    pub longest_trace: usize,
    /// Total steps across all recorded traces.
    pub total_steps: usize,
}

impl SearchReport {
    /// Builds a report from search output.
    #[must_use]
    pub fn from_results(results: &[(ExecResult, Trace)]) -> Self {
        let mut successes = 0;
        let mut failures: BTreeMap<String, usize> = BTreeMap::new();
        let mut longest_trace = 0;
        let mut total_steps = 0;
        for (result, trace) in results {
            match result {
                Ok(_) => successes += 1,
                Err(failure) => {
                    *failures.entry(failure.to_string()).or_insert(0) += 1;
                }
            }
            longest_trace = longest_trace.max(trace.len());
            total_steps += trace.len();
        }
        Self {
            executions: results.len(),
            successes,
            failures,
            longest_trace,
            total_steps,
        }
    }

    /// True when at least one execution failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Serialises the report for artifact storage.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "executions": self.executions,
            "successes": self.successes,
            "failures": self.failures,
            "trace": {
                "longest": self.longest_trace,
                "total_steps": self.total_steps,
            },
        })
    }
}
