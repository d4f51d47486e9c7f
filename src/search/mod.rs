//! Budgeted search over semantically-equivalent rewritings of a kernel graph.

pub mod cost;
pub mod rewrite;

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use colored::Colorize;

use crate::{
    config::Config,
    error::SearchExhausted,
    kernel::graph::KernelGraph,
    search::cost::CostModel,
    verify::{solver::SolverOracle, Verification, Verifier},
};

/// Limits on one search run: whichever of the two is exhausted first ends it.
#[derive(Debug, Clone, Copy)]
pub struct SearchBudget {
    pub max_candidates: usize,
    pub time_limit: Duration,
}

impl Default for SearchBudget {
    fn default() -> Self {
        Self {
            max_candidates: 512,
            time_limit: Duration::from_secs(10),
        }
    }
}

/// The selected graph plus bookkeeping about how it was found.
#[derive(Debug)]
pub struct SearchResult {
    pub graph: KernelGraph,
    pub cost: f64,
    pub candidates_explored: usize,
    pub candidates_accepted: usize,
    /// Set when an `Unknown` verification verdict was accepted under bypass
    /// mode; propagated into the compiled artifact's metadata.
    pub degraded_confidence: bool,
}

/// Drives propose -> score -> verify over a frozen copy of the input graph.
///
/// The configuration is snapshotted at construction, so mutating the caller's
/// `Config` during an active search cannot change its behavior. The original
/// graph is never mutated; every candidate is built on a copy, so abandoned
/// branches need no cleanup.
pub struct SearchEngine<'a> {
    config: Config,
    oracle: &'a dyn SolverOracle,
    pub cost_model: CostModel,
    pub verbose: bool,
}

impl<'a> SearchEngine<'a> {
    pub fn new(config: &Config, oracle: &'a dyn SolverOracle) -> Self {
        Self {
            config: *config,
            oracle,
            cost_model: CostModel::default(),
            verbose: false,
        }
    }

    /// Explore rewrites of `graph` within `budget` and return the cheapest
    /// verified-equivalent graph found. Candidates are scored by the static
    /// cost model before verification is attempted, so the expensive solver
    /// is only spent on promising candidates. Ties never displace the current
    /// best (strict improvement), which keeps the outcome deterministic for a
    /// fixed graph and budget.
    pub fn search(
        &self,
        graph: &KernelGraph,
        budget: SearchBudget,
    ) -> Result<SearchResult, SearchExhausted> {
        let mut original = graph.clone();
        original.freeze();
        let verifier = Verifier::new(self.oracle);

        let mut best = original.clone();
        let mut best_cost = self.cost_model.cost(&best);
        let mut explored = 0usize;
        let mut accepted = 0usize;
        let mut degraded = false;
        let start = Instant::now();

        let mut frontier: VecDeque<KernelGraph> = VecDeque::new();
        frontier.push_back(original.clone());

        'search: while let Some(current) = frontier.pop_front() {
            for rw in rewrite::enumerate(&current) {
                if explored >= budget.max_candidates || start.elapsed() > budget.time_limit {
                    break 'search;
                }
                explored += 1;
                let Ok(candidate) = rewrite::apply(&current, &rw) else {
                    continue;
                };
                let candidate_cost = self.cost_model.cost(&candidate);
                // Cost gate before correctness gate.
                if candidate_cost >= best_cost {
                    continue;
                }
                match verifier.verify(&original, &candidate) {
                    Verification::Equivalent => {}
                    Verification::Unknown if self.config.bypass_compile_errors => {
                        degraded = true;
                        if self.verbose {
                            println!(
                                "{} accepting unverified candidate under bypass",
                                "warning:".bold().yellow()
                            );
                        }
                    }
                    Verification::NotEquivalent | Verification::Unknown => continue,
                }
                if self.verbose {
                    println!(
                        "{} {:?} ({best_cost:.0} -> {candidate_cost:.0})",
                        "accepted".bold().bright_green(),
                        rw
                    );
                }
                best = candidate.clone();
                best_cost = candidate_cost;
                accepted += 1;
                frontier.push_back(candidate);
            }
        }

        if accepted == 0 {
            return Err(SearchExhausted {
                best,
                candidates_explored: explored,
            });
        }
        Ok(SearchResult {
            graph: best,
            cost: best_cost,
            candidates_explored: explored,
            candidates_accepted: accepted,
            degraded_confidence: degraded,
        })
    }
}
