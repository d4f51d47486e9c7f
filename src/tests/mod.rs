use std::sync::Arc;
use std::time::Duration;

use crate::prelude::*;
use crate::verify::solver::{EquivalenceQuery, SolverOracle, SolverVerdict};
use crate::{codegen, dataset};

/// Documented comparison tolerance: 1e-3 relative, 1e-5 absolute.
pub fn assert_close(a_vec: &[f32], b_vec: &[f32]) {
    assert_eq!(a_vec.len(), b_vec.len(), "output lengths differ");
    for (a, b) in a_vec.iter().zip(b_vec.iter()) {
        if (a - b).abs() > 1e-5 && (a - b).abs() / b.abs().max(1e-5) > 1e-3 {
            panic!("{a} is not close to {b}");
        }
    }
}

/// Oracle that never concludes, standing in for a solver that always times
/// out. Used to exercise the `Unknown` path.
struct TimeoutOracle;

impl SolverOracle for TimeoutOracle {
    fn check_equivalence(&self, _: &EquivalenceQuery, _: Duration) -> SolverVerdict {
        SolverVerdict::Timeout
    }
}

fn fusable_pipeline() -> KernelGraph {
    let mut g = KernelGraph::new();
    let x = g.input([64, 128], DType::F32).unwrap();
    let w = g.input([128, 64], DType::F32).unwrap();
    let h = g.matmul(&x, &w).unwrap();
    let h = g.mul_scalar(&h, 0.125).unwrap();
    let h = g.gelu(&h).unwrap();
    let h = g.relu(&h).unwrap();
    g.mark_output(&h).unwrap();
    g
}

#[test]
fn test_matmul_scenario() {
    // (128x256)(256x64) compiles to a kernel with output shape (128x64).
    let mut g = KernelGraph::new();
    let a = g.input([128, 256], DType::F32).unwrap();
    let b = g.input([256, 64], DType::F32).unwrap();
    let c = g.matmul(&a, &b).unwrap();
    assert_eq!(c.shape, Shape::from([128, 64]));
    g.mark_output(&c).unwrap();
    let kernel = compile(&g, &Config::default()).unwrap();
    assert_eq!(kernel.graph().output_descs()[0].shape, Shape::from([128, 64]));

    // A (128x255) left operand fails construction, not compilation.
    let mut bad = KernelGraph::new();
    let a = bad.input([128, 255], DType::F32).unwrap();
    let b = bad.input([256, 64], DType::F32).unwrap();
    assert!(matches!(
        bad.matmul(&a, &b),
        Err(GraphError::ShapeMismatch(_))
    ));
}

#[test]
fn test_reordered_elementwise_verifies_equivalent() {
    // Two graphs differing only by the order of two independent elementwise
    // operators.
    let mut g1 = KernelGraph::new();
    let a = g1.input([16, 16], DType::F32).unwrap();
    let b = g1.input([16, 16], DType::F32).unwrap();
    let ea = g1.exp(&a).unwrap();
    let rb = g1.relu(&b).unwrap();
    let out = g1.add(&ea, &rb).unwrap();
    g1.mark_output(&out).unwrap();

    let mut g2 = KernelGraph::new();
    let a = g2.input([16, 16], DType::F32).unwrap();
    let b = g2.input([16, 16], DType::F32).unwrap();
    let rb = g2.relu(&b).unwrap();
    let ea = g2.exp(&a).unwrap();
    let out = g2.add(&rb, &ea).unwrap();
    g2.mark_output(&out).unwrap();

    let oracle = AlgebraicOracle;
    let verifier = Verifier::new(&oracle);
    assert_eq!(verifier.verify(&g1, &g2), Verification::Equivalent);
}

#[test]
fn test_equivalent_graphs_match_on_concrete_inputs() {
    let g = fusable_pipeline();
    let oracle = AlgebraicOracle;
    let engine = SearchEngine::new(&Config::default(), &oracle);
    let result = engine.search(&g, SearchBudget::default()).unwrap();

    let oracle = AlgebraicOracle;
    let verifier = Verifier::new(&oracle);
    assert_eq!(verifier.verify(&g, &result.graph), Verification::Equivalent);

    let x: Vec<f32> = (0..64 * 128).map(|i| (i % 7) as f32 * 0.1 - 0.3).collect();
    let w: Vec<f32> = (0..128 * 64).map(|i| (i % 5) as f32 * 0.01).collect();
    let expected = g.execute(&[x.clone(), w.clone()]).unwrap();
    let got = result.graph.execute(&[x, w]).unwrap();
    assert_close(&got[0], &expected[0]);
}

#[test]
fn test_end_to_end_search_compile_run() {
    let g = fusable_pipeline();
    let config = Config::default();
    let oracle = AlgebraicOracle;
    let engine = SearchEngine::new(&config, &oracle);
    let result = engine.search(&g, SearchBudget::default()).unwrap();
    assert!(result.graph.launch_count() < g.launch_count());

    let kernel = compile_result(&result, &config).unwrap();
    assert!(!kernel.degraded_confidence);
    let runtime = HostRuntime::new();
    let x = vec![0.1f32; 64 * 128];
    let w = vec![0.2f32; 128 * 64];
    let expected = g.execute(&[x.clone(), w.clone()]).unwrap();
    let got = runtime
        .launch(&kernel, &[Tensor::new(x), Tensor::new(w)])
        .unwrap();
    assert_close(got[0].downcast_ref::<Vec<f32>>().unwrap(), &expected[0]);
}

#[test]
fn test_unknown_rejected_without_bypass() {
    // With bypass off, a graph that fails formal verification never reaches
    // the compiler: search keeps the original.
    let g = fusable_pipeline();
    let oracle = TimeoutOracle;
    let engine = SearchEngine::new(&Config::default(), &oracle);
    let err = engine.search(&g, SearchBudget::default()).unwrap_err();
    assert_eq!(err.best.launch_count(), g.launch_count());
}

#[test]
fn test_unknown_accepted_with_bypass_marks_degraded() {
    let g = fusable_pipeline();
    let mut config = Config::default();
    config.bypass_compile_errors(true);
    let oracle = TimeoutOracle;
    let engine = SearchEngine::new(&config, &oracle);
    let result = engine.search(&g, SearchBudget::default()).unwrap();
    assert!(result.degraded_confidence);

    let kernel = compile_result(&result, &config).unwrap();
    assert!(kernel.degraded_confidence);
}

#[test]
fn test_config_snapshot_at_search_start() {
    let g = fusable_pipeline();
    let mut config = Config::default();
    let oracle = TimeoutOracle;
    let engine = SearchEngine::new(&config, &oracle);
    // Flipping the flag after engine construction must not affect the search.
    config.bypass_compile_errors(true);
    assert!(engine.search(&g, SearchBudget::default()).is_err());
}

#[test]
fn test_dataset_graphs_search_and_compile() {
    let config = Config::default();
    for name in dataset::DATASET_NAMES {
        let g = dataset::lookup(name).unwrap();
        let oracle = AlgebraicOracle;
        let engine = SearchEngine::new(&config, &oracle);
        let budget = SearchBudget {
            max_candidates: 32,
            time_limit: Duration::from_secs(30),
        };
        let best = match engine.search(&g, budget) {
            Ok(result) => result.graph,
            Err(exhausted) => exhausted.best,
        };
        let kernel = codegen::compile(&best, &config).unwrap();
        assert_eq!(kernel.launches.len(), best.launch_count());
    }
}

#[test]
fn test_persistent_kernel_from_search() {
    let g = fusable_pipeline();
    let config = Config::default();
    let oracle = AlgebraicOracle;
    let engine = SearchEngine::new(&config, &oracle);
    let result = engine.search(&g, SearchBudget::default()).unwrap();

    let runtime = Arc::new(HostRuntime::new());
    let pk = compile_persistent_result(&result, &config, runtime.clone()).unwrap();
    let x = Tensor::new(vec![0.1f32; 64 * 128]);
    let w = Tensor::new(vec![0.2f32; 128 * 64]);
    let first = pk.run(&[x.clone(), w.clone()]).unwrap();
    let second = pk.run(&[x, w]).unwrap();
    assert_eq!(
        first[0].downcast_ref::<Vec<f32>>().unwrap(),
        second[0].downcast_ref::<Vec<f32>>().unwrap()
    );
    pk.release();
    assert!(pk.is_released());
    assert_eq!(runtime.outstanding_allocations(), 0);
}

#[test]
fn test_search_is_parallel_safe_across_threads() {
    // Independent searches share only read-only access to the original graph.
    let g = Arc::new(fusable_pipeline());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let g = g.clone();
            std::thread::spawn(move || {
                let oracle = AlgebraicOracle;
                let engine = SearchEngine::new(&Config::default(), &oracle);
                let result = engine.search(&g, SearchBudget::default()).unwrap();
                (result.cost, result.graph.launch_count())
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
}

mod search_dataset {
    use super::*;

    #[test]
    fn test_exhausted_search_still_returns_runnable_graph() {
        let g = dataset::lookup("lora").unwrap();
        let oracle = AlgebraicOracle;
        let engine = SearchEngine::new(&Config::default(), &oracle);
        let budget = SearchBudget {
            max_candidates: 16,
            time_limit: Duration::from_secs(30),
        };
        if let Err(exhausted) = engine.search(&g, budget) {
            assert!(exhausted.best.is_acyclic());
            assert_eq!(exhausted.best.launch_count(), g.launch_count());
        }
    }

    #[test]
    fn test_search_never_accepts_semantic_change() {
        // Sanity net: whatever search accepts must fingerprint like the
        // original on fresh samples.
        let g = super::fusable_pipeline();
        let oracle = AlgebraicOracle;
        let engine = SearchEngine::new(&Config::default(), &oracle);
        let result = engine.search(&g, SearchBudget::default()).unwrap();
        for trial in 10..14 {
            let feeds = crate::verify::fingerprint::sample_inputs(&g, 99, trial);
            assert_eq!(g.fingerprint(&feeds), result.graph.fingerprint(&feeds));
        }
    }
}
