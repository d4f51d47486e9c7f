//! Formal-check boundary of the equivalence verifier.
//!
//! The verifier encodes both graphs' output semantics as symbolic expressions
//! and asks a [`SolverOracle`] whether an input exists that makes the outputs
//! differ. The oracle is an external collaborator behind a stable
//! query/response contract and may be swapped for an SMT backend without
//! touching the rest of the design. The built-in [`AlgebraicOracle`]
//! canonicalizes both sides (associative flattening, commutative operand
//! sorting, unary-chain folding) and reports unsatisfiable when the normal
//! forms coincide; when they differ it cannot decide and reports a timeout.

use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::{
    kernel::{
        graph::KernelGraph,
        op::{BinaryOp, KernelOp, ReduceOp, UnaryOp},
    },
    shape::Shape,
    tensor::TensorId,
};

/// Symbolic value of one tensor, with inputs numbered by their insertion
/// order in the source graph.
#[derive(Debug, Clone, PartialEq)]
pub enum SymExpr {
    Input(usize),
    Unary(UnaryOp, Box<SymExpr>),
    Binary(BinaryOp, Box<SymExpr>, Box<SymExpr>),
    Matmul(Box<SymExpr>, Box<SymExpr>),
    Reduce(ReduceOp, usize, Box<SymExpr>),
    Reshape(Shape, Box<SymExpr>),
    Concat(usize, Box<SymExpr>, Box<SymExpr>),
}

/// "Does an input exist on which the two sides disagree?"
#[derive(Debug, Clone, PartialEq)]
pub struct EquivalenceQuery {
    pub lhs_outputs: Vec<SymExpr>,
    pub rhs_outputs: Vec<SymExpr>,
}

/// A concrete distinguishing input reported by a complete solver.
#[derive(Debug, Clone)]
pub struct Counterexample {
    pub inputs: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub enum SolverVerdict {
    /// No distinguishing input exists: the graphs are equivalent.
    Unsat,
    /// A distinguishing input exists.
    Sat(Counterexample),
    /// The solver gave up within the deadline.
    Timeout,
}

pub trait SolverOracle: Send + Sync {
    fn check_equivalence(&self, query: &EquivalenceQuery, timeout: Duration) -> SolverVerdict;
}

/// Build the symbolic output expressions of a graph.
pub fn encode_graph(graph: &KernelGraph) -> Vec<SymExpr> {
    let mut exprs: rustc_hash::FxHashMap<TensorId, SymExpr> = rustc_hash::FxHashMap::default();
    for node in graph.toposort() {
        let weight = &graph.graph[node];
        let id = TensorId::new(node, 0);
        let expr = match &weight.op {
            KernelOp::Input => SymExpr::Input(
                graph
                    .inputs
                    .iter()
                    .position(|i| *i == id)
                    .expect("input node not registered"),
            ),
            KernelOp::Matmul => SymExpr::Matmul(
                Box::new(exprs[&weight.inputs[0]].clone()),
                Box::new(exprs[&weight.inputs[1]].clone()),
            ),
            KernelOp::ElementUnary(chain) => {
                chain.iter().fold(exprs[&weight.inputs[0]].clone(), |acc, u| {
                    SymExpr::Unary(*u, Box::new(acc))
                })
            }
            KernelOp::ElementBinary(op) => SymExpr::Binary(
                *op,
                Box::new(exprs[&weight.inputs[0]].clone()),
                Box::new(exprs[&weight.inputs[1]].clone()),
            ),
            KernelOp::Reduction(op, axis) => {
                SymExpr::Reduce(*op, *axis, Box::new(exprs[&weight.inputs[0]].clone()))
            }
            KernelOp::Reshape(shape) => {
                SymExpr::Reshape(shape.clone(), Box::new(exprs[&weight.inputs[0]].clone()))
            }
            KernelOp::Concat(axis) => SymExpr::Concat(
                *axis,
                Box::new(exprs[&weight.inputs[0]].clone()),
                Box::new(exprs[&weight.inputs[1]].clone()),
            ),
        };
        exprs.insert(id, expr);
    }
    graph.outputs.iter().map(|id| exprs[id].clone()).collect()
}

/// Incomplete algebraic oracle. Sound for `Unsat` (equal normal forms really
/// are equivalent), conservative otherwise.
#[derive(Debug, Default, Clone)]
pub struct AlgebraicOracle;

impl AlgebraicOracle {
    fn canonicalize(expr: &SymExpr, start: Instant, timeout: Duration) -> Option<SymExpr> {
        if start.elapsed() > timeout {
            return None;
        }
        Some(match expr {
            SymExpr::Input(i) => SymExpr::Input(*i),
            SymExpr::Unary(u, inner) => {
                SymExpr::Unary(*u, Box::new(Self::canonicalize(inner, start, timeout)?))
            }
            SymExpr::Binary(op, lhs, rhs) if op.is_commutative() => {
                // Flatten the same-operator tree into an operand list, sort it
                // by a stable structural key, rebuild left-associated.
                let mut operands = vec![];
                Self::flatten(*op, lhs, &mut operands);
                Self::flatten(*op, rhs, &mut operands);
                let operands = operands
                    .iter()
                    .map(|o| Self::canonicalize(o, start, timeout))
                    .collect::<Option<Vec<_>>>()?;
                operands
                    .into_iter()
                    .sorted_by_key(|o| format!("{o:?}"))
                    .reduce(|a, b| SymExpr::Binary(*op, Box::new(a), Box::new(b)))
                    .unwrap()
            }
            SymExpr::Binary(op, lhs, rhs) => SymExpr::Binary(
                *op,
                Box::new(Self::canonicalize(lhs, start, timeout)?),
                Box::new(Self::canonicalize(rhs, start, timeout)?),
            ),
            SymExpr::Matmul(lhs, rhs) => SymExpr::Matmul(
                Box::new(Self::canonicalize(lhs, start, timeout)?),
                Box::new(Self::canonicalize(rhs, start, timeout)?),
            ),
            SymExpr::Reduce(op, axis, inner) => SymExpr::Reduce(
                *op,
                *axis,
                Box::new(Self::canonicalize(inner, start, timeout)?),
            ),
            SymExpr::Reshape(shape, inner) => SymExpr::Reshape(
                shape.clone(),
                Box::new(Self::canonicalize(inner, start, timeout)?),
            ),
            SymExpr::Concat(axis, lhs, rhs) => SymExpr::Concat(
                *axis,
                Box::new(Self::canonicalize(lhs, start, timeout)?),
                Box::new(Self::canonicalize(rhs, start, timeout)?),
            ),
        })
    }

    fn flatten<'a>(op: BinaryOp, expr: &'a SymExpr, out: &mut Vec<&'a SymExpr>) {
        match expr {
            SymExpr::Binary(inner_op, lhs, rhs) if *inner_op == op => {
                Self::flatten(op, lhs, out);
                Self::flatten(op, rhs, out);
            }
            other => out.push(other),
        }
    }
}

impl SolverOracle for AlgebraicOracle {
    fn check_equivalence(&self, query: &EquivalenceQuery, timeout: Duration) -> SolverVerdict {
        if query.lhs_outputs.len() != query.rhs_outputs.len() {
            return SolverVerdict::Sat(Counterexample { inputs: vec![] });
        }
        let start = Instant::now();
        for (l, r) in query.lhs_outputs.iter().zip(&query.rhs_outputs) {
            let (Some(lc), Some(rc)) = (
                Self::canonicalize(l, start, timeout),
                Self::canonicalize(r, start, timeout),
            ) else {
                return SolverVerdict::Timeout;
            };
            if lc != rc {
                // Unequal normal forms are inconclusive for an incomplete
                // oracle; a complete SMT backend would return Sat here.
                return SolverVerdict::Timeout;
            }
        }
        SolverVerdict::Unsat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DType;

    fn check(g1: &KernelGraph, g2: &KernelGraph) -> SolverVerdict {
        let query = EquivalenceQuery {
            lhs_outputs: encode_graph(g1),
            rhs_outputs: encode_graph(g2),
        };
        AlgebraicOracle.check_equivalence(&query, Duration::from_secs(1))
    }

    #[test]
    fn test_commutative_normal_forms() {
        let mut g1 = KernelGraph::new();
        let a = g1.input([4], DType::F32).unwrap();
        let b = g1.input([4], DType::F32).unwrap();
        let c = g1.input([4], DType::F32).unwrap();
        let ab = g1.add(&a, &b).unwrap();
        let abc = g1.add(&ab, &c).unwrap();
        g1.mark_output(&abc).unwrap();

        let mut g2 = KernelGraph::new();
        let a2 = g2.input([4], DType::F32).unwrap();
        let b2 = g2.input([4], DType::F32).unwrap();
        let c2 = g2.input([4], DType::F32).unwrap();
        let cb = g2.add(&c2, &b2).unwrap();
        let cba = g2.add(&cb, &a2).unwrap();
        g2.mark_output(&cba).unwrap();

        assert!(matches!(check(&g1, &g2), SolverVerdict::Unsat));
    }

    #[test]
    fn test_different_ops_are_inconclusive() {
        let mut g1 = KernelGraph::new();
        let a = g1.input([4], DType::F32).unwrap();
        let e = g1.exp(&a).unwrap();
        g1.mark_output(&e).unwrap();

        let mut g2 = KernelGraph::new();
        let a2 = g2.input([4], DType::F32).unwrap();
        let s = g2.sqrt(&a2).unwrap();
        g2.mark_output(&s).unwrap();

        assert!(matches!(check(&g1, &g2), SolverVerdict::Timeout));
    }
}
