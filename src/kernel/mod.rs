pub mod exec;
pub mod graph;
pub mod op;
