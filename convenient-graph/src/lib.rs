//! Graph primitives for build execution plans.
//!
//! This crate provides the graph machinery the execution engine is built on:
//! - [`DAG`]: a deterministic directed acyclic graph whose edge insertion
//!   rejects cycles and whose topological order is stable across runs
//! - [`walk_acyclic`]: an iterative three-colour depth-first walk that either
//!   orders the reachable nodes or reports the node at which a cycle closed
//! - [`find_cycles`]: strongly-connected-component search used to extract the
//!   full cycle once one is known to exist
//! - [`GraphRenderer`]: renders a node and its successors as an indented tree
//!
//! # Example
//!
//! ```
//! use convenient_graph::{DAG, WalkOutcome, walk_acyclic};
//!
//! let mut dag = DAG::<&str, ()>::new();
//! let compile = dag.add_node("compile");
//! let jar = dag.add_node("jar");
//! dag.add_edge(compile, jar, ()).unwrap(); // compile before jar
//! assert_eq!(dag.topological_sort().unwrap(), vec![compile, jar]);
//!
//! // a -> b -> a
//! let outcome = walk_acyclic(["a"], |n| match n {
//!     "a" => vec!["b"],
//!     _ => vec!["a"],
//! });
//! assert_eq!(outcome, WalkOutcome::Cycle("a"));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

mod dag;
mod render;
mod walk;

pub use dag::{DAG, GraphError, GraphResult, NodeId};
pub use render::GraphRenderer;
pub use walk::{WalkOutcome, find_cycles, walk_acyclic};
