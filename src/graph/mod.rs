pub mod task_graph;

pub use task_graph::{TaskGraph, TaskKind};
