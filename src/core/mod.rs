//! Core engine: types, values, parsing, graph, diff, planning, execution, state.

pub mod diff;
pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod schema;
pub mod state;
pub mod types;
pub mod value;
