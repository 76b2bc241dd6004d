//! Planner: predicate classification, normalization, index selection and
//! plan construction.

mod builder;
mod classifier;
mod dnf;
mod keyspace;
mod sarg;

pub use builder::{build, build_with};
pub use classifier::classify_expr;
pub use dnf::{flatten_or, Dnf};
pub use keyspace::{copy_base_keyspaces, BaseKeyspace, Filter};
pub use sarg::{choose_scan, meta_id_expr, qualify};
