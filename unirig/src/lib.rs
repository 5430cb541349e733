//! The unirig workload comparison rig.
//!
//! Unirig measures the same workload under two execution environments --
//! a conventional process or container, and a lightweight virtualized
//! unikernel behind a launcher -- and emits comparable artifacts: a
//! resource time series per monitored target and a structured benchmark
//! record set per load sweep. This library supports the unirig binary
//! found elsewhere in this project.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod aggregate;
pub mod bench;
mod common;
pub mod config;
pub mod counters;
pub mod normalize;
pub mod observer;
pub mod resolver;
pub mod target;

pub use common::{Behavior, Output};
