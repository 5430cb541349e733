//! Crate regarding unirig's artifact files.
//!
//! A measurement session produces three kinds of artifacts: raw resource
//! samples, normalized resource samples and benchmark records. Each
//! artifact is a JSONL file, one serialized record per line, written
//! through [`writer::ArtifactWriter`]. The record types here are the
//! interface between the rig that produces them and whatever reporting
//! layer consumes them; consumers never need to know how a record was
//! produced.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

pub mod json;
pub mod writer;
