//! Core engine for driving multi-process network simulations.
//!
//! A suite of cases declares groups of nodes, the shell command each node
//! runs, and how later groups wire themselves to earlier ones (addresses or
//! parameters recovered from node logs). The engine:
//!
//! - resolves each node's concrete command from its group's connect strategy
//! - spawns the commands through a pluggable [`topo::Topology`] provider
//! - discovers runtime parameters by polling per-node log streams
//! - fires scheduled network faults against elapsed wall-clock time
//! - supervises short-lived processes to completion and tears down the rest
//! - aggregates failures into a batch-wide summary
//!
//! Topology emulation and log-format statistics live outside this crate; the
//! engine only consumes the [`topo::Topology`] and [`logs::LogReader`]
//! capabilities.

pub mod actions;
pub mod discovery;
pub mod failures;
pub mod logs;
pub mod parsers;
pub mod resolve;
pub mod runner;
pub mod spec;
pub mod supervisor;
pub mod topo;
