//! `edb_core`: ptrace-based process control and static code analysis for a
//! BSD x86/x86-64 reverse-engineering tool.
//!
//! This crate is deliberately headless: it has no GUI, no disassembly
//! listing widget, no project file format. It is the part of the debugger
//! that talks to the kernel and to the debuggee's code, consumed by a host
//! application through [`process::ProcessController`] and
//! [`analyzer::Analyzer`].

pub mod address;
pub mod analyzer;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod process;

pub use address::{Address, Pid, Tid};
pub use error::{CoreError, Result};
