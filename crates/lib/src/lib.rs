//! kiln-lib: the parse-and-schedule engine of the kiln build system.
//!
//! The engine turns a tree of declarative build files into a graph of build
//! targets and drives it to completion:
//! - `label`/`input`: the `//package:name` algebra and source classification
//! - `graph`/`package`/`target`: the label-addressed build graph, package
//!   records, and the target lifecycle state machine
//! - `lua`: the embedded rule interpreter and its callback surface
//! - `parse`: the cooperative scheduler, including the deferred-parse
//!   protocol around `subinclude`
//! - `build`: the build driver and the executor contract
//! - `cache`: the directory-rooted content-addressed artifact cache
//!
//! All state is carried by an explicit [`engine::Engine`] value; there are no
//! process-wide globals.

pub mod build;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod glob;
pub mod graph;
pub mod input;
pub mod label;
pub mod lua;
pub mod package;
pub mod parse;
pub mod target;
pub mod util;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use label::BuildLabel;
