//! # class-shroud
//!
//! Archive-to-archive obfuscator for JVM applications.
//!
//! ## Architecture
//!
//! - **archive**: Input archive reading and atomic output assembly
//! - **classfile**: Class file model, parser, frame analysis and writer
//! - **classpath**: Application and library classes addressable by internal name
//! - **hierarchy**: Superclass/interface graph with cycle and dependency checks
//! - **gate**: Include/exclude patterns deciding which classes passes touch
//! - **pass**: Pass contracts, rename map and the ordered pass registry
//! - **passes**: Built-in transformations (renaming, member hiding, shuffling, debug info removal)
//! - **scheduler**: Parallel per-class processing with tiered serialization fallback
//! - **packager**: Class encryption and generation of the bootstrap loader
//! - **manifest**: Main-Class lookup and rewriting
//! - **pipeline**: Run driver tying every stage together
//! - **scan**: Library archive discovery
//! - **config** / **cli**: Job configuration and command-line surface

pub mod archive;
pub mod classfile;
pub mod classpath;
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod hierarchy;
pub mod manifest;
pub mod packager;
pub mod pass;
pub mod passes;
pub mod pipeline;
pub mod scan;
pub mod scheduler;

pub use error::Error;
pub use pipeline::{Obfuscator, RunReport};
