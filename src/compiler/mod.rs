//! Template compilation pipeline.
//!
//! Three passes: [`expr`] compiles embedded expression strings, [`parser`]
//! turns template markup into a directive-validated tree, and [`codegen`]
//! lowers that tree into a [`codegen::RenderProgram`] executed per render.

pub mod codegen;
pub mod expr;
pub mod parser;

pub use codegen::{RenderCtx, RenderProgram, compile_template};
