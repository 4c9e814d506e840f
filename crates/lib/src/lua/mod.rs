//! The embedded rule interpreter.
//!
//! Build files are written in a restricted Lua dialect: plain values,
//! function calls, `function` definitions, and the callback surface the
//! engine registers. No module imports and no I/O; files reach the
//! interpreter only through `subinclude` and `include_defs`.

pub mod globals;
pub mod hooks;
pub mod runtime;
