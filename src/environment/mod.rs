//! Environment Module
//!
//! Resolves interpreter paths that operators expose to command templates
//! as fixed worker variables.

pub mod interpreters;

pub use interpreters::{default_variables, java_jvm, python_interpreter, JAVA_JVM, PYTHON_INTERPRETER};
