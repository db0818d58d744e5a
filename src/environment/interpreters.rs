//! Interpreter Resolution
//!
//! Paths of the interpreters that command templates refer to as `${python}`
//! and `${java}`.
//!
//! # Resolution Priority
//!
//! 1. Environment variable (`FLOWRUNNER_PYTHON`, `FLOWRUNNER_JAVA`)
//! 2. First matching executable found on `PATH`
//! 3. Bare command name, left to the shell to resolve

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use log::debug;
use once_cell::sync::Lazy;

/// Environment variable overriding the Python interpreter.
pub const PYTHON_ENV: &str = "FLOWRUNNER_PYTHON";

/// Environment variable overriding the Java virtual machine.
pub const JAVA_ENV: &str = "FLOWRUNNER_JAVA";

/// Lazily-resolved Python interpreter.
pub static PYTHON_INTERPRETER: Lazy<String> =
    Lazy::new(|| resolve(PYTHON_ENV, &["python3", "python"]));

/// Lazily-resolved Java virtual machine.
pub static JAVA_JVM: Lazy<String> = Lazy::new(|| resolve(JAVA_ENV, &["java"]));

fn resolve(var: &str, candidates: &[&str]) -> String {
    if let Ok(value) = env::var(var) {
        if !value.trim().is_empty() {
            debug!("Using {} from {}", value, var);
            return value;
        }
    }
    for candidate in candidates {
        if let Some(path) = find_in_path(candidate) {
            debug!("Resolved {} to {}", candidate, path.display());
            return path.to_string_lossy().to_string();
        }
    }
    candidates.first().map(|c| c.to_string()).unwrap_or_default()
}

/// Searches `PATH` for an executable file named `name`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

/// Path of the Python interpreter.
pub fn python_interpreter() -> String {
    PYTHON_INTERPRETER.clone()
}

/// Path of the Java virtual machine.
pub fn java_jvm() -> String {
    JAVA_JVM.clone()
}

/// Fixed template variables of the default worker.
pub fn default_variables() -> HashMap<String, String> {
    HashMap::from([
        ("python".to_string(), python_interpreter()),
        ("java".to_string(), java_jvm()),
    ])
}
