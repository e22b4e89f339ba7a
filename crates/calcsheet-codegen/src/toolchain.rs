//! C++ toolchain discovery and invocation.
//!
//! Finds a usable compiler (`CALCSHEET_CXX`/`CXX` environment override,
//! then PATH lookup), drives it to produce a shared library, and parses
//! its stderr into [`Diagnostic`]s attributed back to worksheet elements
//! through the emitter's line map.

use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use calcsheet_core::diag::{Diagnostic, DiagnosticCode, Severity};
use calcsheet_core::document::ElementId;

use crate::errors::{CodegenError, Result};

/// Compiler names tried, in order, when no override is set.
const CANDIDATES: [&str; 3] = ["c++", "clang++", "g++"];

/// Outcome of a compile: success flag plus whatever diagnostics the
/// compiler produced (warnings on success, errors and warnings on
/// failure).
pub struct CompileOutcome {
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// A discovered C++ compiler.
#[derive(Clone, Debug)]
pub struct Toolchain {
    cxx: PathBuf,
}

impl Toolchain {
    /// Locate a compiler.
    ///
    /// `CALCSHEET_CXX` wins, then `CXX`, then the first of `c++`,
    /// `clang++`, `g++` found on PATH.
    pub fn discover() -> Result<Self> {
        for var in ["CALCSHEET_CXX", "CXX"] {
            if let Ok(value) = std::env::var(var) {
                if value.is_empty() {
                    continue;
                }
                let path = PathBuf::from(&value);
                if path.is_file() {
                    log::info!("Using C++ compiler from {}: {}", var, path.display());
                    return Ok(Self { cxx: path });
                }
                if let Ok(found) = which::which(&value) {
                    log::info!("Using C++ compiler from {}: {}", var, found.display());
                    return Ok(Self { cxx: found });
                }
                log::warn!("{} is set to '{}' but no such compiler exists", var, value);
            }
        }
        for candidate in CANDIDATES {
            if let Ok(found) = which::which(candidate) {
                log::info!("Found C++ compiler: {}", found.display());
                return Ok(Self { cxx: found });
            }
        }
        Err(CodegenError::NoCompiler)
    }

    /// Use a specific compiler binary.
    pub fn with_compiler(cxx: PathBuf) -> Self {
        Self { cxx }
    }

    /// Path of the compiler binary.
    pub fn compiler(&self) -> &Path {
        &self.cxx
    }

    /// Compile `source` into the shared library `output`.
    ///
    /// Returns the compiler's diagnostics; `success` reflects the exit
    /// status. Spawning failures (missing binary, broken install) are
    /// hard errors.
    pub fn compile(
        &self,
        source: &Path,
        output: &Path,
        debug: bool,
        line_map: &[(usize, ElementId)],
    ) -> Result<CompileOutcome> {
        let mut command = Command::new(&self.cxx);
        command.arg("-std=c++17").arg("-shared");
        if !cfg!(windows) {
            command.arg("-fPIC");
        }
        if debug {
            command.args(["-g", "-O0"]);
        } else {
            command.arg("-O2");
        }
        command.arg("-o").arg(output).arg(source);

        log::debug!("Compiling: {:?}", command);
        let result = command.output().map_err(|source| CodegenError::Spawn {
            compiler: self.cxx.display().to_string(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&result.stderr);
        let diagnostics = parse_diagnostics(&stderr, line_map);
        let success = result.status.success();
        if success {
            log::info!("Compiled {} -> {}", source.display(), output.display());
        } else {
            log::warn!(
                "Compilation of {} failed with {} diagnostic(s)",
                source.display(),
                diagnostics.len()
            );
        }
        Ok(CompileOutcome {
            success,
            diagnostics,
        })
    }
}

/// Parse gcc/clang-style `file:line:col: severity: message` output.
pub fn parse_diagnostics(stderr: &str, line_map: &[(usize, ElementId)]) -> Vec<Diagnostic> {
    let pattern = Regex::new(r"(?m)^([^:\n]+):(\d+):(?:(\d+):)?\s*(error|warning):\s*(.+)$")
        .expect("diagnostic pattern is valid");
    pattern
        .captures_iter(stderr)
        .map(|caps| {
            let line: usize = caps[2].parse().unwrap_or(0);
            let severity = if &caps[4] == "error" {
                Severity::Error
            } else {
                Severity::Warning
            };
            Diagnostic {
                severity,
                code: DiagnosticCode::ToolchainFailure,
                message: caps[5].trim().to_string(),
                element: element_for_line(line, line_map),
            }
        })
        .collect()
}

/// The element whose emitted section contains `line`.
fn element_for_line(line: usize, line_map: &[(usize, ElementId)]) -> Option<ElementId> {
    let mut found = None;
    for (start, element) in line_map {
        if *start <= line {
            found = Some(*element);
        } else {
            break;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gcc_style_diagnostics() {
        let stderr = "\
model.cpp:12:9: warning: unused variable 'tmp' [-Wunused-variable]
model.cpp:40:5: error: expected ';' before 'return'
ld: some unrelated noise
";
        let line_map = vec![(10, ElementId(1)), (35, ElementId(2))];
        let diagnostics = parse_diagnostics(stderr, &line_map);
        assert_eq!(diagnostics.len(), 2);

        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert_eq!(diagnostics[0].element, Some(ElementId(1)));
        assert!(diagnostics[0].message.contains("unused variable"));

        assert_eq!(diagnostics[1].severity, Severity::Error);
        assert_eq!(diagnostics[1].element, Some(ElementId(2)));
    }

    #[test]
    fn test_line_before_any_element_has_no_attribution() {
        let line_map = vec![(20, ElementId(1))];
        let diagnostics =
            parse_diagnostics("model.cpp:3:1: error: bad include\n", &line_map);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].element, None);
    }

    #[test]
    fn test_env_override_wins() {
        // Any existing file works; the toolchain does not validate it.
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var("CALCSHEET_CXX", file.path());
        let toolchain = Toolchain::discover().unwrap();
        assert_eq!(toolchain.compiler(), file.path());
        std::env::remove_var("CALCSHEET_CXX");
    }
}
