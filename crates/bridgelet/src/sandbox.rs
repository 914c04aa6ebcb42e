//! Filesystem sandbox for worker commands.
//!
//! A module's declared worker command may not execute or operate outside the
//! allowed roots: the module's own directory plus any explicit project
//! allowlist. Bare executable names (no path separator) are resolved through
//! the environment's search path and are permitted; everything path-shaped
//! is cleaned, canonicalized, and checked against the roots.
//!
//! Validation runs once per call, before spawning, and is never cached -
//! manifests can change between calls.

use std::path::{Path, PathBuf};

use path_clean::PathClean;

use crate::error::BridgeError;
use crate::manifest::MethodSpec;

/// Process-wide immutable set of allowed filesystem roots.
///
/// Built once at startup. Each root is canonicalized so descendant checks
/// see through symlinked prefixes.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    roots: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .map(|root| std::fs::canonicalize(&root).unwrap_or_else(|_| root.clean()))
            .collect();
        Self { roots }
    }

    /// Validate one call's command and working directory against the policy.
    ///
    /// Returns the resolved program and working directory to spawn with.
    pub fn validate(
        &self,
        module_dir: &Path,
        spec: &MethodSpec,
    ) -> Result<ResolvedCommand, BridgeError> {
        let module_root = std::fs::canonicalize(module_dir)
            .map_err(|_| BridgeError::SandboxViolation(module_dir.to_path_buf()))?;

        // Manifest validation guarantees a non-empty command.
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| BridgeError::ManifestInvalid("worker.command is empty".to_string()))?;

        let program = if is_bare_name(program) {
            // Resolved via PATH by the OS; nothing to confine.
            PathBuf::from(program)
        } else {
            self.confine(&module_root, Path::new(program))?
        };

        let workdir = match &spec.cwd {
            Some(cwd) => self.confine(&module_root, Path::new(cwd))?,
            None => module_root,
        };

        Ok(ResolvedCommand {
            program,
            args: args.to_vec(),
            workdir,
        })
    }

    /// Resolve `candidate` against the module root and require the result to
    /// be a descendant of an allowed root. Symlinks are followed when the
    /// target exists, so a link pointing outside the sandbox is rejected.
    fn confine(&self, module_root: &Path, candidate: &Path) -> Result<PathBuf, BridgeError> {
        let joined = if candidate.is_absolute() {
            candidate.clean()
        } else {
            module_root.join(candidate).clean()
        };

        let resolved = std::fs::canonicalize(&joined).unwrap_or(joined);

        if resolved.starts_with(module_root)
            || self.roots.iter().any(|root| resolved.starts_with(root))
        {
            Ok(resolved)
        } else {
            Err(BridgeError::SandboxViolation(resolved))
        }
    }
}

/// Command program plus working directory, confined to the sandbox.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

fn is_bare_name(program: &str) -> bool {
    !program.contains('/') && !program.contains('\\')
}
