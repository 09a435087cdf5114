//! Resolved run settings.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Where the finished archive goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    File(PathBuf),
    Stdout,
}

impl OutputTarget {
    /// An absent or empty path means stdout.
    pub fn from_arg(path: Option<PathBuf>) -> Self {
        match path {
            Some(p) if !p.as_os_str().is_empty() => OutputTarget::File(p),
            _ => OutputTarget::Stdout,
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match self {
            OutputTarget::File(p) => Some(p),
            OutputTarget::Stdout => None,
        }
    }
}

/// Where the blob cache lives for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    /// A user-chosen directory; wiped at start and removed at the end.
    Explicit(PathBuf),
    /// A fresh, uniquely named directory under the system temp dir.
    Temporary,
}

impl CacheLocation {
    /// An absent or empty path means a temporary directory.
    pub fn from_arg(path: Option<PathBuf>) -> Self {
        match path {
            Some(p) if !p.as_os_str().is_empty() => CacheLocation::Explicit(p),
            _ => CacheLocation::Temporary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Image references in command-line order; duplicates allowed.
    pub images: Vec<String>,
    pub output: OutputTarget,
    pub cache: CacheLocation,
    /// Overwrite an existing output file.
    pub force: bool,
    /// Hide per-blob progress bars.
    pub quiet: bool,
    pub stdout_is_terminal: bool,
}

impl RunConfig {
    pub fn new(images: Vec<String>, output: OutputTarget) -> Self {
        Self {
            images,
            output,
            cache: CacheLocation::Temporary,
            force: false,
            quiet: false,
            stdout_is_terminal: false,
        }
    }

    pub fn with_cache(mut self, cache: CacheLocation) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_stdout_is_terminal(mut self, is_terminal: bool) -> Self {
        self.stdout_is_terminal = is_terminal;
        self
    }
}

/// Refuse destinations that can never succeed, before any image is pulled.
pub fn check_destination(target: &OutputTarget, force: bool, stdout_is_terminal: bool) -> Result<()> {
    match target {
        OutputTarget::Stdout if stdout_is_terminal => Err(Error::TerminalOutput),
        OutputTarget::Stdout => Ok(()),
        OutputTarget::File(path) => match std::fs::symlink_metadata(path) {
            Ok(_) if !force => Err(Error::AlreadyExists(path.clone())),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        },
    }
}
