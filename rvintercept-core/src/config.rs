//! Process-wide configuration for a patching run. Builder style mirrors
//! `zpoline_rewriter::RewriteConfig`: a `Default`-backed struct with
//! consuming `self` setters, rather than a constructor taking every field.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::consts::RvcMode;

/// Governs one run of crawl -> plan -> patch across a set of loaded objects.
#[derive(Debug, Clone)]
pub struct InterceptConfig {
    /// Objects whose `.text` is left untouched entirely (matched by path
    /// prefix, same semantics as `RewriteConfig::exclude_path`).
    pub exclude_paths: HashSet<PathBuf>,
    rvc: RvcMode,
    uses_trampoline: Option<bool>,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        InterceptConfig {
            exclude_paths: HashSet::new(),
            rvc: RvcMode::ENABLED,
            uses_trampoline: None,
        }
    }
}

impl InterceptConfig {
    pub fn new() -> InterceptConfig {
        InterceptConfig::default()
    }

    pub fn exclude_path(mut self, path: PathBuf) -> InterceptConfig {
        self.exclude_paths.insert(path);
        self
    }

    pub fn rvc(mut self, rvc: RvcMode) -> InterceptConfig {
        self.rvc = rvc;
        self
    }

    /// Overrides the `INTERCEPT_NO_TRAMPOLINE` env var's verdict; mainly for
    /// tests that can't rely on process environment state.
    pub fn uses_trampoline(mut self, enabled: bool) -> InterceptConfig {
        self.uses_trampoline = Some(enabled);
        self
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_paths.iter().any(|p| path.starts_with(p) || path == p)
    }

    pub fn rvc_mode(&self) -> RvcMode {
        self.rvc
    }

    /// Whether a trampoline should be allocated at all, following
    /// `INTERCEPT_NO_TRAMPOLINE`'s original semantics -- present and
    /// beginning with `'0'` disables it, unset or any other value leaves it
    /// enabled -- unless explicitly overridden.
    pub fn trampoline_enabled(&self) -> bool {
        if let Some(v) = self.uses_trampoline {
            return v;
        }
        !std::env::var("INTERCEPT_NO_TRAMPOLINE").is_ok_and(|v| v.starts_with('0'))
    }
}
