//! Error types, one per fallible subsystem, following the hand-rolled
//! `Display`/`Error` style `zpoline_rewriter::RewriteError` and
//! `zpoline_loader::TrampolineError` use rather than `thiserror`.

use std::fmt;

/// Errors from parsing the on-disk ELF file of a target object (§4.3).
#[derive(Debug)]
pub enum ElfError {
    Io(std::io::Error),
    Parse(goblin::error::Error),
    MissingTextSection,
    TooManyTables { kind: &'static str, limit: usize },
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::Io(e) => write!(f, "failed to read object file: {e}"),
            ElfError::Parse(e) => write!(f, "failed to parse ELF: {e}"),
            ElfError::MissingTextSection => write!(f, "object has no .text section"),
            ElfError::TooManyTables { kind, limit } => {
                write!(f, "more than {limit} {kind} section headers, bounded list exhausted")
            }
        }
    }
}

impl std::error::Error for ElfError {}

impl From<std::io::Error> for ElfError {
    fn from(e: std::io::Error) -> Self {
        ElfError::Io(e)
    }
}

impl From<goblin::error::Error> for ElfError {
    fn from(e: goblin::error::Error) -> Self {
        ElfError::Parse(e)
    }
}

/// Errors from planning or emitting a patch (§4.5, §7).
///
/// These map directly onto SPEC_FULL.md §7's four error kinds: `Structural`
/// and `SyscallFailure` are fatal (the caller is expected to abort the
/// process with [`crate::consts::INTERCEPTOR_EXIT_CODE`]); `UnsafeSite` means
/// the planner silently skips that one `ecall`, which is not an error from
/// the crate's point of view but is surfaced here so the loader hook can log
/// it.
#[derive(Debug)]
pub enum PatchError {
    /// No reachable trampoline slot, an encoder rejected a displacement that
    /// is structurally required, or an internal table overflowed.
    Structural(String),
    /// The site cannot be safely patched (jump-target interior, or an AUIPC
    /// inside the displaced range) and must be left unintercepted.
    UnsafeSite(UnsafeReason),
    /// `mprotect`/`mmap` or a `/proc` read failed.
    SyscallFailure(nix::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeReason {
    ClobbersJumpTarget,
    ContainsAuipc,
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::Structural(s) => write!(f, "structural patch failure: {s}"),
            PatchError::UnsafeSite(UnsafeReason::ClobbersJumpTarget) => {
                write!(f, "overwrite would clobber a jump target's interior")
            }
            PatchError::UnsafeSite(UnsafeReason::ContainsAuipc) => {
                write!(f, "displaced range contains an unrelocatable AUIPC")
            }
            PatchError::SyscallFailure(e) => write!(f, "system call failed: {e}"),
        }
    }
}

impl std::error::Error for PatchError {}

impl From<nix::Error> for PatchError {
    fn from(e: nix::Error) -> Self {
        PatchError::SyscallFailure(e)
    }
}

impl PatchError {
    /// True for the two kinds SPEC_FULL.md §7 calls fatal; false for
    /// `UnsafeSite`, which only skips the one ecall.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PatchError::UnsafeSite(_))
    }

    /// Logs and exits with [`crate::consts::INTERCEPTOR_EXIT_CODE`] for a
    /// fatal error; returns the error back to the caller otherwise, so a
    /// loader-level harness can call this unconditionally after a skipped
    /// site and keep going only when there's somewhere left to go.
    pub fn abort_if_fatal(self) -> PatchError {
        if self.is_fatal() {
            log::error!("{self}");
            std::process::exit(crate::consts::INTERCEPTOR_EXIT_CODE);
        }
        self
    }
}
