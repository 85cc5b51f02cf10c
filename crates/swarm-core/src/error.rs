use std::fmt;

use thiserror::Error;

/// Setup steps run once, in order, before a virtual user enters its task loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStep {
    Register,
    Login,
    SeedRow,
}

impl SetupStep {
    pub const COUNT: usize = 3;
    pub const ALL: [SetupStep; Self::COUNT] =
        [SetupStep::Register, SetupStep::Login, SetupStep::SeedRow];

    pub fn name(self) -> &'static str {
        match self {
            SetupStep::Register => "register",
            SetupStep::Login => "login",
            SetupStep::SeedRow => "seed-row",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A setup step failed; the owning virtual user stops without running tasks.
#[derive(Debug, Clone, Error)]
#[error("setup step {step} failed: {reason}")]
pub struct SetupFailure {
    pub step: SetupStep,
    pub reason: String,
}

/// Per-user bookkeeping that disagrees with what the user believed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateInconsistency {
    #[error("leaderboard id {0} is not in the known set")]
    UnknownResource(u16),
    #[error("auth token already assigned")]
    TokenAlreadySet,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth request rejected with status {0}")]
    Rejected(u16),
    #[error("auth transport failure: {0}")]
    Transport(String),
    #[error("login response carried no token")]
    MissingToken,
}

/// Run-level failures surfaced by the swarm controller.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("no virtual user got past setup ({failed} of {spawned} failed it)")]
    AllSetupsFailed { spawned: u64, failed: u64 },
    #[error("invalid swarm configuration: {0}")]
    InvalidConfig(String),
}
