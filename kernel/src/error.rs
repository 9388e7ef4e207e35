//! Boot-time failure kinds and the single stop path.

use core::fmt;

use crate::bringup::Stage;
use crate::mount::MountError;
use crate::rootenv::EnvStep;
use crate::scheduler::SchedError;
use crate::task::{ExecError, TaskError};

/// Why a subsystem initializer could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError {
    /// Something the initializer depends on is absent.
    Missing(&'static str),
    /// Hardware or firmware reported nonsense.
    Invalid(&'static str),
    /// A fixed-size table ran out of room.
    Exhausted(&'static str),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(what) => write!(f, "missing {what}"),
            Self::Invalid(what) => write!(f, "invalid {what}"),
            Self::Exhausted(what) => write!(f, "out of {what}"),
        }
    }
}

/// A failure the boot path cannot recover from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootError {
    Bringup { stage: Stage, error: InitError },
    Handoff(SchedError),
    TaskCreate(TaskError),
    Environment { step: EnvStep, error: InitError },
    RootMount(MountError),
    LaunchInit { terminal: u8, error: ExecError },
}

impl BootError {
    /// The fixed message printed when the system stops.
    pub const fn diagnostic(&self) -> &'static str {
        match self {
            Self::Bringup { .. } => "Hardware bring-up failed",
            Self::Handoff(_) => "Unable to start the scheduler",
            Self::TaskCreate(_) => "Unable to create kernel task",
            Self::Environment { .. } => "Unable to prepare the root environment",
            Self::RootMount(_) => "Unable to mount root",
            Self::LaunchInit { .. } => "Unable to launch init",
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.diagnostic())?;
        match self {
            Self::Bringup { stage, error } => write!(f, " ({stage}: {error})"),
            Self::Handoff(err) => write!(f, " ({err})"),
            Self::TaskCreate(err) => write!(f, " ({err})"),
            Self::Environment { step, error } => write!(f, " ({step}: {error})"),
            Self::RootMount(err) => write!(f, " ({err})"),
            Self::LaunchInit { terminal, error } => write!(f, " (tty{terminal}: {error})"),
        }
    }
}

/// Stops the system. Nothing is retried and nothing is rebooted.
pub fn fatal(error: BootError) -> ! {
    log::error!("fatal: {}", error);
    panic!("{}", error.diagnostic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_mount_and_init_have_fixed_diagnostics() {
        let mount = BootError::RootMount(MountError::UnknownFilesystem);
        assert_eq!(mount.diagnostic(), "Unable to mount root");
        assert_eq!(
            mount.to_string(),
            "Unable to mount root (unknown filesystem type)"
        );

        let init = BootError::LaunchInit {
            terminal: 1,
            error: ExecError::NotFound,
        };
        assert_eq!(init.diagnostic(), "Unable to launch init");
        assert_eq!(init.to_string(), "Unable to launch init (tty1: image not found)");
    }

    #[test]
    fn bringup_errors_name_the_stage() {
        let err = BootError::Bringup {
            stage: Stage::PowerTables,
            error: InitError::Invalid("RSDP checksum"),
        };
        assert_eq!(
            err.to_string(),
            "Hardware bring-up failed (power tables: invalid RSDP checksum)"
        );
    }

    #[test]
    #[should_panic(expected = "Unable to mount root")]
    fn fatal_stops_with_the_diagnostic() {
        fatal(BootError::RootMount(MountError::Busy));
    }
}
