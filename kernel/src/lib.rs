#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

pub mod arch;
pub mod boot;
pub mod bringup;
pub mod cmdline;
pub mod devices;
pub mod env;
pub mod error;
pub mod image;
pub mod logger;
pub mod memory;
pub mod monitor;
pub mod mount;
pub mod rootenv;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod time;

#[cfg(test)]
mod testing;

pub use error::{BootError, InitError};

use bringup::Platform;
use cmdline::CommandLine;
use scheduler::{Live, Reaper, Scheduler, Spawn};
use task::{Owner, TaskEntry};

/// Brings the machine up and hands the boot processor's work to the
/// scheduler, with `root_task` queued as the first thread.
///
/// The scheduler lock is taken before any hardware is touched and released
/// only once `root_task` is queued, so nothing can be dispatched against a
/// half-built run state.
pub fn start<'s, P: Platform + ?Sized>(
    scheduler: &'s Scheduler,
    platform: &mut P,
    cmdline: &CommandLine<'_>,
    root_task: TaskEntry,
    reaper: Option<Reaper>,
) -> Result<Live<'s>, BootError> {
    let handoff = scheduler.begin_handoff().map_err(BootError::Handoff)?;

    let machine = bringup::run(platform, cmdline)?;
    boot::record_epoch(machine.epoch);

    let mut handoff = handoff.initialize(machine.cpus).map_err(BootError::Handoff)?;
    if let Some(reaper) = reaper {
        handoff.set_reaper(reaper);
    }
    let root = handoff
        .spawn(Spawn {
            owner: Owner::NewProcess,
            entry: root_task,
            arg: 0,
            stdio: None,
            name: "rootenv",
        })
        .map_err(BootError::TaskCreate)?;
    log::info!("boot: root environment task is {}", root);

    handoff.release().map_err(BootError::Handoff)
}
