//! Root environment: the first kernel task. It prepares descriptors,
//! filesystems and devices, settles where root and init live, mounts root
//! and starts init on every terminal.

use core::fmt;
use core::fmt::Write as _;

use heapless::{String, Vec};
use log::{info, warn};

use crate::cmdline::{CmdlineError, CommandLine, Value, VALUE_CAPACITY};
use crate::devices::{Handle, IoError, OpenMode, DEVFS, DEV_DIR};
use crate::error::{BootError, InitError};
use crate::mount::{MountError, MountFlags};
use crate::task::{ExecRequest, Owner, ProcessId, TaskEntry, TaskHandle, TaskManager};

/// Terminals init is started on, `/dev/tty0` through `/dev/tty5`.
pub const TERMINALS: usize = 6;

/// Where missing settings are asked for.
pub const CONSOLE: &str = "/dev/tty0";

/// The subsystem services the builder brings up.
pub trait Environment {
    fn init_fd(&mut self) -> Result<(), InitError>;
    fn init_fs(&mut self) -> Result<(), InitError>;
    fn mount(
        &mut self,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: MountFlags,
    ) -> Result<(), MountError>;
    fn init_devices(&mut self) -> Result<(), InitError>;
    fn init_network(&mut self) -> Result<(), InitError>;
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, IoError>;
    fn close(&mut self, handle: Handle);
    /// Prints `prompt` on the device and reads one line into `out`.
    fn read_line(&mut self, handle: Handle, prompt: &str, out: &mut Value) -> Result<(), IoError>;
    fn init_hostname(&mut self) -> Result<(), InitError>;
}

/// Environment steps whose failure stops the boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvStep {
    FileDescriptors,
    Filesystems,
    Devices,
    Network,
    Hostname,
}

impl fmt::Display for EnvStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FileDescriptors => "file descriptors",
            Self::Filesystems => "filesystems",
            Self::Devices => "devices",
            Self::Network => "network",
            Self::Hostname => "hostname",
        };
        f.write_str(name)
    }
}

/// A setting the builder resolves before mounting root.
struct Setting {
    key: &'static str,
    prompt: &'static str,
}

const SETTINGS: [Setting; 3] = [
    Setting {
        key: "root",
        prompt: "Select root device: ",
    },
    Setting {
        key: "rootfs",
        prompt: "Root filesystem to use: ",
    },
    Setting {
        key: "init",
        prompt: "Location of init: ",
    },
];

/// Where root and init come from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootConfig {
    pub root: Value,
    pub rootfs: Value,
    pub init: Value,
}

#[derive(Clone, Debug)]
pub struct RootReport {
    pub config: RootConfig,
    pub monitor: Option<TaskHandle>,
    /// Init processes, in terminal order.
    pub init: Vec<ProcessId, TERMINALS>,
}

pub struct RootEnvironmentBuilder<'a, E: ?Sized, T: ?Sized> {
    env: &'a mut E,
    tasks: &'a T,
    cmdline: &'a CommandLine<'a>,
    this: TaskHandle,
    monitor: Option<TaskEntry>,
}

impl<'a, E, T> RootEnvironmentBuilder<'a, E, T>
where
    E: Environment + ?Sized,
    T: TaskManager + ?Sized,
{
    /// `this` is the thread running the builder; it is terminated at the end.
    pub fn new(env: &'a mut E, tasks: &'a T, cmdline: &'a CommandLine<'a>, this: TaskHandle) -> Self {
        Self {
            env,
            tasks,
            cmdline,
            this,
            monitor: None,
        }
    }

    /// Starts `entry` as the request monitor before anything else.
    pub fn with_monitor(mut self, entry: TaskEntry) -> Self {
        self.monitor = Some(entry);
        self
    }

    pub fn run(mut self) -> Result<RootReport, BootError> {
        let monitor = self.start_monitor()?;

        self.step(EnvStep::FileDescriptors, |env| env.init_fd())?;
        self.step(EnvStep::Filesystems, |env| env.init_fs())?;

        if let Err(err) = self.env.mount(DEVFS, DEV_DIR, DEVFS, MountFlags::empty()) {
            warn!("rootenv: unable to mount {} on {}: {}", DEVFS, DEV_DIR, err);
        }
        self.step(EnvStep::Devices, |env| env.init_devices())?;
        self.step(EnvStep::Network, |env| env.init_network())?;

        let config = self.resolve_config();

        self.env
            .mount(&config.root, "/", &config.rootfs, MountFlags::empty())
            .map_err(|err| {
                warn!("rootenv: mounting {} ({}) on / failed: {}", config.root, config.rootfs, err);
                BootError::RootMount(err)
            })?;

        self.step(EnvStep::Hostname, |env| env.init_hostname())?;

        info!("Starting init");
        let init = self.launch_init(&config.init)?;

        info!("rootenv: root environment ready, exiting");
        self.tasks.terminate(self.this);

        Ok(RootReport {
            config,
            monitor,
            init,
        })
    }

    fn start_monitor(&mut self) -> Result<Option<TaskHandle>, BootError> {
        let Some(entry) = self.monitor else {
            return Ok(None);
        };
        // The monitor lives in the kernel process so it outlives this thread.
        let handle = self
            .tasks
            .create(Owner::Process(self.this.pid), entry, 0)
            .map_err(BootError::TaskCreate)?;
        info!("rootenv: request monitor started as {}", handle);
        Ok(Some(handle))
    }

    fn step(
        &mut self,
        step: EnvStep,
        init: impl FnOnce(&mut E) -> Result<(), InitError>,
    ) -> Result<(), BootError> {
        init(self.env).map_err(|error| BootError::Environment { step, error })
    }

    fn resolve_config(&mut self) -> RootConfig {
        let console = match self.env.open(CONSOLE, OpenMode::READ_WRITE) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("rootenv: console {} unavailable: {}", CONSOLE, err);
                None
            }
        };

        let [root, rootfs, init] = &SETTINGS;
        let config = RootConfig {
            root: self.resolve(console, root),
            rootfs: self.resolve(console, rootfs),
            init: self.resolve(console, init),
        };

        if let Some(handle) = console {
            self.env.close(handle);
        }
        config
    }

    // One fallback only: a missing value is asked for once, never retried.
    fn resolve(&mut self, console: Option<Handle>, setting: &Setting) -> Value {
        let mut value = Value::new();
        match self.cmdline.value_into(setting.key, &mut value) {
            Ok(()) => {}
            Err(CmdlineError::Truncated) => warn!(
                "rootenv: command line argument \"{}\" truncated to {} bytes",
                setting.key, VALUE_CAPACITY
            ),
            Err(CmdlineError::Missing) => {
                warn!("command line argument \"{}\" not specified", setting.key);
                if let Some(handle) = console {
                    if let Err(err) = self.env.read_line(handle, setting.prompt, &mut value) {
                        warn!("rootenv: no {} entered: {}", setting.key, err);
                    }
                }
            }
        }
        info!("{}={}", setting.key, value);
        value
    }

    fn launch_init(&mut self, init: &str) -> Result<Vec<ProcessId, TERMINALS>, BootError> {
        let argv = [init];
        let envp: [&str; 0] = [];
        let mut launched = Vec::new();

        for terminal in 0..TERMINALS {
            let mut path: String<16> = String::new();
            // "/dev/ttyN" always fits.
            let _ = write!(path, "{}/tty{}", DEV_DIR, terminal);

            let request = ExecRequest::on_terminal(init, &argv, &envp, &path);
            let pid = self.tasks.execute_image(&request).map_err(|error| {
                warn!("rootenv: init on {} failed: {}", path, error);
                BootError::LaunchInit {
                    terminal: terminal as u8,
                    error,
                }
            })?;
            info!("rootenv: init running on {} as pid {}", path, pid);
            let _ = launched.push(pid);
        }

        Ok(launched)
    }
}
