//! Task lifecycle contract: creation, image execution and termination.

use core::fmt;

use crate::devices::{Handle, IoError};
use crate::scheduler::{Scheduler, Spawn};

/// Most argument or environment strings accepted by one exec request.
pub const MAX_ARGS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one thread: the process it belongs to and its own id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub pid: ProcessId,
    pub tid: ThreadId,
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.tid)
    }
}

/// Which process a new thread joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    NewProcess,
    Process(ProcessId),
}

impl Owner {
    /// Maps the raw owner id of the creation call, where 0 asks for a new process.
    pub const fn from_raw(pid: u32) -> Self {
        if pid == 0 {
            Owner::NewProcess
        } else {
            Owner::Process(ProcessId(pid))
        }
    }
}

/// Standard endpoints wired into a process by an exec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stdio {
    pub stdin: Handle,
    pub stdout: Handle,
    pub stderr: Handle,
}

/// What a thread receives when it is dispatched.
#[derive(Clone, Copy, Debug)]
pub struct TaskContext {
    pub handle: TaskHandle,
    pub arg: usize,
    pub stdio: Option<Stdio>,
}

/// What a thread asks of the scheduler when its entry returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuation {
    /// The thread is done; returning is an implicit termination.
    Exit,
    /// Keep the thread but do not dispatch it again until it is woken.
    Park,
}

pub type TaskEntry = fn(TaskContext) -> Continuation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskError {
    /// Every thread slot is in use.
    TableFull,
    /// The owning process has no live thread.
    NoSuchProcess(ProcessId),
    /// The scheduler lock is still held by the boot context.
    SchedulerLocked,
    /// Thread or process ids would wrap around.
    IdsExhausted,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => f.write_str("thread table full"),
            Self::NoSuchProcess(pid) => write!(f, "no such process {pid}"),
            Self::SchedulerLocked => f.write_str("scheduler not live"),
            Self::IdsExhausted => f.write_str("task ids exhausted"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecError {
    /// No image exists at the requested path.
    NotFound,
    /// The root filesystem is not mounted yet.
    NoRoot,
    /// Too many argument or environment strings.
    Arguments,
    /// A standard endpoint could not be opened.
    Endpoint(IoError),
    /// The process could not be created.
    Task(TaskError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("image not found"),
            Self::NoRoot => f.write_str("root filesystem not mounted"),
            Self::Arguments => f.write_str("argument list too long"),
            Self::Endpoint(err) => write!(f, "standard endpoint: {err}"),
            Self::Task(err) => write!(f, "process creation: {err}"),
        }
    }
}

/// One-shot description of a program to run.
#[derive(Clone, Copy, Debug)]
pub struct ExecRequest<'a> {
    pub path: &'a str,
    pub argv: &'a [&'a str],
    pub envp: &'a [&'a str],
    pub stdin: &'a str,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

impl<'a> ExecRequest<'a> {
    /// A request with all three endpoints on the same device.
    pub const fn on_terminal(
        path: &'a str,
        argv: &'a [&'a str],
        envp: &'a [&'a str],
        terminal: &'a str,
    ) -> Self {
        Self {
            path,
            argv,
            envp,
            stdin: terminal,
            stdout: terminal,
            stderr: terminal,
        }
    }
}

/// Primitives the boot core needs from the task layer.
pub trait TaskManager {
    /// Creates a thread in `owner`. Usable once the scheduler is live.
    fn create(&self, owner: Owner, entry: TaskEntry, arg: usize) -> Result<TaskHandle, TaskError>;

    /// Loads and starts `request.path`; on failure no process exists.
    fn execute_image(&self, request: &ExecRequest<'_>) -> Result<ProcessId, ExecError>;

    /// Ends the thread, tearing its process down with its last thread.
    fn terminate(&self, handle: TaskHandle);
}

/// Resolves program paths to runnable entries.
pub trait ImageLoader {
    fn load(&self, path: &str) -> Result<TaskEntry, ExecError>;
}

/// Opens the device paths named in an exec request.
pub trait Endpoints {
    fn open_endpoint(&self, path: &str) -> Result<Handle, IoError>;
    fn close_endpoint(&self, handle: Handle);
}

/// [`TaskManager`] over the kernel scheduler, an image loader and the
/// device layer.
pub struct KernelTasks<'a, L, E> {
    scheduler: &'a Scheduler,
    loader: &'a L,
    endpoints: &'a E,
}

impl<'a, L: ImageLoader, E: Endpoints> KernelTasks<'a, L, E> {
    pub const fn new(scheduler: &'a Scheduler, loader: &'a L, endpoints: &'a E) -> Self {
        Self {
            scheduler,
            loader,
            endpoints,
        }
    }

    pub fn scheduler(&self) -> &'a Scheduler {
        self.scheduler
    }

    /// Closes the endpoints of a process that went away.
    pub fn release_stdio(&self, stdio: &Stdio) {
        self.endpoints.close_endpoint(stdio.stdin);
        self.endpoints.close_endpoint(stdio.stdout);
        self.endpoints.close_endpoint(stdio.stderr);
    }

    fn open_stdio(&self, request: &ExecRequest<'_>) -> Result<Stdio, ExecError> {
        let stdin = self.endpoints.open_endpoint(request.stdin);
        let stdin = stdin.map_err(ExecError::Endpoint)?;

        let stdout = match self.endpoints.open_endpoint(request.stdout) {
            Ok(handle) => handle,
            Err(err) => {
                self.endpoints.close_endpoint(stdin);
                return Err(ExecError::Endpoint(err));
            }
        };

        let stderr = match self.endpoints.open_endpoint(request.stderr) {
            Ok(handle) => handle,
            Err(err) => {
                self.endpoints.close_endpoint(stdout);
                self.endpoints.close_endpoint(stdin);
                return Err(ExecError::Endpoint(err));
            }
        };

        Ok(Stdio {
            stdin,
            stdout,
            stderr,
        })
    }
}

impl<'a, L: ImageLoader, E: Endpoints> TaskManager for KernelTasks<'a, L, E> {
    fn create(&self, owner: Owner, entry: TaskEntry, arg: usize) -> Result<TaskHandle, TaskError> {
        self.scheduler.create(owner, entry, arg)
    }

    fn execute_image(&self, request: &ExecRequest<'_>) -> Result<ProcessId, ExecError> {
        if request.argv.len() > MAX_ARGS || request.envp.len() > MAX_ARGS {
            return Err(ExecError::Arguments);
        }

        let entry = self.loader.load(request.path)?;
        let stdio = self.open_stdio(request)?;
        let name = request.argv.first().copied().unwrap_or(request.path);

        let spawned = self.scheduler.spawn(Spawn {
            owner: Owner::NewProcess,
            entry,
            arg: request.argv.len(),
            stdio: Some(stdio),
            name,
        });

        match spawned {
            Ok(handle) => {
                log::debug!(
                    "exec: {} started as pid {} on {}",
                    request.path,
                    handle.pid,
                    request.stdout
                );
                Ok(handle.pid)
            }
            Err(err) => {
                self.release_stdio(&stdio);
                Err(ExecError::Task(err))
            }
        }
    }

    fn terminate(&self, handle: TaskHandle) {
        if !self.scheduler.terminate(handle) {
            log::warn!("task: terminate of unknown thread {handle}");
        }
    }
}
