//! Userspace request monitor: a kernel task that carries out process
//! requests queued on its channel.

use core::fmt::Write as _;

use heapless::String;
use ipc::{Channel, SendError};
use log::{debug, info, warn};
use spin::Once;

use crate::cmdline::Value;
use crate::devices::DEV_DIR;
use crate::scheduler::Scheduler;
use crate::task::{Continuation, ExecRequest, TaskContext, TaskHandle, TaskManager};

/// Requests that can wait for the monitor before senders see `Full`.
pub const QUEUE_DEPTH: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// A thread asks to end with `status`.
    Exit { handle: TaskHandle, status: i32 },
    /// Start the image at `path` on `/dev/tty<terminal>`.
    Exec { path: Value, terminal: u8 },
}

pub type RequestChannel = Channel<Request, QUEUE_DEPTH>;

struct Route<'a> {
    scheduler: &'a Scheduler,
    handle: TaskHandle,
}

/// Routes requests to the monitor thread and wakes it when work arrives.
pub struct Monitor<'a> {
    requests: RequestChannel,
    route: Once<Route<'a>>,
}

impl<'a> Monitor<'a> {
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            route: Once::new(),
        }
    }

    /// Makes `handle` the thread that gets woken for new requests. The first
    /// registration wins.
    pub fn register(&self, scheduler: &'a Scheduler, handle: TaskHandle) -> TaskHandle {
        self.route
            .call_once(|| {
                info!("monitor: listening as {}", handle);
                Route { scheduler, handle }
            })
            .handle
    }

    pub fn registered(&self) -> Option<TaskHandle> {
        self.route.get().map(|route| route.handle)
    }

    /// Queues `request` and wakes the monitor.
    pub fn submit(&self, request: Request) -> Result<(), SendError> {
        let route = self.route.get().ok_or(SendError::Unroutable)?;
        self.requests.send(request)?;
        route.scheduler.wake(route.handle);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// Handles everything queued so far; returns how many requests ran.
    pub fn service<T: TaskManager + ?Sized>(&self, tasks: &T) -> usize {
        service(&self.requests, tasks)
    }

    /// Body of the monitor task: register, drain, then sleep until woken.
    pub fn run<T: TaskManager + ?Sized>(
        &self,
        scheduler: &'a Scheduler,
        ctx: TaskContext,
        tasks: &T,
    ) -> Continuation {
        self.register(scheduler, ctx.handle);
        let handled = self.service(tasks);
        if handled > 0 {
            debug!("monitor: handled {} request(s)", handled);
        }
        Continuation::Park
    }
}

impl Default for Monitor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains `channel`, carrying out each request through `tasks`.
pub fn service<T: TaskManager + ?Sized>(channel: &RequestChannel, tasks: &T) -> usize {
    let mut handled = 0;
    while let Ok(request) = channel.receive() {
        match request {
            Request::Exit { handle, status } => {
                info!("monitor: {} exited with status {}", handle, status);
                tasks.terminate(handle);
            }
            Request::Exec { path, terminal } => {
                let mut device: String<16> = String::new();
                if write!(device, "{}/tty{}", DEV_DIR, terminal).is_err() {
                    warn!("monitor: terminal {} out of range", terminal);
                    handled += 1;
                    continue;
                }
                let argv = [path.as_str()];
                let request = ExecRequest::on_terminal(&path, &argv, &[], &device);
                match tasks.execute_image(&request) {
                    Ok(pid) => info!("monitor: started {} on {} as pid {}", path, device, pid),
                    Err(err) => warn!("monitor: exec of {} failed: {}", path, err),
                }
            }
        }
        handled += 1;
    }
    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{CpuId, ThreadState};
    use crate::task::{ExecError, Owner, ProcessId, TaskError, ThreadId};
    use std::cell::RefCell;
    use std::string::{String as StdString, ToString};
    use std::vec::Vec;

    #[derive(Default)]
    struct Recorder {
        terminated: RefCell<Vec<TaskHandle>>,
        execs: RefCell<Vec<(StdString, StdString)>>,
    }

    impl TaskManager for Recorder {
        fn create(&self, _owner: Owner, _entry: crate::task::TaskEntry, _arg: usize) -> Result<TaskHandle, TaskError> {
            Err(TaskError::TableFull)
        }

        fn execute_image(&self, request: &ExecRequest<'_>) -> Result<ProcessId, ExecError> {
            self.execs
                .borrow_mut()
                .push((request.path.to_string(), request.stdout.to_string()));
            if request.path == "/bin/missing" {
                Err(ExecError::NotFound)
            } else {
                Ok(ProcessId(7))
            }
        }

        fn terminate(&self, handle: TaskHandle) {
            self.terminated.borrow_mut().push(handle);
        }
    }

    fn path(text: &str) -> Value {
        let mut value = Value::new();
        value.push_str(text).unwrap();
        value
    }

    struct NoTasks;

    impl TaskManager for NoTasks {
        fn create(&self, _owner: Owner, _entry: crate::task::TaskEntry, _arg: usize) -> Result<TaskHandle, TaskError> {
            Err(TaskError::TableFull)
        }

        fn execute_image(&self, _request: &ExecRequest<'_>) -> Result<ProcessId, ExecError> {
            Ok(ProcessId(8))
        }

        fn terminate(&self, _handle: TaskHandle) {}
    }

    static SCHED: Scheduler = Scheduler::new();
    static MONITOR: Monitor<'static> = Monitor::new();

    fn monitor_task(ctx: TaskContext) -> Continuation {
        MONITOR.run(&SCHED, ctx, &NoTasks)
    }

    #[test]
    fn unrouted_requests_are_refused() {
        let monitor = Monitor::new();
        let request = Request::Exit {
            handle: TaskHandle {
                pid: ProcessId(3),
                tid: ThreadId(4),
            },
            status: 0,
        };
        assert_eq!(monitor.submit(request), Err(SendError::Unroutable));
        assert_eq!(monitor.pending(), 0);
    }

    #[test]
    fn service_runs_every_queued_request() {
        let channel = RequestChannel::new();
        let victim = TaskHandle {
            pid: ProcessId(5),
            tid: ThreadId(9),
        };
        channel
            .send(Request::Exit {
                handle: victim,
                status: 1,
            })
            .unwrap();
        channel
            .send(Request::Exec {
                path: path("/bin/sh"),
                terminal: 3,
            })
            .unwrap();
        channel
            .send(Request::Exec {
                path: path("/bin/missing"),
                terminal: 0,
            })
            .unwrap();

        let tasks = Recorder::default();
        assert_eq!(service(&channel, &tasks), 3);
        assert!(channel.is_empty());
        assert_eq!(*tasks.terminated.borrow(), [victim]);
        assert_eq!(
            *tasks.execs.borrow(),
            [
                ("/bin/sh".to_string(), "/dev/tty3".to_string()),
                ("/bin/missing".to_string(), "/dev/tty0".to_string()),
            ]
        );
    }

    #[test]
    fn submission_wakes_the_parked_monitor() {
        let mut handoff = SCHED.begin_handoff().unwrap().initialize(1).unwrap();
        let handle = handoff.create(Owner::NewProcess, monitor_task, 0).unwrap();
        handoff.release().unwrap();

        let dispatch = SCHED.try_dispatch(CpuId::BOOT).unwrap().unwrap();
        SCHED.run(dispatch);
        assert_eq!(MONITOR.registered(), Some(handle));
        assert_eq!(SCHED.state_of(handle), Some(ThreadState::Parked));

        MONITOR
            .submit(Request::Exec {
                path: path("/sbin/getty"),
                terminal: 1,
            })
            .unwrap();
        assert_eq!(MONITOR.pending(), 1);
        assert_eq!(SCHED.state_of(handle), Some(ThreadState::Ready));

        let dispatch = SCHED.try_dispatch(CpuId::BOOT).unwrap().unwrap();
        SCHED.run(dispatch);
        assert_eq!(MONITOR.pending(), 0);
        assert_eq!(SCHED.state_of(handle), Some(ThreadState::Parked));
    }
}
