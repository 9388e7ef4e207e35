//! Thread table, run queue and the one-way handoff from the boot context to
//! the live scheduler.
//!
//! The scheduler lock starts out held. The boot context adopts it through
//! [`Scheduler::begin_handoff`], initializes the run state, queues the first
//! task and releases the lock with [`Handoff::release`]; the [`Live`] token
//! it gets back is what permits dispatching.

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, Ordering};

use heapless::{Deque, String};

use crate::arch;
use crate::sync::{SpinLock, SpinLockGuard};
use crate::task::{
    Continuation, Owner, ProcessId, Stdio, TaskContext, TaskEntry, TaskError, TaskHandle, ThreadId,
};

pub const MAX_THREADS: usize = 32;
pub const MAX_CPUS: usize = 8;

const NAME_CAPACITY: usize = 32;

/// Called with the endpoints of every process that goes away.
pub type Reaper = fn(Stdio);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuId(pub u8);

impl CpuId {
    pub const BOOT: CpuId = CpuId(0);

    const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    LockedReady,
    Live,
}

impl Phase {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Phase::Uninitialized,
            1 => Phase::LockedReady,
            _ => Phase::Live,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// The boot context already took the scheduler lock.
    AlreadyClaimed,
    /// Dispatch was attempted before the lock was released.
    NotLive,
    /// Releasing would leave the system with nothing to run.
    NoRunnableTask,
    /// Processor count of zero or above [`MAX_CPUS`].
    CpuCount(usize),
    NoSuchCpu(CpuId),
    /// The processor is still running a dispatched thread.
    CpuBusy(CpuId),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyClaimed => f.write_str("scheduler lock already claimed"),
            Self::NotLive => f.write_str("scheduler not live"),
            Self::NoRunnableTask => f.write_str("no runnable task at handoff"),
            Self::CpuCount(count) => write!(f, "unsupported processor count {count}"),
            Self::NoSuchCpu(cpu) => write!(f, "no such processor {}", cpu.0),
            Self::CpuBusy(cpu) => write!(f, "processor {} busy", cpu.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running(CpuId),
    Parked,
    /// Killed while running; the slot is reclaimed when its entry returns.
    Terminated,
}

/// Everything needed to create one thread.
#[derive(Clone, Copy)]
pub struct Spawn<'n> {
    pub owner: Owner,
    pub entry: TaskEntry,
    pub arg: usize,
    pub stdio: Option<Stdio>,
    pub name: &'n str,
}

struct Thread {
    handle: TaskHandle,
    entry: TaskEntry,
    arg: usize,
    stdio: Option<Stdio>,
    name: String<NAME_CAPACITY>,
    state: ThreadState,
    wake_pending: bool,
}

impl Thread {
    fn context(&self) -> TaskContext {
        TaskContext {
            handle: self.handle,
            arg: self.arg,
            stdio: self.stdio,
        }
    }
}

// A thread removed from the table; its endpoints are released outside the lock.
struct Reaped {
    stdio: Option<Stdio>,
    reaper: Option<Reaper>,
}

impl Reaped {
    fn finish(self) {
        if let (Some(stdio), Some(reaper)) = (self.stdio, self.reaper) {
            reaper(stdio);
        }
    }
}

// What to do with a thread whose entry just returned.
enum Outcome {
    Reclaim,
    Requeue,
    Park,
}

struct RunState {
    threads: [Option<Thread>; MAX_THREADS],
    ready: Deque<ThreadId, MAX_THREADS>,
    current: [Option<TaskHandle>; MAX_CPUS],
    online: usize,
    next_pid: u32,
    next_tid: u32,
    reaper: Option<Reaper>,
}

impl RunState {
    const EMPTY_SLOT: Option<Thread> = None;

    const fn new() -> Self {
        Self {
            threads: [Self::EMPTY_SLOT; MAX_THREADS],
            ready: Deque::new(),
            current: [None; MAX_CPUS],
            online: 0,
            next_pid: 1,
            next_tid: 1,
            reaper: None,
        }
    }

    fn reset(&mut self, cpus: usize) {
        for slot in self.threads.iter_mut() {
            *slot = None;
        }
        self.ready.clear();
        self.current = [None; MAX_CPUS];
        self.online = cpus;
    }

    fn slot_of(&self, tid: ThreadId) -> Option<usize> {
        self.threads
            .iter()
            .position(|slot| matches!(slot, Some(thread) if thread.handle.tid == tid))
    }

    fn thread_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        let idx = self.slot_of(tid)?;
        self.threads[idx].as_mut()
    }

    fn process_alive(&self, pid: ProcessId) -> bool {
        self.threads
            .iter()
            .flatten()
            .any(|thread| thread.handle.pid == pid && thread.state != ThreadState::Terminated)
    }

    fn spawn(&mut self, spawn: Spawn<'_>) -> Result<TaskHandle, TaskError> {
        let idx = self
            .threads
            .iter()
            .position(Option::is_none)
            .ok_or(TaskError::TableFull)?;

        let pid = match spawn.owner {
            Owner::NewProcess => {
                let pid = ProcessId(self.next_pid);
                self.next_pid = self.next_pid.checked_add(1).ok_or(TaskError::IdsExhausted)?;
                pid
            }
            Owner::Process(pid) if self.process_alive(pid) => pid,
            Owner::Process(pid) => return Err(TaskError::NoSuchProcess(pid)),
        };
        let tid = ThreadId(self.next_tid);
        self.next_tid = self.next_tid.checked_add(1).ok_or(TaskError::IdsExhausted)?;

        let mut name = String::new();
        for ch in spawn.name.chars() {
            if name.push(ch).is_err() {
                break;
            }
        }

        let handle = TaskHandle { pid, tid };
        self.threads[idx] = Some(Thread {
            handle,
            entry: spawn.entry,
            arg: spawn.arg,
            stdio: spawn.stdio,
            name,
            state: ThreadState::Ready,
            wake_pending: false,
        });
        // One queue entry per ready thread, and the queue holds MAX_THREADS.
        let _ = self.ready.push_back(tid);

        log::debug!("sched: created thread {} ({})", handle, spawn.name);
        Ok(handle)
    }

    fn reap(&mut self, idx: usize) -> Option<Reaped> {
        let thread = self.threads[idx].take()?;
        self.forget_ready(thread.handle.tid);

        if !self.process_alive(thread.handle.pid) {
            log::debug!(
                "sched: process {} ({}) torn down",
                thread.handle.pid,
                thread.name.as_str()
            );
        }

        Some(Reaped {
            stdio: thread.stdio,
            reaper: self.reaper,
        })
    }

    fn forget_ready(&mut self, tid: ThreadId) {
        for _ in 0..self.ready.len() {
            if let Some(queued) = self.ready.pop_front() {
                if queued != tid {
                    let _ = self.ready.push_back(queued);
                }
            }
        }
    }

    fn next(&mut self, cpu: CpuId) -> Result<Option<Dispatch>, SchedError> {
        if cpu.index() >= self.online {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        if self.current[cpu.index()].is_some() {
            return Err(SchedError::CpuBusy(cpu));
        }

        while let Some(tid) = self.ready.pop_front() {
            let Some(thread) = self.thread_mut(tid) else {
                continue;
            };
            if thread.state != ThreadState::Ready {
                continue;
            }

            thread.state = ThreadState::Running(cpu);
            let dispatch = Dispatch {
                cpu,
                entry: thread.entry,
                context: thread.context(),
            };
            self.current[cpu.index()] = Some(dispatch.context.handle);
            return Ok(Some(dispatch));
        }

        Ok(None)
    }
}

/// A thread taken off the run queue for one processor.
#[must_use]
pub struct Dispatch {
    cpu: CpuId,
    entry: TaskEntry,
    context: TaskContext,
}

impl Dispatch {
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn handle(&self) -> TaskHandle {
        self.context.handle
    }

    pub fn context(&self) -> TaskContext {
        self.context
    }
}

/// Type-state marker: the boot context holds the lock, nothing is set up.
pub struct Uninitialized;

/// Type-state marker: run state is valid, the lock is still held.
pub struct LockedReady;

/// The boot context's exclusive hold on the scheduler during handoff.
#[must_use]
pub struct Handoff<'a, S> {
    scheduler: &'a Scheduler,
    hold: SpinLockGuard<'a, RunState>,
    _phase: PhantomData<S>,
}

impl<'a> Handoff<'a, Uninitialized> {
    /// Builds run queues and per-processor slots for `cpus` processors.
    pub fn initialize(mut self, cpus: usize) -> Result<Handoff<'a, LockedReady>, SchedError> {
        if cpus == 0 || cpus > MAX_CPUS {
            return Err(SchedError::CpuCount(cpus));
        }

        self.hold.reset(cpus);
        self.scheduler.set_phase(Phase::LockedReady);
        log::info!("sched: initialised for {} processor(s)", cpus);

        Ok(Handoff {
            scheduler: self.scheduler,
            hold: self.hold,
            _phase: PhantomData,
        })
    }
}

impl<'a> Handoff<'a, LockedReady> {
    /// Queues a thread while the boot context still holds the lock. It is
    /// runnable the moment the lock is released.
    pub fn create(
        &mut self,
        owner: Owner,
        entry: TaskEntry,
        arg: usize,
    ) -> Result<TaskHandle, TaskError> {
        self.hold.spawn(Spawn {
            owner,
            entry,
            arg,
            stdio: None,
            name: "kernel",
        })
    }

    /// Like [`Handoff::create`] with a name for diagnostics.
    pub fn spawn(&mut self, spawn: Spawn<'_>) -> Result<TaskHandle, TaskError> {
        self.hold.spawn(spawn)
    }

    /// Installs the hook that releases the endpoints of exited processes.
    pub fn set_reaper(&mut self, reaper: Reaper) {
        self.hold.reaper = Some(reaper);
    }

    /// Releases the scheduler lock. From here any processor may dispatch.
    ///
    /// Fails with [`SchedError::NoRunnableTask`] when nothing is queued; the
    /// handoff is abandoned in that case.
    pub fn release(self) -> Result<Live<'a>, SchedError> {
        if self.hold.ready.is_empty() {
            return Err(SchedError::NoRunnableTask);
        }

        let runnable = self.hold.ready.len();
        let scheduler = self.scheduler;
        scheduler.set_phase(Phase::Live);
        drop(self.hold);

        log::info!("sched: live with {} runnable thread(s)", runnable);
        Ok(Live { scheduler })
    }
}

/// Proof that the scheduler lock was released.
#[derive(Clone, Copy)]
pub struct Live<'a> {
    scheduler: &'a Scheduler,
}

impl<'a> Live<'a> {
    pub fn scheduler(&self) -> &'a Scheduler {
        self.scheduler
    }
}

pub struct Scheduler {
    state: SpinLock<RunState>,
    phase: AtomicU8,
}

impl Scheduler {
    /// A scheduler whose lock is held by its creator.
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new_held(RunState::new()),
            phase: AtomicU8::new(Phase::Uninitialized as u8),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Takes over the held scheduler lock. Succeeds exactly once.
    pub fn begin_handoff(&self) -> Result<Handoff<'_, Uninitialized>, SchedError> {
        let hold = self.state.adopt().ok_or(SchedError::AlreadyClaimed)?;
        Ok(Handoff {
            scheduler: self,
            hold,
            _phase: PhantomData,
        })
    }

    fn live_state(&self) -> Result<SpinLockGuard<'_, RunState>, TaskError> {
        if self.phase() != Phase::Live {
            return Err(TaskError::SchedulerLocked);
        }
        Ok(self.state.lock())
    }

    /// Creates a thread on the live scheduler.
    pub fn create(&self, owner: Owner, entry: TaskEntry, arg: usize) -> Result<TaskHandle, TaskError> {
        self.spawn(Spawn {
            owner,
            entry,
            arg,
            stdio: None,
            name: "kernel",
        })
    }

    pub fn spawn(&self, spawn: Spawn<'_>) -> Result<TaskHandle, TaskError> {
        self.live_state()?.spawn(spawn)
    }

    /// Ends a thread. A running thread is reclaimed once its entry returns.
    /// Returns false when the thread was not alive.
    pub fn terminate(&self, handle: TaskHandle) -> bool {
        let Ok(mut state) = self.live_state() else {
            return false;
        };
        let Some(idx) = state.slot_of(handle.tid) else {
            return false;
        };

        let thread_state = match state.threads[idx].as_mut() {
            Some(thread) if thread.handle.pid == handle.pid => thread.state,
            _ => return false,
        };

        let reaped = match thread_state {
            ThreadState::Terminated => return false,
            ThreadState::Running(_) => {
                if let Some(thread) = state.threads[idx].as_mut() {
                    thread.state = ThreadState::Terminated;
                }
                None
            }
            ThreadState::Ready | ThreadState::Parked => state.reap(idx),
        };
        drop(state);

        if let Some(reaped) = reaped {
            reaped.finish();
        }
        true
    }

    /// Makes a parked thread runnable again. A wake aimed at a running
    /// thread is remembered so its next park returns immediately.
    pub fn wake(&self, handle: TaskHandle) -> bool {
        let Ok(mut state) = self.live_state() else {
            return false;
        };
        let Some(thread) = state.thread_mut(handle.tid) else {
            return false;
        };

        match thread.state {
            ThreadState::Parked => {
                thread.state = ThreadState::Ready;
                let _ = state.ready.push_back(handle.tid);
                true
            }
            ThreadState::Running(_) => {
                thread.wake_pending = true;
                true
            }
            ThreadState::Ready => true,
            ThreadState::Terminated => false,
        }
    }

    /// Takes the next runnable thread for `cpu`.
    pub fn dispatch(&self, live: Live<'_>, cpu: CpuId) -> Result<Option<Dispatch>, SchedError> {
        debug_assert!(core::ptr::eq(live.scheduler, self));
        self.state.lock().next(cpu)
    }

    /// Dispatch for callers without a [`Live`] token, such as application
    /// processors spinning during bring-up.
    pub fn try_dispatch(&self, cpu: CpuId) -> Result<Option<Dispatch>, SchedError> {
        if self.phase() != Phase::Live {
            return Err(SchedError::NotLive);
        }
        self.state.lock().next(cpu)
    }

    /// Runs a dispatched thread until its entry returns, then applies its
    /// continuation.
    pub fn run(&self, dispatch: Dispatch) {
        let continuation = (dispatch.entry)(dispatch.context);

        let mut state = self.state.lock();
        state.current[dispatch.cpu.index()] = None;
        let Some(idx) = state.slot_of(dispatch.context.handle.tid) else {
            return;
        };

        let outcome = match state.threads[idx].as_ref() {
            Some(thread) if thread.state == ThreadState::Terminated => Outcome::Reclaim,
            Some(_) if continuation == Continuation::Exit => Outcome::Reclaim,
            Some(thread) if thread.wake_pending => Outcome::Requeue,
            Some(_) => Outcome::Park,
            None => return,
        };

        let reaped = match outcome {
            Outcome::Reclaim => state.reap(idx),
            Outcome::Requeue => {
                let tid = dispatch.context.handle.tid;
                if let Some(thread) = state.threads[idx].as_mut() {
                    thread.wake_pending = false;
                    thread.state = ThreadState::Ready;
                }
                let _ = state.ready.push_back(tid);
                None
            }
            Outcome::Park => {
                if let Some(thread) = state.threads[idx].as_mut() {
                    thread.state = ThreadState::Parked;
                }
                None
            }
        };
        drop(state);

        if let Some(reaped) = reaped {
            reaped.finish();
        }
    }

    /// The boot processor's final state: interrupts on, the processor given
    /// to the scheduler for good.
    pub fn idle(&self, live: Live<'_>, cpu: CpuId) -> ! {
        arch::enable_interrupts();
        loop {
            match self.dispatch(live, cpu) {
                Ok(Some(next)) => self.run(next),
                Ok(None) => arch::wait_for_interrupt(),
                Err(err) => {
                    log::error!("sched: processor {} leaves the scheduler: {}", cpu.0, err);
                    arch::halt()
                }
            }
        }
    }

    // Read access for diagnostics; nothing to inspect until the lock is released.
    fn inspect(&self) -> Option<SpinLockGuard<'_, RunState>> {
        (self.phase() == Phase::Live).then(|| self.state.lock())
    }

    pub fn state_of(&self, handle: TaskHandle) -> Option<ThreadState> {
        let state = self.inspect()?;
        let idx = state.slot_of(handle.tid)?;
        state.threads[idx]
            .as_ref()
            .filter(|thread| thread.handle.pid == handle.pid)
            .map(|thread| thread.state)
    }

    /// Threads waiting on the run queue. Zero before the scheduler is live.
    pub fn runnable(&self) -> usize {
        self.inspect().map_or(0, |state| {
            state
                .threads
                .iter()
                .flatten()
                .filter(|thread| thread.state == ThreadState::Ready)
                .count()
        })
    }

    pub fn is_process_alive(&self, pid: ProcessId) -> bool {
        self.inspect()
            .map_or(false, |state| state.process_alive(pid))
    }

    /// The thread a processor is running right now.
    pub fn current(&self, cpu: CpuId) -> Option<TaskHandle> {
        let state = self.inspect()?;
        state.current.get(cpu.index()).copied().flatten()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::vec::Vec;

    fn exit_task(_ctx: TaskContext) -> Continuation {
        Continuation::Exit
    }

    fn park_task(_ctx: TaskContext) -> Continuation {
        Continuation::Park
    }

    fn live(scheduler: &Scheduler, cpus: usize) -> Live<'_> {
        let mut handoff = scheduler.begin_handoff().unwrap().initialize(cpus).unwrap();
        handoff.create(Owner::NewProcess, exit_task, 0).unwrap();
        handoff.release().unwrap()
    }

    #[test]
    fn handoff_walks_the_three_phases_once() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.phase(), Phase::Uninitialized);

        let handoff = scheduler.begin_handoff().unwrap();
        assert!(matches!(scheduler.begin_handoff(), Err(SchedError::AlreadyClaimed)));

        let mut handoff = handoff.initialize(2).unwrap();
        assert_eq!(scheduler.phase(), Phase::LockedReady);
        handoff.create(Owner::NewProcess, exit_task, 0).unwrap();

        handoff.release().unwrap();
        assert_eq!(scheduler.phase(), Phase::Live);
        assert!(matches!(scheduler.begin_handoff(), Err(SchedError::AlreadyClaimed)));
    }

    #[test]
    fn nothing_dispatches_before_release() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.try_dispatch(CpuId::BOOT).err(), Some(SchedError::NotLive));

        let mut handoff = scheduler.begin_handoff().unwrap().initialize(1).unwrap();
        handoff.create(Owner::NewProcess, exit_task, 0).unwrap();
        assert_eq!(scheduler.try_dispatch(CpuId::BOOT).err(), Some(SchedError::NotLive));
        assert_eq!(
            scheduler.create(Owner::NewProcess, exit_task, 0),
            Err(TaskError::SchedulerLocked)
        );

        let live = handoff.release().unwrap();
        assert!(scheduler.dispatch(live, CpuId::BOOT).unwrap().is_some());
    }

    #[test]
    fn release_requires_a_runnable_task() {
        let scheduler = Scheduler::new();
        let handoff = scheduler.begin_handoff().unwrap().initialize(1).unwrap();
        assert_eq!(handoff.release().err(), Some(SchedError::NoRunnableTask));
        assert_ne!(scheduler.phase(), Phase::Live);
    }

    #[test]
    fn processor_count_is_bounded() {
        let scheduler = Scheduler::new();
        let handoff = scheduler.begin_handoff().unwrap();
        assert_eq!(
            handoff.initialize(MAX_CPUS + 1).err(),
            Some(SchedError::CpuCount(MAX_CPUS + 1))
        );
    }

    #[test]
    fn creations_before_live_survive_the_handoff_in_order() {
        let scheduler = Scheduler::new();
        let mut handoff = scheduler.begin_handoff().unwrap().initialize(1).unwrap();
        let first = handoff.create(Owner::NewProcess, exit_task, 1).unwrap();
        let second = handoff.create(Owner::NewProcess, exit_task, 2).unwrap();
        let live = handoff.release().unwrap();

        assert_eq!(scheduler.runnable(), 2);
        assert_eq!(scheduler.state_of(first), Some(ThreadState::Ready));
        assert_eq!(scheduler.state_of(second), Some(ThreadState::Ready));

        let next = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        assert_eq!(next.handle(), first);
        assert_eq!(next.context().arg, 1);
        assert_eq!(scheduler.current(CpuId::BOOT), Some(first));
        scheduler.run(next);

        let next = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        assert_eq!(next.handle(), second);
        scheduler.run(next);
        assert!(scheduler.dispatch(live, CpuId::BOOT).unwrap().is_none());
    }

    #[test]
    fn returning_exit_reclaims_the_thread() {
        let scheduler = Scheduler::new();
        let live = live(&scheduler, 1);
        let next = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        let handle = next.handle();
        scheduler.run(next);

        assert_eq!(scheduler.state_of(handle), None);
        assert!(!scheduler.is_process_alive(handle.pid));
        assert_eq!(scheduler.current(CpuId::BOOT), None);
    }

    #[test]
    fn last_thread_tears_down_its_process() {
        let scheduler = Scheduler::new();
        let _live = live(&scheduler, 1);

        let main = scheduler.create(Owner::NewProcess, park_task, 0).unwrap();
        let helper = scheduler
            .create(Owner::Process(main.pid), park_task, 0)
            .unwrap();
        assert_eq!(helper.pid, main.pid);
        assert_ne!(helper.tid, main.tid);

        assert!(scheduler.terminate(main));
        assert!(scheduler.is_process_alive(main.pid));
        assert!(scheduler.terminate(helper));
        assert!(!scheduler.is_process_alive(main.pid));

        assert!(!scheduler.terminate(helper));
        assert_eq!(
            scheduler.create(Owner::Process(main.pid), park_task, 0),
            Err(TaskError::NoSuchProcess(main.pid))
        );
    }

    #[test]
    fn thread_ids_are_never_reused() {
        let scheduler = Scheduler::new();
        let _live = live(&scheduler, 1);

        let mut seen = Vec::new();
        for _ in 0..MAX_THREADS * 2 {
            let handle = scheduler.create(Owner::NewProcess, park_task, 0).unwrap();
            assert!(!seen.contains(&handle.tid));
            seen.push(handle.tid);
            assert!(scheduler.terminate(handle));
        }
    }

    #[test]
    fn thread_table_fills_up() {
        let scheduler = Scheduler::new();
        let _live = live(&scheduler, 1);
        for _ in 1..MAX_THREADS {
            scheduler.create(Owner::NewProcess, park_task, 0).unwrap();
        }
        assert_eq!(
            scheduler.create(Owner::NewProcess, park_task, 0),
            Err(TaskError::TableFull)
        );
    }

    #[test]
    fn terminating_a_running_thread_defers_reclaim() {
        static SELF_KILLS: AtomicUsize = AtomicUsize::new(0);
        static SCHED: Scheduler = Scheduler::new();

        fn self_kill(ctx: TaskContext) -> Continuation {
            assert!(SCHED.terminate(ctx.handle));
            assert_eq!(SCHED.state_of(ctx.handle), Some(ThreadState::Terminated));
            SELF_KILLS.fetch_add(1, Ordering::SeqCst);
            Continuation::Park
        }

        let mut handoff = SCHED.begin_handoff().unwrap().initialize(1).unwrap();
        let handle = handoff.create(Owner::NewProcess, self_kill, 0).unwrap();
        let live = handoff.release().unwrap();

        let next = SCHED.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        SCHED.run(next);

        assert_eq!(SELF_KILLS.load(Ordering::SeqCst), 1);
        assert_eq!(SCHED.state_of(handle), None);
        assert!(SCHED.dispatch(live, CpuId::BOOT).unwrap().is_none());
    }

    #[test]
    fn parked_threads_wait_for_wake() {
        let scheduler = Scheduler::new();
        let live = live(&scheduler, 1);
        let first = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        scheduler.run(first);

        let sleeper = scheduler.create(Owner::NewProcess, park_task, 0).unwrap();
        let next = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        scheduler.run(next);
        assert_eq!(scheduler.state_of(sleeper), Some(ThreadState::Parked));
        assert!(scheduler.dispatch(live, CpuId::BOOT).unwrap().is_none());

        assert!(scheduler.wake(sleeper));
        let next = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        assert_eq!(next.handle(), sleeper);

        // A wake while running is not lost.
        assert!(scheduler.wake(sleeper));
        scheduler.run(next);
        assert_eq!(scheduler.state_of(sleeper), Some(ThreadState::Ready));
    }

    #[test]
    fn busy_and_unknown_processors_are_refused() {
        let scheduler = Scheduler::new();
        let live = live(&scheduler, 1);
        scheduler.create(Owner::NewProcess, park_task, 0).unwrap();

        assert_eq!(
            scheduler.dispatch(live, CpuId(3)).err(),
            Some(SchedError::NoSuchCpu(CpuId(3)))
        );
        let running = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        assert_eq!(
            scheduler.dispatch(live, CpuId::BOOT).err(),
            Some(SchedError::CpuBusy(CpuId::BOOT))
        );
        scheduler.run(running);
    }

    #[test]
    fn reaper_sees_endpoints_of_exited_processes() {
        static REAPED: AtomicUsize = AtomicUsize::new(0);

        fn reaper(stdio: Stdio) {
            assert_eq!(stdio.stdout.0, 7);
            REAPED.fetch_add(1, Ordering::SeqCst);
        }

        let scheduler = Scheduler::new();
        let mut handoff = scheduler.begin_handoff().unwrap().initialize(1).unwrap();
        handoff.set_reaper(reaper);
        let stdio = Stdio {
            stdin: crate::devices::Handle(7),
            stdout: crate::devices::Handle(7),
            stderr: crate::devices::Handle(7),
        };
        handoff
            .spawn(Spawn {
                owner: Owner::NewProcess,
                entry: exit_task,
                arg: 0,
                stdio: Some(stdio),
                name: "/sbin/init",
            })
            .unwrap();
        let live = handoff.release().unwrap();

        let next = scheduler.dispatch(live, CpuId::BOOT).unwrap().unwrap();
        scheduler.run(next);
        assert_eq!(REAPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn application_processors_start_only_after_release() {
        static RAN: AtomicUsize = AtomicUsize::new(0);

        fn count(_ctx: TaskContext) -> Continuation {
            RAN.fetch_add(1, Ordering::SeqCst);
            Continuation::Exit
        }

        const TASKS: usize = 12;
        let scheduler: &'static Scheduler = Box::leak(Box::new(Scheduler::new()));
        let released = Arc::new(AtomicBool::new(false));
        let handoff = scheduler.begin_handoff().unwrap();

        let workers: Vec<_> = (1..4u8)
            .map(|cpu| {
                let released = Arc::clone(&released);
                std::thread::spawn(move || {
                    let mut premature = 0;
                    loop {
                        match scheduler.try_dispatch(CpuId(cpu)) {
                            Err(SchedError::NotLive) => std::hint::spin_loop(),
                            Ok(Some(next)) => {
                                if !released.load(Ordering::SeqCst) {
                                    premature += 1;
                                }
                                scheduler.run(next);
                            }
                            Ok(None) if RAN.load(Ordering::SeqCst) == TASKS => return premature,
                            Ok(None) => std::hint::spin_loop(),
                            Err(err) => panic!("unexpected dispatch error {err:?}"),
                        }
                    }
                })
            })
            .collect();

        let mut handoff = handoff.initialize(4).unwrap();
        for _ in 0..TASKS {
            handoff.create(Owner::NewProcess, count, 0).unwrap();
        }
        released.store(true, Ordering::SeqCst);
        handoff.release().unwrap();

        let premature: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(premature, 0);
        assert_eq!(RAN.load(Ordering::SeqCst), TASKS);
    }
}
