//! Boots the kernel core on the host: bring-up against a scripted platform,
//! the scheduler handoff, and the root environment starting init on every
//! terminal.

use std::cell::RefCell;
use std::sync::{Mutex, Once, OnceLock};

use kernel::bringup::{FirmwareWindow, InitResult, Platform, Stage};
use kernel::cmdline::CommandLine;
use kernel::devices::{CharDevice, DeviceRegistry, Vfs};
use kernel::env::{Drivers, KernelEnvironment};
use kernel::image::{BuiltinImages, Image, ImageFs};
use kernel::monitor::{Monitor, Request};
use kernel::mount::{FilesystemDriver, MountTable};
use kernel::rootenv::RootEnvironmentBuilder;
use kernel::scheduler::{CpuId, Phase, SchedError, Scheduler, ThreadState};
use kernel::task::{Continuation, KernelTasks, ProcessId, Stdio, TaskContext, TaskHandle};
use kernel::time::RtcTime;
use kernel::{boot, BootError, InitError};
use log::{LevelFilter, Log, Metadata, Record};

thread_local! {
    static LINES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

struct Capture;

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        LINES.with(|lines| lines.borrow_mut().push(format!("{}", record.args())));
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture;
static INSTALL: Once = Once::new();

fn install_logger() {
    INSTALL.call_once(|| {
        log::set_logger(&CAPTURE).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
}

fn position(lines: &[String], wanted: &str) -> usize {
    lines
        .iter()
        .position(|line| line == wanted)
        .unwrap_or_else(|| panic!("no log line {wanted:?} in {lines:#?}"))
}

#[derive(Default)]
struct ScriptedPlatform {
    calls: Vec<Stage>,
    fail_at: Option<Stage>,
}

impl ScriptedPlatform {
    fn hit(&mut self, stage: Stage) -> InitResult {
        self.calls.push(stage);
        if self.fail_at == Some(stage) {
            Err(InitError::Invalid("scripted failure"))
        } else {
            Ok(())
        }
    }
}

impl Platform for ScriptedPlatform {
    fn init_interrupts(&mut self) -> InitResult {
        self.hit(Stage::InterruptTable)
    }
    fn init_cpu_features(&mut self) -> InitResult {
        self.hit(Stage::CpuFeatures)
    }
    fn init_memory_map(&mut self) -> InitResult {
        self.hit(Stage::MemoryMap)
    }
    fn init_physical_memory(&mut self) -> InitResult {
        self.hit(Stage::PhysicalMemory)
    }
    fn init_random(&mut self) -> InitResult {
        self.hit(Stage::Random)
    }
    fn init_virtual_memory(&mut self) -> InitResult {
        self.hit(Stage::VirtualMemory)
    }
    fn init_display(&mut self, _firmware: &FirmwareWindow) -> InitResult {
        self.hit(Stage::Display)
    }
    fn init_console(&mut self) -> InitResult {
        self.hit(Stage::Console)
    }
    fn read_clock(&mut self, _firmware: &FirmwareWindow) -> Result<RtcTime, InitError> {
        self.hit(Stage::Clock)?;
        Ok(RtcTime::new(2024, 2, 29, 12, 0, 0))
    }
    fn flush_irqs(&mut self) -> InitResult {
        self.hit(Stage::FlushIrqs)
    }
    fn init_power_tables(&mut self) -> InitResult {
        self.hit(Stage::PowerTables)
    }
    fn init_interrupt_controller(&mut self) -> InitResult {
        self.hit(Stage::InterruptController)
    }
    fn init_timer(&mut self) -> InitResult {
        self.hit(Stage::Timer)
    }
    fn init_bus(&mut self) -> InitResult {
        self.hit(Stage::Bus)
    }
    fn init_multiprocessor(&mut self) -> Result<usize, InitError> {
        self.hit(Stage::Multiprocessor)?;
        Ok(1)
    }
    fn init_namespace(&mut self) -> InitResult {
        self.hit(Stage::Namespace)
    }
    fn enable_interrupts(&mut self) {}
    fn disable_interrupts(&mut self) {}
}

struct Tty {
    output: Mutex<Vec<u8>>,
}

impl Tty {
    const fn new() -> Self {
        Self {
            output: Mutex::new(Vec::new()),
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
    }
}

impl CharDevice for Tty {
    fn write(&self, bytes: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(bytes);
    }

    fn read_byte(&self) -> Option<u8> {
        None
    }
}

const BOOT_ARGS: &str = "root=/dev/ram0 rootfs=initfs init=/sbin/init hostname=flowtest";

static SCHEDULER: Scheduler = Scheduler::new();
static MOUNTS: MountTable = MountTable::new();
static DEVICES: DeviceRegistry = DeviceRegistry::new();
static VFS: Vfs<'static> = Vfs::new(&MOUNTS, &DEVICES);

static IMAGES: [Image; 1] = [Image {
    path: "/sbin/init",
    entry: init_main,
}];
static INITFS: ImageFs = ImageFs::new("initfs", "/dev/ram0");
static FILESYSTEMS: [&dyn FilesystemDriver; 1] = [&INITFS];
static LOADER: BuiltinImages<'static> = BuiltinImages::new(&MOUNTS, "initfs", &IMAGES);
static TASKS: KernelTasks<'static, BuiltinImages<'static>, Vfs<'static>> =
    KernelTasks::new(&SCHEDULER, &LOADER, &VFS);
static MONITOR: Monitor<'static> = Monitor::new();

static TTYS: [Tty; 6] = [const { Tty::new() }; 6];
static TERMINALS: [(&str, &dyn CharDevice); 6] = [
    ("tty0", &TTYS[0]),
    ("tty1", &TTYS[1]),
    ("tty2", &TTYS[2]),
    ("tty3", &TTYS[3]),
    ("tty4", &TTYS[4]),
    ("tty5", &TTYS[5]),
];

static CMDLINE: OnceLock<CommandLine<'static>> = OnceLock::new();
static REPORT: Mutex<Option<(Vec<ProcessId>, Option<TaskHandle>)>> = Mutex::new(None);
static REAPED: Mutex<Vec<Stdio>> = Mutex::new(Vec::new());

fn init_main(ctx: TaskContext) -> Continuation {
    let stdio = ctx.stdio.expect("init runs with standard endpoints");
    DEVICES.write(stdio.stdout, b"init: hello\n").unwrap();
    MONITOR
        .submit(Request::Exit {
            handle: ctx.handle,
            status: 0,
        })
        .unwrap();
    Continuation::Park
}

fn monitor_main(ctx: TaskContext) -> Continuation {
    MONITOR.run(&SCHEDULER, ctx, &TASKS)
}

fn root_environment(ctx: TaskContext) -> Continuation {
    let cmdline = CMDLINE.get().unwrap();
    let drivers = Drivers {
        filesystems: &FILESYSTEMS,
        terminals: &TERMINALS,
        network: None,
    };
    let mut env = KernelEnvironment::new(VFS, cmdline, drivers);
    let report = RootEnvironmentBuilder::new(&mut env, &TASKS, cmdline, ctx.handle)
        .with_monitor(monitor_main)
        .run()
        .unwrap();
    assert_eq!(env.hostname(), "flowtest");
    *REPORT.lock().unwrap() = Some((report.init.to_vec(), report.monitor));
    Continuation::Exit
}

fn reap(stdio: Stdio) {
    REAPED.lock().unwrap().push(stdio);
    TASKS.release_stdio(&stdio);
}

#[test]
fn kernel_boots_to_init_on_every_terminal() {
    install_logger();
    let cmdline = CMDLINE.get_or_init(|| CommandLine::parse(BOOT_ARGS));
    let mut platform = ScriptedPlatform::default();

    let live = kernel::start(&SCHEDULER, &mut platform, cmdline, root_environment, Some(reap))
        .unwrap();
    assert_eq!(SCHEDULER.phase(), Phase::Live);
    assert_eq!(boot::unix_epoch(), Some(1_709_208_000));

    // No `acpi` option means the namespace stage runs too.
    assert_eq!(platform.calls, Stage::SEQUENCE);

    let mut dispatched = 0;
    while let Some(next) = SCHEDULER.dispatch(live, CpuId::BOOT).unwrap() {
        SCHEDULER.run(next);
        dispatched += 1;
        assert!(dispatched < 64, "scheduler never went idle");
    }

    let (init, monitor) = REPORT.lock().unwrap().take().expect("root environment finished");
    assert_eq!(init.len(), 6);
    for pid in &init {
        assert!(!SCHEDULER.is_process_alive(*pid), "{pid} still alive");
    }

    let monitor = monitor.expect("monitor started");
    assert_eq!(MONITOR.registered(), Some(monitor));
    assert_eq!(SCHEDULER.state_of(monitor), Some(ThreadState::Parked));
    assert_eq!(SCHEDULER.runnable(), 0);

    assert_eq!(MOUNTS.filesystem_at("/"), Some("initfs"));
    assert_eq!(MOUNTS.filesystem_at("/dev"), Some("devfs"));
    for tty in &TTYS {
        assert_eq!(tty.text(), "init: hello\n");
    }
    assert_eq!(REAPED.lock().unwrap().len(), 6);
    assert_eq!(DEVICES.open_handles(), 0);

    let lines = LINES.with(|lines| lines.borrow().clone());
    assert_eq!(lines.first().map(String::as_str), Some("Kernel booted"));
    let epoch = position(&lines, "Current unix epoch: 1709208000");
    let live_at = position(&lines, "sched: live with 1 runnable thread(s)");
    let root = position(&lines, "root=/dev/ram0");
    let init_at = position(&lines, "Starting init");
    assert!(epoch < live_at && live_at < root && root < init_at);
    assert!(lines.iter().all(|line| !line.contains("not specified")));
}

#[test]
fn failed_bringup_leaves_the_scheduler_locked() {
    install_logger();
    let scheduler = Scheduler::new();
    let cmdline = CommandLine::parse("acpi");
    let mut platform = ScriptedPlatform {
        fail_at: Some(Stage::PowerTables),
        ..ScriptedPlatform::default()
    };

    let err = kernel::start(&scheduler, &mut platform, &cmdline, root_environment, None)
        .err()
        .expect("bring-up must fail");
    assert_eq!(
        err,
        BootError::Bringup {
            stage: Stage::PowerTables,
            error: InitError::Invalid("scripted failure"),
        }
    );
    assert_eq!(platform.calls.last(), Some(&Stage::PowerTables));
    assert!(!platform.calls.contains(&Stage::Timer));

    assert_eq!(scheduler.phase(), Phase::Uninitialized);
    assert_eq!(scheduler.try_dispatch(CpuId::BOOT).err(), Some(SchedError::NotLive));
    assert!(matches!(scheduler.begin_handoff(), Err(SchedError::AlreadyClaimed)));
}
