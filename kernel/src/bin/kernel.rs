#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_main)]

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn main() {
    eprintln!("kernel: this binary only runs on a bare-metal x86_64 target");
    std::process::exit(1);
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod bare {
    use core::fmt::Write as _;
    use core::panic::PanicInfo;
    use core::ptr;

    use kernel::arch::{self, x86_64 as machine};
    use kernel::boot::{self, RUSTCORE_BOOTINFO};
    use kernel::devices::{DeviceRegistry, Vfs};
    use kernel::env::{Drivers, KernelEnvironment};
    use kernel::error;
    use kernel::image::{BuiltinImages, Image, ImageFs};
    use kernel::logger::{self, Sink};
    use kernel::monitor::{Monitor, Request};
    use kernel::mount::{FilesystemDriver, MountTable};
    use kernel::rootenv::RootEnvironmentBuilder;
    use kernel::scheduler::{CpuId, Scheduler};
    use kernel::task::{Continuation, KernelTasks, Stdio, TaskContext};
    use log::{info, LevelFilter};

    core::arch::global_asm!(
        ".section .note.xen.pvh,\"a\",@note",
        ".align 4",
        ".long 4f - 3f",
        ".long 6f - 5f",
        ".long 0x12",
        "3:",
        ".asciz \"Xen\"",
        "4:",
        ".align 4",
        "5:",
        ".long _start",
        "6:",
        ".align 4",
    );

    const INIT_FS: &str = "initfs";

    static SCHEDULER: Scheduler = Scheduler::new();
    static MOUNTS: MountTable = MountTable::new();
    static DEVICES: DeviceRegistry = DeviceRegistry::new();
    static VFS: Vfs<'static> = Vfs::new(&MOUNTS, &DEVICES);

    static IMAGES: [Image; 1] = [Image {
        path: "/sbin/init",
        entry: init_main,
    }];
    static INITFS: ImageFs = ImageFs::new(INIT_FS, "/dev/ram0");
    static FILESYSTEMS: [&dyn FilesystemDriver; 1] = [&INITFS];
    static LOADER: BuiltinImages<'static> = BuiltinImages::new(&MOUNTS, INIT_FS, &IMAGES);

    static TASKS: KernelTasks<'static, BuiltinImages<'static>, Vfs<'static>> =
        KernelTasks::new(&SCHEDULER, &LOADER, &VFS);
    static MONITOR: Monitor<'static> = Monitor::new();

    /// `/sbin/init`: greets its terminal, then asks the monitor to end it.
    fn init_main(ctx: TaskContext) -> Continuation {
        if let Some(stdio) = ctx.stdio {
            let _ = DEVICES.write(stdio.stdout, b"\ninit: welcome to rustcore\n");
        }
        let exit = Request::Exit {
            handle: ctx.handle,
            status: 0,
        };
        match MONITOR.submit(exit) {
            Ok(()) => Continuation::Park,
            Err(_) => Continuation::Exit,
        }
    }

    fn monitor_main(ctx: TaskContext) -> Continuation {
        MONITOR.run(&SCHEDULER, ctx, &TASKS)
    }

    fn root_environment(ctx: TaskContext) -> Continuation {
        let cmdline = boot::cmdline();
        let drivers = Drivers {
            filesystems: &FILESYSTEMS,
            terminals: &machine::console::TERMINALS,
            network: None,
        };
        let mut env = KernelEnvironment::new(VFS, cmdline, drivers);
        let builder = RootEnvironmentBuilder::new(&mut env, &TASKS, cmdline, ctx.handle)
            .with_monitor(monitor_main);
        match builder.run() {
            Ok(report) => info!(
                "boot: {} init process(es) running, root {} ({})",
                report.init.len(),
                report.config.root,
                report.config.rootfs
            ),
            Err(err) => error::fatal(err),
        }
        Continuation::Exit
    }

    fn reap(stdio: Stdio) {
        TASKS.release_stdio(&stdio);
    }

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        machine::early_serial();
        let _ = logger::init(&machine::console::SERIAL, LevelFilter::Info);

        // SAFETY: the loader fills the record before jumping here and nothing
        // writes it afterwards.
        let boot_info = unsafe { &*ptr::addr_of!(RUSTCORE_BOOTINFO) };
        let cmdline = boot::init(Some(boot_info));
        logger::apply_cmdline(cmdline);

        let mut platform = machine::Machine::new();
        let live = match kernel::start(&SCHEDULER, &mut platform, cmdline, root_environment, Some(reap)) {
            Ok(live) => live,
            Err(err) => error::fatal(err),
        };
        SCHEDULER.idle(live, CpuId::BOOT)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        // Straight to the port: the logger may be what panicked.
        let mut line: heapless::String<256> = heapless::String::new();
        let _ = write!(line, "\nkernel panic: {}\n", info.message());
        machine::console::SERIAL.write_str(&line);
        arch::halt()
    }
}
