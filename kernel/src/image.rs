//! Program images linked into the kernel and served from a built-in root
//! filesystem.

use crate::mount::{FilesystemDriver, MountError, MountTable};
use crate::task::{ExecError, ImageLoader, TaskEntry};

/// One program in the image table.
#[derive(Clone, Copy)]
pub struct Image {
    pub path: &'static str,
    pub entry: TaskEntry,
}

/// Filesystem driver for the built-in image store. It answers to a single
/// block device name.
pub struct ImageFs {
    name: &'static str,
    device: &'static str,
}

impl ImageFs {
    pub const fn new(name: &'static str, device: &'static str) -> Self {
        Self { name, device }
    }
}

impl FilesystemDriver for ImageFs {
    fn name(&self) -> &'static str {
        self.name
    }

    fn probe(&self, source: &str) -> Result<(), MountError> {
        if source == self.device {
            Ok(())
        } else {
            Err(MountError::InvalidSource)
        }
    }
}

/// Loads programs from the image table once the image filesystem is the root.
pub struct BuiltinImages<'a> {
    mounts: &'a MountTable,
    filesystem: &'static str,
    images: &'a [Image],
}

impl<'a> BuiltinImages<'a> {
    pub const fn new(mounts: &'a MountTable, filesystem: &'static str, images: &'a [Image]) -> Self {
        Self {
            mounts,
            filesystem,
            images,
        }
    }
}

impl ImageLoader for BuiltinImages<'_> {
    fn load(&self, path: &str) -> Result<TaskEntry, ExecError> {
        if self.mounts.filesystem_at("/") != Some(self.filesystem) {
            return Err(ExecError::NoRoot);
        }
        self.images
            .iter()
            .find(|image| image.path == path)
            .map(|image| image.entry)
            .ok_or(ExecError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountFlags;
    use crate::task::{Continuation, TaskContext};

    fn init(_ctx: TaskContext) -> Continuation {
        Continuation::Exit
    }

    static INITFS: ImageFs = ImageFs::new("initfs", "/dev/ram0");
    static IMAGES: [Image; 1] = [Image {
        path: "/sbin/init",
        entry: init,
    }];

    #[test]
    fn loads_only_from_a_mounted_image_root() {
        let mounts = MountTable::new();
        mounts.register(&INITFS).unwrap();
        let loader = BuiltinImages::new(&mounts, "initfs", &IMAGES);

        assert_eq!(loader.load("/sbin/init").err(), Some(ExecError::NoRoot));

        mounts
            .mount("/dev/ram0", "/", "initfs", MountFlags::READ_ONLY)
            .unwrap();
        assert!(loader.load("/sbin/init").is_ok());
        assert_eq!(loader.load("/bin/sh").err(), Some(ExecError::NotFound));
    }

    #[test]
    fn image_fs_answers_to_its_device() {
        assert_eq!(INITFS.probe("/dev/ram0"), Ok(()));
        assert_eq!(INITFS.probe("/dev/ram1"), Err(MountError::InvalidSource));
    }
}
