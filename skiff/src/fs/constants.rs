//! Open flags as scripts pass them.
//!
//! The values are fixed compatibility constants, not the host's `O_*`
//! numbers. [`FsCore::open`](super::FsCore::open) translates them.

pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 0x1;
pub const O_RDWR: u32 = 0x2;
pub const O_APPEND: u32 = 0x8;
pub const O_SYNC: u32 = 0x80;
pub const O_NOFOLLOW: u32 = 0x100;
pub const O_CREAT: u32 = 0x200;
pub const O_TRUNC: u32 = 0x400;
pub const O_EXCL: u32 = 0x800;
pub const O_DIRECTORY: u32 = 0x100000;

/// Access mode bits of a flag word.
pub(crate) const ACCESS_MASK: u32 = O_WRONLY | O_RDWR;

pub(crate) fn wants_write(flags: u32) -> bool {
    flags & ACCESS_MASK != 0
}

pub(crate) fn wants_read(flags: u32) -> bool {
    flags & O_WRONLY == 0 || flags & O_RDWR != 0
}
