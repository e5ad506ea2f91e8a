pub mod fd;

pub use fd::SyncFd;
