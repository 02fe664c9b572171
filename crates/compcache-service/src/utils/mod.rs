pub mod paths;
pub mod size;
pub mod tmpfiles;
#[cfg(unix)]
pub mod umask;
