//! Concrete stage implementations. None of these know anything about real
//! BGP wire format; the kernel treats message bodies as opaque, so these
//! exist only to give the kernel something real to attach, prepare, run,
//! and stop (stdin/stdout, TCP, files, filters, a subprocess bridge, and
//! a couple of external-collaborator stubs).

pub mod exec;
pub mod file;
pub mod filter;
pub mod kafka;
pub mod rpki;
pub mod speak;
pub mod stdio;
pub mod tcp;

/// Registers every builtin stage word with the [`crate::stage::StageRegistry`].
/// Called once from `main` before the assembler ever looks a command word
/// up.
pub fn register_builtin_stages() {
    stdio::register();
    tcp::register();
    file::register();
    filter::register();
    exec::register();
    rpki::register();
    kafka::register();
    speak::register();
}
