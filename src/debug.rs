/* diosix scheduler debug output
 *
 * All output is queued in memory until the embedding hypervisor
 * drains it to whatever debug hardware it owns. nothing here
 * touches a serial port directly.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use spin::Mutex;
use alloc::string::String;

lazy_static!
{
    /* queue debug output here until the embedder drains it */
    static ref DEBUG_QUEUE: Mutex<String> = Mutex::new(String::new());
}

/* top level debug macros */
/* useful messages */
#[macro_export]
macro_rules! hvlog
{
    ($fmt:expr) => ($crate::debug::queue_write(format_args!(concat!("[+] sched: ", $fmt, "\n"))));
    ($fmt:expr, $($arg:tt)*) => ($crate::debug::queue_write(format_args!(concat!("[+] sched: ", $fmt, "\n"), $($arg)*)));
}

/* bad news: bug detection, failures, etc. */
#[macro_export]
macro_rules! hvalert
{
    ($fmt:expr) => ($crate::debug::queue_write(format_args!(concat!("[!] sched: ", $fmt, "\n"))));
    ($fmt:expr, $($arg:tt)*) => ($crate::debug::queue_write(format_args!(concat!("[!] sched: ", $fmt, "\n"), $($arg)*)));
}

/* only output if debug build is enabled */
#[macro_export]
#[cfg(debug_assertions)]
macro_rules! hvdebug
{
    ($fmt:expr) => ($crate::debug::queue_write(format_args!(concat!("[?] sched: ", $fmt, "\n"))));
    ($fmt:expr, $($arg:tt)*) => ($crate::debug::queue_write(format_args!(concat!("[?] sched: ", $fmt, "\n"), $($arg)*)));
}

/* silence debug if disabled */
#[macro_export]
#[cfg(not(debug_assertions))]
macro_rules! hvdebug
{
    ($fmt:expr) => ({});
    ($fmt:expr, $($arg:tt)*) => ({});
}

/* append formatted text to the debug queue */
pub fn queue_write(args: core::fmt::Arguments)
{
    use core::fmt::Write;
    let mut queue = DEBUG_QUEUE.lock();
    let _ = queue.write_fmt(args);
}

/* hand the queued output to the caller and reinitialize the queue.
   the embedder calls this from its housekeeping path and pushes the
   text out to its debug hardware
   <= all output queued since the last drain */
pub fn drain_queue() -> String
{
    let mut queue = DEBUG_QUEUE.lock();
    let drained = queue.clone();
    queue.clear();
    drained
}

#[cfg(test)]
mod tests
{
    #[test]
    fn queue_and_drain()
    {
        hvlog!("hello {}", 42);
        let out = super::drain_queue();
        assert!(out.contains("[+] sched: hello 42"));

        /* queue must be empty after a drain */
        assert_eq!(super::drain_queue(), "");
    }
}
