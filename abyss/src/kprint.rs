//! Kernel print utilities.
//!
//! The paging subsystem reports through the [`print!`], [`println!`],
//! [`info!`], [`warning!`] and [`debug!`] macros. The macros format into the
//! console sink registered with [`set_console`]; when no console is
//! registered, the output is discarded.

use crate::spinlock::SpinLock;
use core::fmt::Write;

/// A byte sink for kernel messages, such as a serial port.
pub trait Console
where
    Self: Sync,
{
    /// Writes a chunk of an already formatted message.
    fn write_str(&self, s: &str);
}

static CONSOLE: SpinLock<Option<&'static dyn Console>> = SpinLock::new(None);

struct Sink(&'static dyn Console);

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Registers the console that receives every kernel message.
///
/// Returns the previously registered console, if any.
pub fn set_console(console: &'static dyn Console) -> Option<&'static dyn Console> {
    let mut guard = CONSOLE.lock();
    let prev = guard.replace(console);
    guard.unlock();
    prev
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let guard = CONSOLE.lock();
    if let Some(console) = *guard {
        let _ = write!(Sink(console), "{fmt}");
    }
    guard.unlock();
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! info {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! debug {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG] {}\n", format_args!($($arg)*))} );
}
