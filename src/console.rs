// Kernel console: bounded capture buffer plus an optional serial sink
use conquer_once::spin::OnceCell;
use core::fmt::{self, Write};
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use crate::process::Runtime;

/// Bytes of console output kept in memory
const CAPTURE_SIZE: usize = 16 * 1024;

pub struct Console {
    capture: [u8; CAPTURE_SIZE],
    head: usize,
    len: usize,
    serial: Option<SerialPort>,
}

impl Console {
    const fn new() -> Self {
        Self {
            capture: [0; CAPTURE_SIZE],
            head: 0,
            len: 0,
            serial: None,
        }
    }

    fn push(&mut self, byte: u8) {
        let tail = (self.head + self.len) % CAPTURE_SIZE;
        self.capture[tail] = byte;
        if self.len == CAPTURE_SIZE {
            // Full: overwrite the oldest byte.
            self.head = (self.head + 1) % CAPTURE_SIZE;
        } else {
            self.len += 1;
        }
    }

    /// Copy of the captured output, oldest byte first
    pub fn captured(&self) -> alloc::vec::Vec<u8> {
        (0..self.len)
            .map(|i| self.capture[(self.head + i) % CAPTURE_SIZE])
            .collect()
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.push(byte);
        }
        if let Some(serial) = self.serial.as_mut() {
            serial.write_str(s)?;
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref CONSOLE: Mutex<Console> = Mutex::new(Console::new());
}

/// Masks interrupts while `CONSOLE` is held; trap handlers print too.
static RUNTIME: OnceCell<&'static dyn Runtime> = OnceCell::uninit();

/// Take the console lock with interrupts off through `runtime` from now on.
pub fn attach_runtime(runtime: &'static dyn Runtime) {
    // The first runtime stays.
    let _ = RUNTIME.try_init_once(|| runtime);
}

fn masked<R>(runtime: Option<&dyn Runtime>, f: impl FnOnce() -> R) -> R {
    match runtime {
        Some(runtime) => {
            runtime.push_off();
            let result = f();
            runtime.pop_off();
            result
        }
        None => f(),
    }
}

fn with_console<R>(f: impl FnOnce(&mut Console) -> R) -> R {
    masked(RUNTIME.get().copied(), || f(&mut CONSOLE.lock()))
}

/// Start mirroring console output to the 16550 UART at `base`.
///
/// # Safety
/// `base` must be the I/O port of a present 16550 and the caller must run with
/// I/O privilege.
pub unsafe fn attach_serial(base: u16) {
    let mut port = SerialPort::new(base);
    port.init();
    with_console(|console| console.serial = Some(port));
}

/// Everything printed so far (bounded by the capture size)
pub fn captured() -> alloc::string::String {
    let bytes = with_console(|console| console.captured());
    alloc::string::String::from_utf8_lossy(&bytes).into_owned()
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Console writes never fail on the capture path.
    let _ = with_console(|console| console.write_fmt(args));
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRuntime;

    #[test]
    fn capture_keeps_newest_bytes() {
        let mut console = Console::new();
        for _ in 0..CAPTURE_SIZE {
            console.push(b'a');
        }
        console.write_str("xyz").unwrap();
        let out = console.captured();
        assert_eq!(out.len(), CAPTURE_SIZE);
        assert_eq!(&out[CAPTURE_SIZE - 3..], b"xyz");
    }

    #[test]
    fn console_lock_is_taken_with_interrupts_off() {
        let runtime = ScriptedRuntime::new();
        runtime.enable_interrupts();
        let enabled_inside = masked(Some(&runtime), || runtime.interrupts_enabled());
        assert!(!enabled_inside);
        assert!(runtime.interrupts_enabled());
        assert_eq!(runtime.depth(), 0);
    }

    #[test]
    fn formatted_lines_land_in_capture() {
        let mut console = Console::new();
        writeln!(console, "[TEST] console line {}", 42).unwrap();
        console.clear();
        writeln!(console, "[TEST] second").unwrap();
        assert_eq!(console.captured(), b"[TEST] second\n");
    }
}
