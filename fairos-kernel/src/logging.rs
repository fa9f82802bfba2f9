use core::fmt;

/// Destination for formatted log output.
pub type Sink = fn(fmt::Arguments);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
struct SerialPortWriter(u16);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl fmt::Write for SerialPortWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut port = x86_64::instructions::port::Port::new(self.0);

        for c in s.bytes() {
            unsafe {
                port.write(c);
            }
        }

        Ok(())
    }
}

/// Write to COM1.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn serial_sink(args: fmt::Arguments) {
    use fmt::Write;

    let _ = SerialPortWriter(0x3f8).write_fmt(args);
}

/// Formats records as `[file:line] LEVEL: message` into a [`Sink`].
pub struct Logger {
    sink: Sink,
}

impl Logger {
    pub const fn new(sink: Sink) -> Self {
        Self { sink }
    }
}

/// Install `logger` as the global logger.
///
/// Returns false if a logger was already installed.
pub fn init(logger: &'static Logger, level: log::LevelFilter) -> bool {
    let installed = log::set_logger(logger).is_ok();
    if installed {
        log::set_max_level(level);
    }
    installed
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            (self.sink)(format_args!(
                "[{}:{}] {}: {}\n",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            ));
        }
    }

    fn flush(&self) {
        // nothing
    }
}
