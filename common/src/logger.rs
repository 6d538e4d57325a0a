use conquer_once::spin::OnceCell;
use core::fmt::Write;
use sp_boot_config::LevelFilter;
use spinning_top::Spinlock;

/// The global logger instance used for the `log` crate.
pub static LOGGER: OnceCell<LockedLogger> = OnceCell::uninit();

/// A text sink that can be shared by every core of the partition.
pub type Sink = dyn Write + Send;

/// A logger instance protected by a spinlock.
pub struct LockedLogger {
    sink: Spinlock<&'static mut Sink>,
}

impl LockedLogger {
    /// Create a new instance that logs to the given sink, usually a UART.
    pub fn new(sink: &'static mut Sink) -> Self {
        Self {
            sink: Spinlock::new(sink),
        }
    }
}

impl log::Log for LockedLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut sink = self.sink.lock();
        // nowhere to report a failing sink
        let _ = writeln!(sink, "{:5}: {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`] with `sink` as the `log` backend and applies `level`.
///
/// Fails if a logger was installed before; `sink` is unused in that case.
pub fn init_logger(
    sink: &'static mut Sink,
    level: LevelFilter,
) -> Result<(), log::SetLoggerError> {
    let logger = LOGGER.get_or_init(move || LockedLogger::new(sink));
    log::set_logger(logger)?;
    log::set_max_level(convert_level(level));
    log::info!("logger initialized at level {:?}", level);
    Ok(())
}

pub fn convert_level(level: LevelFilter) -> log::LevelFilter {
    match level {
        LevelFilter::Off => log::LevelFilter::Off,
        LevelFilter::Error => log::LevelFilter::Error,
        LevelFilter::Warn => log::LevelFilter::Warn,
        LevelFilter::Info => log::LevelFilter::Info,
        LevelFilter::Debug => log::LevelFilter::Debug,
        LevelFilter::Trace => log::LevelFilter::Trace,
    }
}
