//! Kernel log writing to the debug console of QEMU and Bochs (port `0xe9`).

use log::LevelFilter;

/// Level used when the command line does not contain a `log=<level>` option.
pub const DEFAULT_LEVEL: LevelFilter = if cfg!(debug_assertions) {
    LevelFilter::Trace
} else {
    LevelFilter::Info
};

/// Finds the `log=<level>` option of a kernel command line.
pub fn level_from_command_line(command_line: &str) -> Option<LevelFilter> {
    command_line
        .split_ascii_whitespace()
        .filter_map(|word| word.strip_prefix("log="))
        .last()
        .and_then(|level| level.parse().ok())
}

#[cfg(bare_metal)]
pub use sink::initialize_kernel_log;

#[cfg(bare_metal)]
mod sink {
    use core::fmt::Write;
    use log::{LevelFilter, Metadata, Record};

    use crate::arch::io::Port;

    /// Global instance of the kernel logger.
    static LOGGER: KernelLog = KernelLog;

    pub fn initialize_kernel_log(level: LevelFilter) {
        // Only fails if a logger is installed already, which then stays in charge.
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    }

    struct KernelLog;

    impl log::Log for KernelLog {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                let _ = writeln!(
                    DebugWriter,
                    "[{:<5} {}] {}",
                    record.level(),
                    record.target(),
                    record.args()
                );
            }
        }

        fn flush(&self) {}
    }

    struct DebugWriter;

    impl Write for DebugWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for c in s.bytes() {
                Port(0xe9).write_u8(c);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_option() {
        assert_eq!(
            level_from_command_line("root=/dev/hda log=debug quiet"),
            Some(LevelFilter::Debug)
        );
        assert_eq!(level_from_command_line("log=WARN"), Some(LevelFilter::Warn));
        assert_eq!(level_from_command_line("log=off"), Some(LevelFilter::Off));
    }

    #[test]
    fn last_option_wins() {
        assert_eq!(
            level_from_command_line("log=trace log=error"),
            Some(LevelFilter::Error)
        );
    }

    #[test]
    fn ignores_garbage() {
        assert_eq!(level_from_command_line("log=loud"), None);
        assert_eq!(level_from_command_line("syslog=debug"), None);
        assert_eq!(level_from_command_line(""), None);
    }
}
