use std::{io::Write, time::Instant};

use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Writes records from the listed module prefixes to stderr, stamped with the time
/// since startup, so they don't interleave with the REPL's stdout.
pub struct Logger {
    max_level: LevelFilter,
    targets: Vec<String>,
    started: Instant,
}

pub fn init(level: LevelFilter, targets: Vec<String>) -> Result<(), SetLoggerError> {
    log::set_max_level(level);
    log::set_boxed_logger(Box::new(Logger::new(level, targets)))
}

impl Logger {
    pub fn new(max_level: LevelFilter, targets: Vec<String>) -> Self {
        Self {
            max_level,
            targets,
            started: Instant::now(),
        }
    }

    fn wants(&self, module: Option<&str>) -> bool {
        match module {
            Some(module) => self.targets.iter().any(|t| module.starts_with(t.as_str())),
            None => false,
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) || !self.wants(record.module_path()) {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f32();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{elapsed:>8.3} {:<5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_listed_modules_are_logged() {
        let logger = Logger::new(LevelFilter::Debug, vec!["meshroom".into()]);
        assert!(logger.wants(Some("meshroom_wrtc::room_impl::router")));
        assert!(logger.wants(Some("meshroom::config")));
        assert!(!logger.wants(Some("webrtc_ice::agent")));
        assert!(!logger.wants(None));
    }
}
