//! Logging facade. Call sites use the `log` crate macros exactly like the
//! rest of the ecosystem; this module additionally keeps a bounded history
//! so the facade can offer a log viewer without re-reading a file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

/// Matches the original implementation's bound on retained history.
pub const MAX_HISTORY_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: log::Level,
    pub message: String,
    pub timestamp_ms: u128,
}

struct ChannelLogger {
    sender: Sender<LogEntry>,
    enabled: AtomicBool,
}

impl Log for ChannelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let _ = self.sender.send(LogEntry {
            level: record.level(),
            message: format!("{}", record.args()),
            timestamp_ms,
        });
    }

    fn flush(&self) {}
}

/// Bounded ring of drained log entries, mirroring the original `Log` class's
/// queue-then-drain design: `log::info!` etc. enqueue cheaply, a reader
/// drains the queue into history lazily.
pub struct LogHistory {
    receiver: Receiver<LogEntry>,
    history: Mutex<Vec<LogEntry>>,
}

static LOGGER_CELL: OnceCell<ChannelLogger> = OnceCell::new();
static HISTORY_CELL: OnceCell<LogHistory> = OnceCell::new();

/// Installs the global logger. Idempotent: subsequent calls are no-ops,
/// mirroring a single `com_logger::init()` call-site in a binary's startup.
pub fn init(level: LevelFilter) {
    HISTORY_CELL.get_or_init(|| {
        let (sender, receiver) = unbounded();
        let logger = LOGGER_CELL.get_or_init(|| ChannelLogger {
            sender,
            enabled: AtomicBool::new(true),
        });
        let _ = log::set_logger(logger);
        log::set_max_level(level);
        LogHistory {
            receiver,
            history: Mutex::new(Vec::new()),
        }
    });
}

impl LogHistory {
    fn drain_queue_to_history(&self) {
        let mut history = self.history.lock().unwrap();
        while let Ok(entry) = self.receiver.try_recv() {
            history.push(entry);
        }
        if history.len() > MAX_HISTORY_SIZE {
            let excess = history.len() - MAX_HISTORY_SIZE;
            history.drain(0..excess);
        }
    }

    pub fn collect(&self, max_entries: usize) -> Vec<LogEntry> {
        self.drain_queue_to_history();
        let history = self.history.lock().unwrap();
        let start = history.len().saturating_sub(max_entries);
        history[start..].to_vec()
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.drain_queue_to_history();
        self.history.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        while self.receiver.try_recv().is_ok() {}
        self.history.lock().unwrap().clear();
    }
}

/// Returns the process-wide log history, if `init` has been called.
pub fn history() -> Option<&'static LogHistory> {
    HISTORY_CELL.get()
}
