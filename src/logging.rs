//! Process-global logging
//!
//! Two sinks, each filtered by its own severity threshold: the console
//! (stderr, default `WARN`) and an optional file (default `INFO`, inactive
//! until a log path is configured). Thresholds are runtime-adjustable — the
//! debug observer lowers both to `TRACE` for its lifetime and restores the
//! prior values on drop.
//!
//! [`init`] is idempotent and is called by connection creation, so embedding
//! applications only need to touch this module to configure the file sink or
//! adjust thresholds.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Layer, Registry};

pub use tracing_subscriber::filter::LevelFilter;

/// Default console threshold
pub const DEFAULT_CONSOLE_LEVEL: LevelFilter = LevelFilter::WARN;
/// Default file threshold, applied once a log path is configured
pub const DEFAULT_FILE_LEVEL: LevelFilter = LevelFilter::INFO;

type FilterHandle = reload::Handle<LevelFilter, Registry>;

/// Shared writer slot for the file sink; writes are dropped until a file is
/// installed.
#[derive(Clone, Default)]
struct FileSink(Arc<Mutex<Option<File>>>);

struct FileSinkWriter(Arc<Mutex<Option<File>>>);

impl Write for FileSinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> fmt::MakeWriter<'a> for FileSink {
    type Writer = FileSinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FileSinkWriter(Arc::clone(&self.0))
    }
}

struct LogState {
    console_handle: FilterHandle,
    file_handle: FilterHandle,
    console_level: Mutex<LevelFilter>,
    file_level: Mutex<LevelFilter>,
    file_sink: FileSink,
    file_active: Mutex<bool>,
}

static STATE: OnceCell<LogState> = OnceCell::new();

/// Install the process-global subscriber. Idempotent; safe to call from
/// every connection constructor.
pub fn init() {
    STATE.get_or_init(|| {
        let (console_filter, console_handle) = reload::Layer::new(DEFAULT_CONSOLE_LEVEL);
        // The file layer exists from the start but filters everything out
        // until a path is configured.
        let (file_filter, file_handle) = reload::Layer::new(LevelFilter::OFF);
        let file_sink = FileSink::default();

        let layers = vec![
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(console_filter)
                .boxed(),
            fmt::layer()
                .with_writer(file_sink.clone())
                .with_ansi(false)
                .with_target(false)
                .with_filter(file_filter)
                .boxed(),
        ];
        // Another subscriber may already be installed (embedding application,
        // test harness); thresholds then have no effect but remain readable.
        let _ = tracing_subscriber::registry().with(layers).try_init();

        LogState {
            console_handle,
            file_handle,
            console_level: Mutex::new(DEFAULT_CONSOLE_LEVEL),
            file_level: Mutex::new(DEFAULT_FILE_LEVEL),
            file_sink,
            file_active: Mutex::new(false),
        }
    });
}

/// Current console severity threshold
pub fn console_level() -> LevelFilter {
    init();
    STATE
        .get()
        .map(|s| *s.console_level.lock())
        .unwrap_or(DEFAULT_CONSOLE_LEVEL)
}

/// Change the console severity threshold
pub fn set_console_level(level: LevelFilter) {
    init();
    if let Some(state) = STATE.get() {
        let mut current = state.console_level.lock();
        if *current == level {
            return;
        }
        *current = level;
        let _ = state.console_handle.reload(level);
    }
}

/// Current file severity threshold (applied once a log path is set)
pub fn file_level() -> LevelFilter {
    init();
    STATE
        .get()
        .map(|s| *s.file_level.lock())
        .unwrap_or(DEFAULT_FILE_LEVEL)
}

/// Change the file severity threshold
pub fn set_file_level(level: LevelFilter) {
    init();
    if let Some(state) = STATE.get() {
        let mut current = state.file_level.lock();
        if *current == level {
            return;
        }
        *current = level;
        if *state.file_active.lock() {
            let _ = state.file_handle.reload(level);
        }
    }
}

/// Activate the file sink, writing to the given path. The file threshold
/// (default `INFO`) takes effect from this point.
pub fn set_file_log(path: &Path) -> io::Result<()> {
    init();
    if let Some(state) = STATE.get() {
        let file = File::create(path)?;
        *state.file_sink.0.lock() = Some(file);
        *state.file_active.lock() = true;
        let _ = state.file_handle.reload(*state.file_level.lock());
    }
    Ok(())
}
