//! Process-wide log sink
//!
//! Host apps register one callback that receives each formatted log line.
//! The sink is write-once; later registrations are ignored. Until a sink is
//! registered, lines go to stderr.

use std::io::{self, Write};

use once_cell::sync::OnceCell;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

type Sink = Box<dyn Fn(&str) + Send + Sync>;

static SINK: OnceCell<Sink> = OnceCell::new();

/// Register the log sink. Returns false if one was already registered.
pub fn set_sink<F>(sink: F) -> bool
where
    F: Fn(&str) + Send + Sync + 'static,
{
    SINK.set(Box::new(sink)).is_ok()
}

pub fn has_sink() -> bool {
    SINK.get().is_some()
}

/// Send one line to the sink, or stderr without one
pub fn emit(line: &str) {
    match SINK.get() {
        Some(sink) => sink(line),
        None => eprintln!("{}", line),
    }
}

/// Install the global subscriber at `filter` (an `EnvFilter` directive such
/// as "info" or "blocka_engine=debug").
///
/// Returns false if a subscriber is already installed or the directive is
/// malformed.
pub fn init(filter: &str) -> bool {
    let Ok(filter) = EnvFilter::try_new(filter) else {
        return false;
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(SinkMakeWriter)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .try_init()
        .is_ok()
}

/// Route panic messages to the sink.
///
/// The previous hook still runs afterwards.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        emit(&format!("panic: {}", info));
        previous(info);
    }));
}

#[derive(Debug, Clone, Copy)]
struct SinkMakeWriter;

impl<'a> MakeWriter<'a> for SinkMakeWriter {
    type Writer = LineWriter<fn(&str)>;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter::new(emit as fn(&str))
    }
}

/// Buffers bytes and hands out complete lines
struct LineWriter<F: FnMut(&str)> {
    buf: Vec<u8>,
    out: F,
}

impl<F: FnMut(&str)> LineWriter<F> {
    fn new(out: F) -> Self {
        Self {
            buf: Vec::new(),
            out,
        }
    }

    fn emit_lines(&mut self, flush_partial: bool) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            (self.out)(String::from_utf8_lossy(&line[..pos]).trim_end());
        }
        if flush_partial && !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            (self.out)(String::from_utf8_lossy(&rest).trim_end());
        }
    }
}

impl<F: FnMut(&str)> Write for LineWriter<F> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.emit_lines(false);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_lines(true);
        Ok(())
    }
}

impl<F: FnMut(&str)> Drop for LineWriter<F> {
    fn drop(&mut self) {
        self.emit_lines(true);
    }
}
