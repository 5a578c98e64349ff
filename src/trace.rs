//! Chrome trace output (`-d trace`): emits a JSON event stream that
//! about:tracing or Perfetto can load, with one lane per parallel task.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        start: Instant,
        end: Instant,
    ) -> std::io::Result<()> {
        writeln!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {} }},",
            tid,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros()
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_complete("main", 0, start, Instant::now())?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    if let Ok(mut guard) = TRACE.lock() {
        *guard = Some(trace);
    }
    Ok(())
}

fn is_open() -> bool {
    matches!(TRACE.lock(), Ok(guard) if guard.is_some())
}

/// Time a region of work.  Cheap when tracing is off.
#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !is_open() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    if let Ok(mut guard) = TRACE.lock() {
        if let Some(trace) = guard.as_mut() {
            let _ = trace.write_complete(name, 0, start, end);
        }
    }
    result
}

/// Record a finished task's span in its lane.
pub fn task_span(name: &str, tid: usize, span: (Instant, Instant)) {
    if let Ok(mut guard) = TRACE.lock() {
        if let Some(trace) = guard.as_mut() {
            // Lane 0 is the driver; tasks start at 1.
            let _ = trace.write_complete(name, tid + 1, span.0, span.1);
        }
    }
}

pub fn close() -> std::io::Result<()> {
    if let Ok(mut guard) = TRACE.lock() {
        if let Some(trace) = guard.as_mut() {
            trace.close()?;
        }
        *guard = None;
    }
    Ok(())
}
