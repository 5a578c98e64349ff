//! Build status reporting: the progress line, per-edge start/finish output,
//! and the line printer that overprints on smart terminals.
//!
//! The progress line format comes from `NINJA_STATUS` (default `[%f/%t] `):
//! `%s` started, `%t` total, `%r` running, `%u` unstarted, `%f` finished,
//! `%o` overall rate, `%c` recent rate, `%p` percent, `%e` elapsed seconds.

use crate::graph::{EdgeId, State};
use crate::terminal;
use std::collections::VecDeque;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum Verbosity {
    Quiet,
    NoStatusUpdate,
    Normal,
    Verbose,
}

/// Callbacks the driver raises as the build progresses.
pub trait Status {
    fn plan_has_total_edges(&mut self, total: usize);
    fn build_edge_started(&mut self, state: &State, edge: EdgeId, start_time_ms: i64);
    fn build_edge_finished(
        &mut self,
        state: &State,
        edge: EdgeId,
        end_time_ms: i64,
        success: bool,
        output: &[u8],
    );
    fn build_started(&mut self);
    fn build_finished(&mut self);
    /// A line that must survive status overprinting.
    fn info(&mut self, msg: &str);
}

/// Elide the middle of a string to fit a width, marking the cut with "...".
pub fn elide_middle(text: &str, width: usize) -> String {
    match width {
        0 => return String::new(),
        1 => return ".".to_owned(),
        2 => return "..".to_owned(),
        3 => return "...".to_owned(),
        _ => {}
    }
    if text.len() <= width {
        return text.to_owned();
    }
    const MARGIN: usize = 3; // Space for "...".
    let elide_size = (width - MARGIN) / 2;
    let tail = elide_size + (width - MARGIN) % 2;
    format!(
        "{}...{}",
        &text[..elide_size],
        &text[text.len() - tail..]
    )
}

/// Drop ANSI escape sequences, for output sinks that can't render them.
pub fn strip_ansi_escape_codes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != 0x1b {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        // Skip "\x1b[...<letter>" sequences, or a lone escape.
        i += 1;
        if i < bytes.len() && bytes[i] == b'[' {
            i += 1;
            while i < bytes.len() && !bytes[i].is_ascii_alphabetic() {
                i += 1;
            }
            i += 1;
        }
    }
    out
}

#[derive(Clone, Copy, PartialEq)]
enum LineType {
    Full,
    Elide,
}

/// Prints lines, overprinting the previous one on smart terminals.  While
/// the console is locked (handed to a console-pool edge), everything is
/// buffered and replayed on unlock.
struct LinePrinter {
    smart_terminal: bool,
    supports_color: bool,
    /// Whether the caret is at the start of a blank line.
    have_blank_line: bool,
    console_locked: bool,
    /// Buffered current-status line while the console is locked.
    line_buffer: Option<(String, LineType)>,
    /// Buffered passthrough output while the console is locked.
    output_buffer: String,
}

impl LinePrinter {
    fn new() -> Self {
        let smart_terminal = terminal::is_smart_terminal();
        let supports_color = smart_terminal || std::env::var_os("CLICOLOR_FORCE").is_some_and(|v| v != "0");
        LinePrinter {
            smart_terminal,
            supports_color,
            have_blank_line: true,
            console_locked: false,
            line_buffer: None,
            output_buffer: String::new(),
        }
    }

    fn is_smart_terminal(&self) -> bool {
        self.smart_terminal
    }

    fn set_smart_terminal(&mut self, smart: bool) {
        self.smart_terminal = smart;
    }

    fn supports_color(&self) -> bool {
        self.supports_color
    }

    /// Overprints the current line.  If type is Elide, the line may be
    /// shortened to fit the terminal width.
    fn print(&mut self, line: String, line_type: LineType) {
        if self.console_locked {
            self.line_buffer = Some((line, line_type));
            return;
        }

        let mut stdout = std::io::stdout();
        if self.smart_terminal && line_type == LineType::Elide {
            let line = match terminal::get_cols() {
                Some(width) => elide_middle(&line, width),
                None => line,
            };
            // Overprint: return to column 0, write, clear to end of line.
            let _ = write!(stdout, "\r{}\x1b[K", line);
            self.have_blank_line = false;
        } else {
            let _ = if self.smart_terminal {
                writeln!(stdout, "\r{}", line)
            } else {
                writeln!(stdout, "{}", line)
            };
            self.have_blank_line = true;
        }
        let _ = stdout.flush();
    }

    fn print_or_buffer(&mut self, text: &str) {
        if self.console_locked {
            self.output_buffer.push_str(text);
        } else {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    }

    /// Prints a string on a new line, not overprinting the progress status.
    fn print_on_new_line(&mut self, text: &str) {
        if self.console_locked {
            if let Some((line, _)) = self.line_buffer.take() {
                self.output_buffer.push_str(&line);
                self.output_buffer.push('\n');
            }
        }
        if !self.have_blank_line {
            self.print_or_buffer("\n");
        }
        if !text.is_empty() {
            self.print_or_buffer(text);
        }
        self.have_blank_line = text.is_empty() || text.ends_with('\n');
    }

    /// While locked, the console belongs to a running task; our own output
    /// is buffered until unlock.
    fn set_console_locked(&mut self, locked: bool) {
        if locked == self.console_locked {
            return;
        }
        if locked {
            self.print_on_new_line("");
        }
        self.console_locked = locked;
        if !locked {
            let buffered = std::mem::take(&mut self.output_buffer);
            self.print_on_new_line(&buffered);
            if let Some((line, line_type)) = self.line_buffer.take() {
                self.print(line, line_type);
            }
        }
    }
}

/// Finished-edges-per-second over the last few completions.
struct SlidingRateInfo {
    rate: f64,
    window: usize,
    last_update: isize,
    times: VecDeque<f64>,
}

impl SlidingRateInfo {
    fn new(window: usize) -> Self {
        SlidingRateInfo {
            rate: -1.0,
            window: window.max(1),
            last_update: -1,
            times: VecDeque::new(),
        }
    }

    fn update(&mut self, update_hint: usize, time_millis: i64) {
        if update_hint as isize == self.last_update {
            return;
        }
        self.last_update = update_hint as isize;
        if self.times.len() == self.window {
            self.times.pop_front();
        }
        self.times.push_back(time_millis as f64 / 1e3);
        if let (Some(&front), Some(&back)) = (self.times.front(), self.times.back()) {
            if back != front {
                self.rate = self.times.len() as f64 / (back - front);
            }
        }
    }
}

fn format_rate(rate: f64) -> String {
    if rate <= 0.0 {
        "?".to_owned()
    } else {
        format!("{:.1}", rate)
    }
}

pub const DEFAULT_STATUS_FORMAT: &str = "[%f/%t] ";

pub struct StatusPrinter {
    verbosity: Verbosity,
    printer: LinePrinter,
    progress_status_format: String,
    started_edges: usize,
    finished_edges: usize,
    total_edges: usize,
    running_edges: usize,
    time_millis: i64,
    current_rate: SlidingRateInfo,
}

impl StatusPrinter {
    pub fn new(verbosity: Verbosity, parallelism: usize) -> Self {
        let mut printer = LinePrinter::new();
        // Don't do any fancy overprinting outside normal mode.
        if verbosity != Verbosity::Normal {
            printer.set_smart_terminal(false);
        }
        let progress_status_format = std::env::var("NINJA_STATUS")
            .unwrap_or_else(|_| DEFAULT_STATUS_FORMAT.to_owned());
        StatusPrinter {
            verbosity,
            printer,
            progress_status_format,
            started_edges: 0,
            finished_edges: 0,
            total_edges: 0,
            running_edges: 0,
            time_millis: 0,
            current_rate: SlidingRateInfo::new(parallelism),
        }
    }

    /// Expand the `NINJA_STATUS`-style placeholders.
    fn format_progress_status(&mut self, format: &str, time_millis: i64) -> String {
        let mut out = String::new();
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                Some('s') => out.push_str(&self.started_edges.to_string()),
                Some('t') => out.push_str(&self.total_edges.to_string()),
                Some('r') => out.push_str(&self.running_edges.to_string()),
                Some('u') => out.push_str(
                    &self
                        .total_edges
                        .saturating_sub(self.started_edges)
                        .to_string(),
                ),
                Some('f') => out.push_str(&self.finished_edges.to_string()),
                Some('o') => {
                    let rate = if time_millis > 0 {
                        self.finished_edges as f64 / (time_millis as f64 / 1e3)
                    } else {
                        -1.0
                    };
                    out.push_str(&format_rate(rate));
                }
                Some('c') => {
                    self.current_rate.update(self.finished_edges, time_millis);
                    out.push_str(&format_rate(self.current_rate.rate));
                }
                Some('p') => {
                    let percent = if self.total_edges > 0 {
                        100 * self.finished_edges / self.total_edges
                    } else {
                        0
                    };
                    out.push_str(&format!("{:3}%", percent));
                }
                Some('e') => out.push_str(&format!("{:.3}", time_millis as f64 / 1e3)),
                Some(other) => {
                    // An unknown placeholder; leave it visible rather than die.
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }

    fn print_status(&mut self, state: &State, edge: EdgeId, time_millis: i64) {
        if self.verbosity == Verbosity::Quiet || self.verbosity == Verbosity::NoStatusUpdate {
            return;
        }
        let force_full_command = self.verbosity == Verbosity::Verbose;
        let e = state.edges.get(edge);
        let mut to_print = e.description.clone().unwrap_or_default();
        if to_print.is_empty() || force_full_command {
            to_print = e.cmdline.clone().unwrap_or_default();
        }
        let format = std::mem::take(&mut self.progress_status_format);
        let prefix = self.format_progress_status(&format, time_millis);
        self.progress_status_format = format;
        self.printer.print(
            format!("{}{}", prefix, to_print),
            if force_full_command {
                LineType::Full
            } else {
                LineType::Elide
            },
        );
    }
}

impl Status for StatusPrinter {
    fn plan_has_total_edges(&mut self, total: usize) {
        self.total_edges = total;
    }

    fn build_edge_started(&mut self, state: &State, edge: EdgeId, start_time_ms: i64) {
        self.started_edges += 1;
        self.running_edges += 1;
        self.time_millis = start_time_ms;
        let use_console = state.edges.get(edge).use_console;
        if use_console || self.printer.is_smart_terminal() {
            self.print_status(state, edge, start_time_ms);
        }
        if use_console {
            self.printer.set_console_locked(true);
        }
    }

    fn build_edge_finished(
        &mut self,
        state: &State,
        edge: EdgeId,
        end_time_ms: i64,
        success: bool,
        output: &[u8],
    ) {
        self.time_millis = end_time_ms;
        self.finished_edges += 1;

        let use_console = state.edges.get(edge).use_console;
        if use_console {
            self.printer.set_console_locked(false);
        }
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        if !use_console {
            self.print_status(state, edge, end_time_ms);
        }
        self.running_edges -= 1;

        // Print the command that is spewing before printing its output.
        if !success {
            let e = state.edges.get(edge);
            let outputs: String = e
                .outputs
                .iter()
                .map(|&o| format!("{} ", state.node_path(o)))
                .collect();
            if self.printer.supports_color() {
                self.printer
                    .print_on_new_line(&format!("\x1b[31mFAILED: \x1b[0m{}\n", outputs));
            } else {
                self.printer
                    .print_on_new_line(&format!("FAILED: {}\n", outputs));
            }
            self.printer
                .print_on_new_line(&format!("{}\n", e.cmdline.as_deref().unwrap_or("")));
        }

        if !output.is_empty() {
            // Subprocess output may carry color codes; strip them when our
            // own sink can't render them.
            let text = String::from_utf8_lossy(output);
            let final_output = if !self.printer.supports_color() {
                strip_ansi_escape_codes(&text)
            } else {
                text.into_owned()
            };
            self.printer.print_on_new_line(&final_output);
        }
    }

    fn build_started(&mut self) {
        self.started_edges = 0;
        self.finished_edges = 0;
        self.running_edges = 0;
    }

    fn build_finished(&mut self) {
        self.printer.set_console_locked(false);
        self.printer.print_on_new_line("");
    }

    fn info(&mut self, msg: &str) {
        self.printer.print_on_new_line(&format!("{}\n", msg));
    }
}

/// A Status that swallows everything; used by tools and tests.
#[derive(Default)]
pub struct SilentStatus;

impl Status for SilentStatus {
    fn plan_has_total_edges(&mut self, _total: usize) {}
    fn build_edge_started(&mut self, _state: &State, _edge: EdgeId, _start_time_ms: i64) {}
    fn build_edge_finished(
        &mut self,
        _state: &State,
        _edge: EdgeId,
        _end_time_ms: i64,
        _success: bool,
        _output: &[u8],
    ) {
    }
    fn build_started(&mut self) {}
    fn build_finished(&mut self) {}
    fn info(&mut self, _msg: &str) {}
}
