//! Byte-at-a-time scanning over an input buffer, shared by the manifest,
//! depfile, and dyndep parsers.
//!
//! Buffers must be nul-terminated so `peek` never needs a bounds check; the
//! parsers treat '\0' as end of input.

use std::path::Path;

#[derive(Debug)]
pub struct ParseError {
    message: String,
    ofs: usize,
}

pub type ParseResult<T> = Result<T, ParseError>;

pub struct Scanner<'a> {
    buf: &'a [u8],
    pub ofs: usize,
    pub line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        assert!(buf.ends_with(b"\0"), "scanner requires a nul-terminated buffer");
        Scanner { buf, ofs: 0, line: 1 }
    }

    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        // Safety: parsers only slice at character boundaries they have
        // already walked over.
        unsafe { std::str::from_utf8_unchecked(self.buf.get_unchecked(start..end)) }
    }

    pub fn peek(&self) -> char {
        self.buf[self.ofs] as char
    }

    pub fn peek_newline(&self) -> bool {
        if self.peek() == '\n' {
            return true;
        }
        if self.ofs + 1 >= self.buf.len() {
            return false;
        }
        self.peek() == '\r' && self.buf[self.ofs + 1] as char == '\n'
    }

    pub fn next(&mut self) {
        if self.peek() == '\n' {
            self.line += 1;
        }
        if self.ofs == self.buf.len() {
            panic!("scanned past end");
        }
        self.ofs += 1;
    }

    pub fn back(&mut self) {
        if self.ofs == 0 {
            panic!("back at start");
        }
        self.ofs -= 1;
        if self.peek() == '\n' {
            self.line -= 1;
        }
    }

    pub fn read(&mut self) -> char {
        let c = self.peek();
        self.next();
        c
    }

    pub fn skip(&mut self, ch: char) -> bool {
        if self.peek() == ch {
            self.next();
            return true;
        }
        false
    }

    pub fn skip_spaces(&mut self) {
        while self.skip(' ') {}
    }

    pub fn expect(&mut self, ch: char) -> ParseResult<()> {
        let r = self.read();
        if r != ch {
            self.back();
            return self.parse_error(format!("expected {:?}, got {:?}", ch, r));
        }
        Ok(())
    }

    pub fn parse_error<T, S: Into<String>>(&self, message: S) -> ParseResult<T> {
        Err(ParseError {
            message: message.into(),
            ofs: self.ofs,
        })
    }

    /// Render an error with filename:line context and a caret marking the
    /// offending column, trimming long lines to fit on screen.
    pub fn format_parse_error(&self, filename: &Path, err: ParseError) -> String {
        let mut line_start = 0;
        for (line_number, line) in self.buf.split(|&c| c == b'\n').enumerate() {
            if line_start + line.len() >= err.ofs {
                let mut msg = format!("parse error: {}\n", err.message);
                let prefix = format!("{}:{}: ", filename.display(), line_number + 1);
                msg.push_str(&prefix);

                let mut context = String::from_utf8_lossy(line).into_owned();
                let mut col = err.ofs - line_start;
                if col > 40 {
                    // Trim the head of the line to keep the caret on screen.
                    context.replace_range(..col - 20, "...");
                    col = 23;
                }
                if context.len() > 40 {
                    context.truncate(40);
                    context.push_str("...");
                }
                msg.push_str(&context);
                msg.push('\n');
                msg.push_str(&" ".repeat(prefix.len() + col));
                msg.push_str("^\n");
                return msg;
            }
            line_start += line.len() + 1;
        }
        panic!("parse error offset beyond input");
    }
}
