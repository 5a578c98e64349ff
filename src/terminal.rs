//! Terminal facts: whether stdout is a smart terminal, and how wide.

#[cfg(unix)]
mod imp {
    pub fn is_terminal() -> bool {
        // Safety: isatty on a constant fd.
        unsafe { libc::isatty(/* stdout */ 1) == 1 }
    }

    pub fn get_cols() -> Option<usize> {
        // Safety: ioctl writes into the zeroed winsize on success.
        unsafe {
            let mut winsize = std::mem::zeroed::<libc::winsize>();
            if libc::ioctl(0, libc::TIOCGWINSZ, &mut winsize) < 0 {
                return None;
            }
            if winsize.ws_col < 10 {
                // Ignore degenerate widths rather than elide to nothing.
                return None;
            }
            Some(winsize.ws_col as usize)
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub fn is_terminal() -> bool {
        false
    }

    pub fn get_cols() -> Option<usize> {
        None
    }
}

/// A terminal we can overprint status on: a tty, and TERM isn't "dumb".
pub fn is_smart_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) if term == "dumb" => return false,
        _ => {}
    }
    imp::is_terminal()
}

pub fn get_cols() -> Option<usize> {
    imp::get_cols()
}
