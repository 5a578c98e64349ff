//! Lexical path canonicalization.
//!
//! Collapses "." and ".." components and duplicate slashes without touching
//! the disk.  Node paths are canonicalized on entry to the graph so that a
//! file mentioned under two spellings maps to a single node.

/// Canonicalize a path in place.
/// "foo/./bar" => "foo/bar"; "foo/../bar" => "bar"; "foo//bar" => "foo/bar".
/// A path that collapses to nothing becomes "." (e.g. "foo/.."), with the
/// exception of "/", which becomes empty.
pub fn canonicalize_path_in_place(path: &mut String) {
    let bytes = path.as_bytes();
    let end = bytes.len();
    if end == 0 {
        return;
    }

    let mut out: Vec<u8> = Vec::with_capacity(end);
    // Start offsets of the components currently in `out`, so ".." can back up.
    let mut components: Vec<usize> = Vec::new();
    let mut src = 0;

    if bytes[0] == b'/' {
        out.push(b'/');
        src = 1;
    }

    while src < end {
        if bytes[src] == b'.' {
            if src + 1 == end || bytes[src + 1] == b'/' {
                // "." component; eliminate.
                src += 2;
                continue;
            }
            if bytes[src + 1] == b'.' && (src + 2 == end || bytes[src + 2] == b'/') {
                // ".." component.  Back up if possible.
                match components.pop() {
                    Some(ofs) => out.truncate(ofs),
                    None => {
                        out.extend_from_slice(b"..");
                        if src + 2 != end {
                            out.push(b'/');
                        }
                    }
                }
                src += 3;
                continue;
            }
            // A component that merely starts with a dot; fall through.
        }

        if bytes[src] == b'/' {
            src += 1;
            continue;
        }

        components.push(out.len());
        while src < end && bytes[src] != b'/' {
            out.push(bytes[src]);
            src += 1;
        }
        if src < end {
            out.push(b'/');
            src += 1;
        }
    }

    if out.is_empty() {
        out.push(b'.');
    } else if out.last() == Some(&b'/') {
        out.pop();
    }

    // Safety: `out` is a concatenation of complete substrings of the valid
    // UTF-8 input plus ASCII '/', '.', so it is valid UTF-8.
    *path = unsafe { String::from_utf8_unchecked(out) };
}

#[must_use]
pub fn canon_path(path: impl Into<String>) -> String {
    let mut path = path.into();
    canonicalize_path_in_place(&mut path);
    path
}
