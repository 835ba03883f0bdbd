//! ANSI escape sequence stripping for captured subprocess output.
//!
//! Agent and check output is persisted to append-only log files; terminal
//! control sequences would corrupt them and confuse downstream parsers, so
//! every captured segment passes through [`strip_ansi`] first.

/// Remove ANSI escape sequences from a string.
///
/// Handles CSI sequences (`ESC [ ... <final>`), OSC sequences
/// (`ESC ] ... BEL` or `ESC ] ... ESC \`), and bare two-byte escapes.
/// Unrecognised bytes are passed through unchanged.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            // CSI: ESC [ <params> <final byte in @..~>
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: ESC ] ... terminated by BEL or ST (ESC \)
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            // Two-byte escape (ESC c, ESC 7, ...): drop the follower.
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }

    out
}
