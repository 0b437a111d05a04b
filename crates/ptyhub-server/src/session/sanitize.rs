//! Control-byte filtering for command text written to a session's terminal.

/// Strip every byte below 0x20 except `\n`, `\r` and `\t`.
///
/// Everything else, including DEL and multi-byte UTF-8 sequences, passes
/// through unchanged. Applying it twice is the same as applying it once.
pub fn sanitize_command(text: &str) -> String {
    text.chars()
        .filter(|&c| c >= '\u{20}' || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}
