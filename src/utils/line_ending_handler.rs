use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEndingStyle {
    Lf,    // \n
    CrLf,  // \r\n
    Cr,    // \r
    Mixed,
    None,
}

/// Detects which line endings a chunk of remote output uses.
pub fn detect_line_ending(content: &str) -> LineEndingStyle {
    let bytes = content.as_bytes();
    let (mut lf, mut crlf, mut cr) = (0usize, 0usize, 0usize);
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' if bytes.get(i + 1) == Some(&b'\n') => {
                crlf += 1;
                i += 2;
                continue;
            }
            b'\r' => cr += 1,
            b'\n' => lf += 1,
            _ => {}
        }
        i += 1;
    }

    match (lf > 0, crlf > 0, cr > 0) {
        (false, false, false) => LineEndingStyle::None,
        (true, false, false) => LineEndingStyle::Lf,
        (false, true, false) => LineEndingStyle::CrLf,
        (false, false, true) => LineEndingStyle::Cr,
        _ => {
            debug!(lf, crlf, cr, "Mixed line endings in remote output");
            LineEndingStyle::Mixed
        }
    }
}

/// Splits one output payload into discrete lines, in order.
///
/// The editor sometimes batches several log lines into one output message;
/// callers always see one entry per line. A single trailing terminator does
/// not produce an empty last line, but blank lines in the middle are kept.
pub fn split_output_lines(text: &str) -> Vec<String> {
    if detect_line_ending(text) == LineEndingStyle::None {
        return vec![text.to_string()];
    }
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = normalized.strip_suffix('\n').unwrap_or(&normalized);
    trimmed.split('\n').map(str::to_string).collect()
}
