//! Extraction of `#LOD` lines from a batch script.

/// Prefix that marks a Lustre-on-demand directive line.
pub const DIRECTIVE_PREFIX: &str = "#LOD";

/// Extract the `#LOD` directives from a batch script.
///
/// Only the leading comment block is scanned; the first non-comment line ends
/// the scan. Blank lines are skipped. A directive ending in `\` continues on
/// the next `#LOD` line, whose prefix is dropped. When the continued line
/// ended in whitespace, leading whitespace of the continuation is collapsed.
///
/// Returns the merged directives joined by `\n`, or `None` if the script has
/// no `#LOD` line.
pub fn extract_directives(script: &str) -> Option<String> {
    let mut merged = String::new();
    let mut continuing = false;
    let mut continued_with_space = false;

    for line in script.lines() {
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('#') {
            break;
        }
        if !line.starts_with(DIRECTIVE_PREFIX) {
            continuing = false;
            continue;
        }

        let mut text = line;
        if continuing {
            text = &text[DIRECTIVE_PREFIX.len()..];
            if continued_with_space {
                text = text.trim_start();
            }
        } else if !merged.is_empty() {
            merged.push('\n');
        }

        match text.strip_suffix('\\') {
            Some(stripped) => {
                continued_with_space = stripped.ends_with(char::is_whitespace);
                continuing = true;
                text = stripped;
            }
            None => continuing = false,
        }
        merged.push_str(text);
    }

    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}
