//! Per-kernel sidecar config: lines of the form `"title" "options"`,
//! with standard backslash escaping inside the quoted strings.

use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarLine {
    pub title: String,
    pub options: String,
}

/// Pull one backslash-escaped quoted string starting at `chars[0]`
/// (which must be `"`). Returns the unescaped contents and how many
/// characters were consumed, including both quotes.
fn parse_quoted(text: &str) -> Option<(String, usize)> {
    let mut chars = text.char_indices();
    let (_, first) = chars.next()?;
    if first != '"' {
        return None;
    }
    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => return Some((out, i + c.len_utf8())),
            other => out.push(other),
        }
    }
    None
}

fn escape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Parse every non-comment, non-blank line as a `"title" "options"` pair.
/// Malformed lines are skipped and logged.
pub fn parse_lines(text: &str) -> Vec<SidecarLine> {
    let mut out = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((title, consumed)) = parse_quoted(line) else {
            log::warn!("skipping malformed sidecar line: {raw_line:?}");
            continue;
        };
        let rest = line[consumed..].trim_start();
        let Some((options, _)) = parse_quoted(rest) else {
            log::warn!("skipping malformed sidecar line: {raw_line:?}");
            continue;
        };
        out.push(SidecarLine { title, options });
    }
    out
}

/// Unquote a single leading `"..."` token (with backslash escaping),
/// ignoring anything after the closing quote. Used by callers that
/// need to pull a bare quoted value out of a `key "value"` directive
/// line rather than a full sidecar line.
pub fn parse_quoted_string(text: &str) -> Option<String> {
    parse_quoted(text.trim()).map(|(s, _)| s)
}

pub fn render_line(line: &SidecarLine) -> String {
    format!("{} {}", escape_quoted(&line.title), escape_quoted(&line.options))
}

const LOADER_CANDIDATES: &[&str] = &["vmlinuz-linux", "vmlinuz"];
const INITRD_CANDIDATES: &[&str] = &["initramfs-linux.img", "initrd.img"];

/// Infer loader and initrd paths by probing well-known filenames in
/// the sidecar's own directory. Neither is guessed if nothing matches.
pub fn infer_loader_initrd(dir: &Path) -> (Option<String>, Option<String>) {
    let loader = LOADER_CANDIDATES.iter().find(|name| dir.join(name).is_file()).map(|name| name.to_string());
    let initrd = INITRD_CANDIDATES.iter().find(|name| dir.join(name).is_file()).map(|name| name.to_string());
    (loader, initrd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_line() {
        let lines = parse_lines("\"Arch Linux\" \"root=UUID=1111 rw\"\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].title, "Arch Linux");
        assert_eq!(lines[0].options, "root=UUID=1111 rw");
    }

    #[test]
    fn handles_escaped_quotes() {
        let lines = parse_lines(r#""Title with \"quotes\"" "root=/dev/sda1""#);
        assert_eq!(lines[0].title, "Title with \"quotes\"");
    }

    #[test]
    fn skips_comments_and_blanks() {
        let text = "# a comment\n\n\"T\" \"O\"\n";
        assert_eq!(parse_lines(text).len(), 1);
    }

    #[test]
    fn render_round_trips_through_parse() {
        let line = SidecarLine {
            title: "Has \"quotes\" and \\backslash".to_string(),
            options: "root=UUID=1 rw".to_string(),
        };
        let rendered = render_line(&line);
        let parsed = parse_lines(&rendered);
        assert_eq!(parsed[0], line);
    }

    #[test]
    fn infers_loader_and_initrd_from_directory() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("vmlinuz-linux"), b"").unwrap();
        std::fs::write(td.path().join("initramfs-linux.img"), b"").unwrap();
        let (loader, initrd) = infer_loader_initrd(td.path());
        assert_eq!(loader.as_deref(), Some("vmlinuz-linux"));
        assert_eq!(initrd.as_deref(), Some("initramfs-linux.img"));
    }

    #[test]
    fn infers_nothing_when_no_candidates_present() {
        let td = tempfile::tempdir().unwrap();
        let (loader, initrd) = infer_loader_initrd(td.path());
        assert!(loader.is_none());
        assert!(initrd.is_none());
    }
}
