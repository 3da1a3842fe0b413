//! Reading and rewriting the `Main-Class` header of a jar manifest.
//!
//! Only the main section is considered. Everything outside the rewritten
//! header is kept byte for byte, including the original line endings.

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

const MAIN_CLASS: &str = "Main-Class";
const LINE_LIMIT: usize = 72;

/// A physical line: content span and the span including its line break.
#[derive(Debug, Clone, Copy)]
struct Line {
    start: usize,
    content_end: usize,
    end: usize,
}

/// A header in the main section, possibly continued over several lines.
#[derive(Debug)]
struct Header {
    name: String,
    value: String,
    start: usize,
    end: usize,
}

pub fn is_manifest(entry_name: &str) -> bool {
    entry_name.eq_ignore_ascii_case(MANIFEST_PATH)
}

/// The declared main class, in dotted form, if any.
pub fn main_class(manifest: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(manifest).ok()?;
    main_section(text)
        .into_iter()
        .find(|h| h.name.eq_ignore_ascii_case(MAIN_CLASS))
        .map(|h| h.value.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Replaces (or adds) the `Main-Class` header. Returns the input unchanged
/// when it is not valid UTF-8.
pub fn rewrite_main_class(manifest: &[u8], main_class: &str) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(manifest) else {
        return manifest.to_vec();
    };
    let newline = detect_newline(text);
    let header = wrap(&format!("{MAIN_CLASS}: {main_class}"), newline);

    let lines = split_lines(text);
    let headers = main_section(text);
    let mut out = String::with_capacity(text.len() + header.len() + 2);

    if let Some(existing) = headers.iter().find(|h| h.name.eq_ignore_ascii_case(MAIN_CLASS)) {
        out.push_str(&text[..existing.start]);
        out.push_str(&header);
        // keep the break that terminated the old header, if there was one
        let old_break = lines
            .iter()
            .find(|l| l.end == existing.end)
            .map(|l| &text[l.content_end..l.end])
            .unwrap_or("");
        out.push_str(old_break);
        out.push_str(&text[existing.end..]);
        return out.into_bytes();
    }

    // No header yet: append it to the end of the main section.
    let section_end = lines
        .iter()
        .find(|l| l.start == l.content_end)
        .map(|l| l.start)
        .unwrap_or(text.len());
    out.push_str(&text[..section_end]);
    if section_end > 0 && !text[..section_end].ends_with(['\n', '\r']) {
        out.push_str(newline);
    }
    out.push_str(&header);
    out.push_str(newline);
    out.push_str(&text[section_end..]);
    out.into_bytes()
}

fn detect_newline(text: &str) -> &'static str {
    match text.find(['\r', '\n']) {
        Some(i) if text[i..].starts_with("\r\n") => "\r\n",
        Some(i) if text[i..].starts_with('\r') => "\r",
        Some(_) => "\n",
        None => "\r\n",
    }
}

fn split_lines(text: &str) -> Vec<Line> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                let content_end = i;
                i += if bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                lines.push(Line { start, content_end, end: i });
                start = i;
            }
            b'\n' => {
                lines.push(Line { start, content_end: i, end: i + 1 });
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        lines.push(Line {
            start,
            content_end: bytes.len(),
            end: bytes.len(),
        });
    }
    lines
}

fn main_section(text: &str) -> Vec<Header> {
    let mut headers: Vec<Header> = Vec::new();
    for line in split_lines(text) {
        let content = &text[line.start..line.content_end];
        if content.is_empty() {
            break;
        }
        if let Some(continued) = content.strip_prefix(' ') {
            if let Some(header) = headers.last_mut() {
                header.value.push_str(continued);
                header.end = line.end;
            }
            continue;
        }
        let (name, value) = content.split_once(':').unwrap_or((content, ""));
        headers.push(Header {
            name: name.trim().to_string(),
            value: value.strip_prefix(' ').unwrap_or(value).to_string(),
            start: line.start,
            end: line.end,
        });
    }
    headers
}

/// Splits a header over 72-byte physical lines; continuation lines start
/// with a single space.
fn wrap(line: &str, newline: &str) -> String {
    let mut out = String::with_capacity(line.len() + 8);
    let mut rest = line;
    let mut first = true;
    loop {
        let limit = if first { LINE_LIMIT } else { LINE_LIMIT - 1 };
        if !first {
            out.push(' ');
        }
        if rest.len() <= limit {
            out.push_str(rest);
            return out;
        }
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&rest[..cut]);
        out.push_str(newline);
        rest = &rest[cut..];
        first = false;
    }
}
