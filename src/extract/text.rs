//! Text recovery from fetched bodies.
//!
//! Detection looks at the content type first and magic bytes second, so a
//! PDF served as `application/octet-stream` still lands on the PDF path.
//! Extraction is best effort: a PDF with no recoverable text yields an empty
//! string, which is the signal the OCR gate keys on.

use std::io::Read;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Content category driving the extraction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Pdf,
    Zip,
    Json,
    Html,
    Text,
    Binary,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Pdf => "pdf",
            DocKind::Zip => "zip",
            DocKind::Json => "json",
            DocKind::Html => "html",
            DocKind::Text => "text",
            DocKind::Binary => "binary",
        }
    }
}

pub fn detect_kind(content_type: Option<&str>, body: &[u8]) -> DocKind {
    let ctype = content_type.unwrap_or("").to_lowercase();
    if ctype.contains("pdf") || body.starts_with(b"%PDF") {
        return DocKind::Pdf;
    }
    if ctype.contains("zip") || body.starts_with(b"PK") {
        return DocKind::Zip;
    }
    if ctype.contains("json") {
        return DocKind::Json;
    }
    if ctype.contains("html") {
        return DocKind::Html;
    }
    if ctype.contains("text/") || ctype.contains("xml") {
        return DocKind::Text;
    }
    DocKind::Binary
}

/// Char-boundary-safe prefix of at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

fn decode_lossy(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(s) => s.to_string(),
        // latin-1: every byte maps to the code point of the same value
        Err(_) => body.iter().map(|&b| b as char).collect(),
    }
}

fn script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script.*?</script>").unwrap())
}

fn style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<style.*?</style>").unwrap())
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn strip_html(raw: &str) -> String {
    let no_script = script_re().replace_all(raw, " ");
    let no_style = style_re().replace_all(&no_script, " ");
    let no_tags = tag_re().replace_all(&no_style, " ");
    ws_re().replace_all(&no_tags, " ").trim().to_string()
}

/// In-process extractor first, layout-aware subprocess second. Empty output
/// is deliberate: it routes the document to the OCR gate.
fn extract_pdf(body: &[u8], max_chars: usize) -> String {
    match pdf_extract::extract_text_from_mem(body) {
        Ok(text) if !text.trim().is_empty() => return truncate_chars(text.trim(), max_chars),
        Ok(_) => {}
        Err(e) => debug!(error = %e, "pdf_extract failed, trying pdftotext"),
    }
    match pdftotext(body) {
        Some(text) if !text.trim().is_empty() => truncate_chars(text.trim(), max_chars),
        _ => String::new(),
    }
}

fn pdftotext(body: &[u8]) -> Option<String> {
    let dir = tempfile::TempDir::new().ok()?;
    let in_pdf = dir.path().join("in.pdf");
    std::fs::write(&in_pdf, body).ok()?;
    let output = Command::new("pdftotext")
        .args(["-layout", "-enc", "UTF-8"])
        .arg(&in_pdf)
        .arg("-")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

fn extract_zip(body: &[u8], max_chars: usize) -> String {
    let cursor = std::io::Cursor::new(body);
    let mut archive = match zip::ZipArchive::new(cursor) {
        Ok(a) => a,
        Err(_) => return String::new(),
    };
    let names: Vec<String> = archive
        .file_names()
        .filter(|n| n.to_lowercase().ends_with(".pdf"))
        .map(String::from)
        .collect();
    if names.is_empty() {
        return String::new();
    }
    let mut parts: Vec<String> = Vec::new();
    let mut total = 0usize;
    for name in names {
        let mut member = match archive.by_name(&name) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mut pdf_bytes = Vec::new();
        if member.read_to_end(&mut pdf_bytes).is_err() {
            continue;
        }
        let txt = extract_text(&pdf_bytes, Some("application/pdf"), max_chars);
        if !txt.is_empty() {
            let block = format!("[FILE] {}\n{}", name, txt);
            total += block.chars().count();
            parts.push(block);
            if total >= max_chars {
                break;
            }
        }
    }
    truncate_chars(parts.join("\n\n").trim(), max_chars)
}

fn extract_json(body: &[u8], max_chars: usize) -> String {
    let raw = decode_lossy(body);
    // Value objects sort keys, so pretty printing is canonical
    let txt = match serde_json::from_str::<Value>(&raw) {
        Ok(obj) => serde_json::to_string_pretty(&obj).unwrap_or(raw),
        Err(_) => raw,
    };
    truncate_chars(&txt, max_chars)
}

/// Extract text from a fetched body according to its detected kind.
pub fn extract_text(body: &[u8], content_type: Option<&str>, max_chars: usize) -> String {
    if body.is_empty() {
        return String::new();
    }
    match detect_kind(content_type, body) {
        DocKind::Zip => extract_zip(body, max_chars),
        DocKind::Json => extract_json(body, max_chars),
        DocKind::Html => truncate_chars(&strip_html(&decode_lossy(body)), max_chars),
        DocKind::Text => truncate_chars(&decode_lossy(body), max_chars),
        DocKind::Pdf => extract_pdf(body, max_chars),
        DocKind::Binary => truncate_chars(
            &format!(
                "[BINARY] content_type={} bytes={}",
                content_type.unwrap_or("unknown"),
                body.len()
            ),
            max_chars,
        ),
    }
}

/// First PDF member of a zip archive, for the OCR path.
pub fn zip_first_pdf(body: &[u8]) -> Option<Vec<u8>> {
    if !body.starts_with(b"PK") {
        return None;
    }
    let cursor = std::io::Cursor::new(body);
    let mut archive = zip::ZipArchive::new(cursor).ok()?;
    let name = archive
        .file_names()
        .find(|n| n.to_lowercase().ends_with(".pdf"))
        .map(String::from)?;
    let mut member = archive.by_name(&name).ok()?;
    let mut out = Vec::new();
    member.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Printable in the `str.isprintable` sense: not a control, format,
/// private-use or separator character, ASCII space excepted. Unassigned
/// code points are not detectable without category tables and pass through.
fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    // Cc plus every separator (Zs/Zl/Zp and the whitespace controls)
    if c.is_control() || c.is_whitespace() {
        return false;
    }
    // Cf (format) and Co (private use)
    !matches!(
        c,
        '\u{00AD}'
            | '\u{0600}'..='\u{0605}'
            | '\u{061C}'
            | '\u{06DD}'
            | '\u{070F}'
            | '\u{08E2}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
            | '\u{110BD}'
            | '\u{110CD}'
            | '\u{1BCA0}'..='\u{1BCA3}'
            | '\u{1D173}'..='\u{1D17A}'
            | '\u{E0001}'
            | '\u{E0020}'..='\u{E007F}'
            | '\u{E000}'..='\u{F8FF}'
            | '\u{F0000}'..='\u{FFFFD}'
            | '\u{100000}'..='\u{10FFFD}'
    )
}

/// `printable_ratio × (alnum_ratio + 0.1)`, rounded to 4 decimals, in [0, 1].
pub fn text_quality(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let printable = text.chars().filter(|c| is_printable(*c)).count();
    let alnum = text.chars().filter(|c| c.is_alphanumeric()).count();
    let pr = printable as f64 / total as f64;
    let ar = alnum as f64 / total as f64;
    let score = (pr * (ar + 0.1)).min(1.0);
    (score * 10_000.0).round() / 10_000.0
}

/// Sliding-window chunks of `size` chars with `overlap` carried between
/// neighbors. Size floors at 200; overlap clamps to `[0, size - 1]`.
pub fn segment_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let size = size.max(200);
    let overlap = overlap.min(size - 1);
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut segs = Vec::new();
    let mut start = 0usize;
    while start < n {
        let end = (start + size).min(n);
        let seg: String = chars[start..end].iter().collect();
        let seg = seg.trim().to_string();
        if !seg.is_empty() {
            segs.push(seg);
        }
        if end >= n {
            break;
        }
        start = end - overlap;
    }
    segs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_magic_bytes() {
        assert_eq!(detect_kind(None, b"%PDF-1.7 rest"), DocKind::Pdf);
        assert_eq!(detect_kind(None, b"PK\x03\x04zip"), DocKind::Zip);
        assert_eq!(detect_kind(Some("application/octet-stream"), b"%PDF"), DocKind::Pdf);
        assert_eq!(detect_kind(Some("application/json"), b"{}"), DocKind::Json);
        assert_eq!(detect_kind(Some("text/html"), b"<p>"), DocKind::Html);
        assert_eq!(detect_kind(Some("text/plain"), b"oi"), DocKind::Text);
        assert_eq!(detect_kind(None, b"\x00\x01"), DocKind::Binary);
    }

    #[test]
    fn html_strip_removes_script_and_tags() {
        let html = b"<html><head><style>p{}</style></head>\
            <body><script>var x=1;</script><p>Edital  de licita\xc3\xa7\xc3\xa3o</p></body></html>";
        let out = extract_text(html, Some("text/html"), 1000);
        assert_eq!(out, "Edital de licita\u{e7}\u{e3}o");
    }

    #[test]
    fn json_pretty_prints_sorted() {
        let out = extract_text(br#"{"b":1,"a":2}"#, Some("application/json"), 1000);
        let a_pos = out.find("\"a\"").unwrap();
        let b_pos = out.find("\"b\"").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn binary_stub_records_type_and_size() {
        let out = extract_text(&[0u8, 1, 2], Some("application/x-thing"), 1000);
        assert_eq!(out, "[BINARY] content_type=application/x-thing bytes=3");
    }

    #[test]
    fn latin1_fallback_decodes() {
        // 0xE7 is ç in latin-1 and invalid as a lone utf-8 byte
        let out = extract_text(&[b'l', b'i', b'c', b'i', b't', b'a', 0xE7], Some("text/plain"), 100);
        assert_eq!(out, "licita\u{e7}");
    }

    #[test]
    fn quality_bounds() {
        assert_eq!(text_quality(""), 0.0);
        let q = text_quality("abcdefghij1234567890");
        assert!((0.9..=1.0).contains(&q), "{}", q);
        let noisy: String = std::iter::repeat('\u{0001}').take(50).collect();
        assert!(text_quality(&noisy) < 0.2);
    }

    #[test]
    fn quality_counts_format_and_separator_chars_as_unprintable() {
        // ascii space is printable, nbsp / zwsp / soft hyphen are not
        let clean = text_quality("um texto limpo");
        let nbsp = "um\u{00A0}texto\u{00A0}limpo";
        let zwsp = "um\u{200B}texto\u{00AD}limpo";
        assert!(text_quality(nbsp) < clean);
        assert!(text_quality(zwsp) < clean);
        // private-use glyph noise from bad OCR drags the score down
        let pua: String = std::iter::repeat('\u{E123}').take(50).collect();
        assert!(text_quality(&pua) < 0.2);
    }

    #[test]
    fn segments_cover_text_with_overlap() {
        let text: String = std::iter::repeat('x').take(450).collect();
        let segs = segment_text(&text, 200, 50);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].len(), 200);
        // windows advance by size - overlap
        assert_eq!(segs[1].len(), 200);
        assert_eq!(segs[2].len(), 150);
    }

    #[test]
    fn segment_size_floors_at_200() {
        let text: String = std::iter::repeat('y').take(300).collect();
        let segs = segment_text(&text, 10, 5);
        assert_eq!(segs[0].len(), 200);
    }

    #[test]
    fn truncate_is_char_safe() {
        let s = "ação";
        assert_eq!(truncate_chars(s, 2), "aç");
        assert_eq!(truncate_chars(s, 10), "ação");
    }
}
