//! Machine-recognized section markers inside journal notes.
//!
//! Every rewriteable region of a note is delimited by a marker pair:
//!
//! ```text
//! <!-- WHISPER_JOURNAL:TRANSCRIPT:START immutable -->
//! ...body...
//! <!-- WHISPER_JOURNAL:TRANSCRIPT:END -->
//! ```
//!
//! The parser is a line scan that collects sections and structural errors
//! without throwing; `parse_strict` fails when any error was collected.
//! Everything outside the markers is opaque and preserved byte-for-byte by
//! the writer's partial rewrites.

use std::ops::Range;

/// Literal prefix of every marker line. Compatibility-critical: existing
/// vaults contain these comments.
pub const MARKER_PREFIX: &str = "<!-- WHISPER_JOURNAL:";
const MARKER_SUFFIX: &str = "-->";

/// Flag marking a section that automated rewrites must not alter.
pub const FLAG_IMMUTABLE: &str = "immutable";
/// Flag marking a section produced by the LLM and safe to regenerate.
pub const FLAG_GENERATED: &str = "generated";

/// A parsed section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Uppercase section name (`[A-Z0-9_]+`).
    pub name: String,
    /// Body text between the markers, trimmed.
    pub body: String,
    /// Space-separated flags from the START marker, order preserved.
    /// Unknown flags are kept but ignored.
    pub flags: Vec<String>,
    /// Byte range of the raw body region (after the START line's newline,
    /// up to the beginning of the END line). Used for splicing.
    pub body_bytes: Range<usize>,
    /// 1-based line numbers of the START and END marker lines.
    pub marker_lines: (usize, usize),
}

impl Section {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// Structural problems found while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerErrorKind {
    /// A START marker was never closed.
    MissingEnd,
    /// An END marker appeared with no matching open START.
    MissingStart,
    /// A START marker appeared while another section was still open.
    InvalidNesting,
    /// The same section name was opened a second time.
    DuplicateSection,
}

impl MarkerErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingEnd => "missing_end",
            Self::MissingStart => "missing_start",
            Self::InvalidNesting => "invalid_nesting",
            Self::DuplicateSection => "duplicate_section",
        }
    }
}

/// One collected structural error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerError {
    pub kind: MarkerErrorKind,
    pub name: String,
    /// 1-based line number of the offending marker (or last line for
    /// `MissingEnd`).
    pub line: usize,
}

impl std::fmt::Display for MarkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, line {})", self.kind.as_str(), self.name, self.line)
    }
}

/// Result of a lenient parse: every recognizable section plus every error.
#[derive(Debug, Clone, Default)]
pub struct ParsedNote {
    pub sections: Vec<Section>,
    pub errors: Vec<MarkerError>,
}

impl ParsedNote {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Error returned by [`parse_strict`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("note markers are corrupt: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
pub struct CorruptMarkers(pub Vec<MarkerError>);

/// Render a START marker line.
pub fn start_marker(name: &str, flags: &[&str]) -> String {
    if flags.is_empty() {
        format!("{MARKER_PREFIX}{name}:START {MARKER_SUFFIX}")
    } else {
        format!("{MARKER_PREFIX}{name}:START {} {MARKER_SUFFIX}", flags.join(" "))
    }
}

/// Render an END marker line.
pub fn end_marker(name: &str) -> String {
    format!("{MARKER_PREFIX}{name}:END {MARKER_SUFFIX}")
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

enum MarkerLine<'a> {
    Start { name: &'a str, flags: Vec<String> },
    End { name: &'a str },
}

/// Recognize a marker line, if the line is one.
fn classify(line: &str) -> Option<MarkerLine<'_>> {
    let trimmed = line.trim();
    let inner = trimmed
        .strip_prefix(MARKER_PREFIX)?
        .strip_suffix(MARKER_SUFFIX)?
        .trim();

    let (name, rest) = inner.split_once(':')?;
    if !valid_name(name) {
        return None;
    }

    let mut tokens = rest.split_whitespace();
    match tokens.next()? {
        "START" => Some(MarkerLine::Start {
            name,
            flags: tokens.map(ToOwned::to_owned).collect(),
        }),
        "END" => Some(MarkerLine::End { name }),
        _ => None,
    }
}

/// Lenient line scan. Collects all sections and all structural errors.
pub fn parse(doc: &str) -> ParsedNote {
    let mut parsed = ParsedNote::default();
    let mut open: Option<(String, Vec<String>, usize, usize)> = None;
    let mut seen: Vec<String> = Vec::new();

    let mut offset = 0usize;
    let mut line_no = 0usize;
    for line in doc.split_inclusive('\n') {
        line_no += 1;
        let line_start = offset;
        offset += line.len();

        match classify(line) {
            Some(MarkerLine::Start { name, flags }) => {
                if open.is_some() {
                    parsed.errors.push(MarkerError {
                        kind: MarkerErrorKind::InvalidNesting,
                        name: name.to_owned(),
                        line: line_no,
                    });
                    continue;
                }
                if seen.iter().any(|s| s == name) {
                    parsed.errors.push(MarkerError {
                        kind: MarkerErrorKind::DuplicateSection,
                        name: name.to_owned(),
                        line: line_no,
                    });
                }
                open = Some((name.to_owned(), flags, line_no, offset));
            }
            Some(MarkerLine::End { name }) => match open.take() {
                Some((open_name, flags, start_line, body_start)) if open_name == name => {
                    seen.push(open_name.clone());
                    parsed.sections.push(Section {
                        name: open_name,
                        body: doc[body_start..line_start].trim().to_owned(),
                        flags,
                        body_bytes: body_start..line_start,
                        marker_lines: (start_line, line_no),
                    });
                }
                other => {
                    parsed.errors.push(MarkerError {
                        kind: MarkerErrorKind::MissingStart,
                        name: name.to_owned(),
                        line: line_no,
                    });
                    open = other;
                }
            },
            None => {}
        }
    }

    if let Some((name, _, start_line, _)) = open {
        parsed.errors.push(MarkerError {
            kind: MarkerErrorKind::MissingEnd,
            name,
            line: start_line,
        });
    }

    parsed
}

/// Strict parse: fails whenever the lenient scan collected any error.
pub fn parse_strict(doc: &str) -> Result<Vec<Section>, CorruptMarkers> {
    let parsed = parse(doc);
    if parsed.errors.is_empty() {
        Ok(parsed.sections)
    } else {
        Err(CorruptMarkers(parsed.errors))
    }
}

/// Replace the body of `section` inside `doc`, leaving every byte outside
/// the section's body region untouched.
pub fn splice_body(doc: &str, section: &Section, new_body: &str) -> String {
    let body = new_body.trim();
    let mut out = String::with_capacity(doc.len() + body.len());
    out.push_str(&doc[..section.body_bytes.start]);
    if !body.is_empty() {
        out.push_str(body);
        out.push('\n');
    }
    out.push_str(&doc[section.body_bytes.end..]);
    out
}
