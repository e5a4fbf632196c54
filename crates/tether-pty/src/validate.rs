//! Input validation for bytes headed to a PTY.
//!
//! Client keystrokes are checked before they reach a process: oversized
//! payloads are refused, and a small set of terminal escape sequences that can
//! hijack the viewer's terminal (title bar, clipboard, device control strings,
//! key remapping, soft reset) are either rejected or stripped.
//!
//! Detection and removal use different patterns. Detection only needs the
//! sequence prefix; removal needs the whole sequence including its terminator
//! so that no partial garbage is left behind.

use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;

use nix::sys::signal::Signal;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

/// Default maximum size of a single input message.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 2048;

/// Categories of escape sequences that are never forwarded from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// OSC 0/1/2: set icon name / window title.
    TitleChange,
    /// OSC 52: write to the system clipboard.
    Clipboard,
    /// DCS: device control string.
    DeviceControl,
    /// `ESC [ code ; "string" p`: remap a key to a string.
    KeyRemap,
    /// DECSTR: terminal soft reset.
    SoftReset,
}

impl SequenceKind {
    pub const ALL: [SequenceKind; 5] = [
        SequenceKind::TitleChange,
        SequenceKind::Clipboard,
        SequenceKind::DeviceControl,
        SequenceKind::KeyRemap,
        SequenceKind::SoftReset,
    ];

    fn detect_pattern(self) -> &'static str {
        match self {
            SequenceKind::TitleChange => r"(?-u)\x1b\][012];",
            SequenceKind::Clipboard => r"(?-u)\x1b\]52;",
            SequenceKind::DeviceControl => r"(?-u)\x1bP",
            SequenceKind::KeyRemap => r#"(?-u)\x1b\[[0-9;]*""#,
            SequenceKind::SoftReset => r"(?-u)\x1b\[!p",
        }
    }

    fn remove_pattern(self) -> &'static str {
        match self {
            SequenceKind::TitleChange => r"(?-u)\x1b\][012];[^\x07\x1b]*(?:\x07|\x1b\\)",
            SequenceKind::Clipboard => r"(?-u)\x1b\]52;[^\x07\x1b]*(?:\x07|\x1b\\)",
            SequenceKind::DeviceControl => r"(?-u)\x1bP[^\x1b]*\x1b\\",
            SequenceKind::KeyRemap => r#"(?-u)\x1b\[[0-9;]*"[^"]*"[0-9;]*p"#,
            SequenceKind::SoftReset => r"(?-u)\x1b\[!p",
        }
    }

    fn index(self) -> usize {
        match self {
            SequenceKind::TitleChange => 0,
            SequenceKind::Clipboard => 1,
            SequenceKind::DeviceControl => 2,
            SequenceKind::KeyRemap => 3,
            SequenceKind::SoftReset => 4,
        }
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequenceKind::TitleChange => "title change",
            SequenceKind::Clipboard => "clipboard write",
            SequenceKind::DeviceControl => "device control string",
            SequenceKind::KeyRemap => "key remapping",
            SequenceKind::SoftReset => "terminal soft reset",
        };
        f.write_str(name)
    }
}

/// Reasons an input payload is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("input of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("input contains a forbidden {0} escape sequence")]
    DangerousSequence(SequenceKind),
}

struct Patterns {
    detect: Vec<Regex>,
    remove: Vec<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Constant patterns, exercised by the tests below.
        let compile = |p: &str| Regex::new(p).unwrap_or_else(|e| panic!("bad pattern {p}: {e}"));
        Patterns {
            detect: SequenceKind::ALL
                .iter()
                .map(|k| compile(k.detect_pattern()))
                .collect(),
            remove: SequenceKind::ALL
                .iter()
                .map(|k| compile(k.remove_pattern()))
                .collect(),
        }
    })
}

/// Stateless validator; safe to share between connections.
#[derive(Debug, Clone, Copy)]
pub struct InputValidator {
    max_bytes: usize,
}

impl InputValidator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Check a payload against the size cap and the forbidden sequence list.
    ///
    /// The size check runs first and applies regardless of content.
    pub fn validate(&self, data: &[u8]) -> Result<(), ValidationError> {
        if data.len() > self.max_bytes {
            return Err(ValidationError::TooLarge {
                len: data.len(),
                max: self.max_bytes,
            });
        }
        match find_dangerous(data) {
            Some(kind) => Err(ValidationError::DangerousSequence(kind)),
            None => Ok(()),
        }
    }

    /// Strip every complete forbidden sequence, terminator included.
    ///
    /// Everything else (cursor movement, colors, plain text) is left untouched.
    /// Returns the input borrowed when nothing was removed.
    pub fn sanitize<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]> {
        sanitize(data)
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INPUT_BYTES)
    }
}

/// Returns the first forbidden sequence kind whose prefix appears in `data`.
pub fn find_dangerous(data: &[u8]) -> Option<SequenceKind> {
    let patterns = patterns();
    SequenceKind::ALL
        .into_iter()
        .find(|kind| patterns.detect[kind.index()].is_match(data))
}

/// See [`InputValidator::sanitize`].
pub fn sanitize(data: &[u8]) -> Cow<'_, [u8]> {
    let patterns = patterns();
    let mut out: Cow<'_, [u8]> = Cow::Borrowed(data);
    for re in &patterns.remove {
        if re.is_match(&out) {
            let replaced = re.replace_all(&out, &b""[..]).into_owned();
            out = Cow::Owned(replaced);
        }
    }
    out
}

/// A control character a client may want delivered as a process signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlSignal {
    Interrupt,
    Eof,
    Suspend,
    Quit,
}

impl ControlSignal {
    /// The byte a terminal sends for this key (Ctrl-C, Ctrl-D, Ctrl-Z, Ctrl-\).
    pub fn byte(self) -> u8 {
        match self {
            ControlSignal::Interrupt => 0x03,
            ControlSignal::Eof => 0x04,
            ControlSignal::Suspend => 0x1a,
            ControlSignal::Quit => 0x1c,
        }
    }

    /// The OS signal this maps to. End-of-input has no signal; it is written
    /// to the PTY as a byte instead.
    pub fn signal(self) -> Option<Signal> {
        match self {
            ControlSignal::Interrupt => Some(Signal::SIGINT),
            ControlSignal::Eof => None,
            ControlSignal::Suspend => Some(Signal::SIGTSTP),
            ControlSignal::Quit => Some(Signal::SIGQUIT),
        }
    }
}

/// Map a single control byte to the signal it represents, if any.
pub fn classify_control_byte(byte: u8) -> Option<ControlSignal> {
    match byte {
        0x03 => Some(ControlSignal::Interrupt),
        0x04 => Some(ControlSignal::Eof),
        0x1a => Some(ControlSignal::Suspend),
        0x1c => Some(ControlSignal::Quit),
        _ => None,
    }
}
