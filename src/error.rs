//! Error types and protocol-error bookkeeping
//!
//! Protocol errors are almost always benign races with clients that are
//! going away, so they are classified for logging and otherwise ignored.
//! The exceptions are the conditions in [`CompositorError`], which end the
//! process.

use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Conditions the compositor cannot recover from
#[derive(Debug, Error)]
pub enum CompositorError {
    /// Another compositing manager already owns the display
    #[error("Another composite manager is already running ({0})")]
    AnotherCompositor(String),

    /// The renderer reported an error after presenting a frame
    #[error("Renderer error: {0}")]
    Renderer(String),

    /// The display connection failed
    #[error("Display connection error: {0}")]
    Connection(String),

    /// A required display extension is not available
    #[error("No {0} extension")]
    MissingExtension(&'static str),
}

/// Extension-relative protocol error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    BadRegion,
    BadDamage,
    BadPictFormat,
    BadPicture,
    BadPictOp,
    BadGlyphSet,
    BadGlyph,
}

impl ProtocolErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolErrorKind::BadRegion => "BadRegion",
            ProtocolErrorKind::BadDamage => "BadDamage",
            ProtocolErrorKind::BadPictFormat => "BadPictFormat",
            ProtocolErrorKind::BadPicture => "BadPicture",
            ProtocolErrorKind::BadPictOp => "BadPictOp",
            ProtocolErrorKind::BadGlyphSet => "BadGlyphSet",
            ProtocolErrorKind::BadGlyph => "BadGlyph",
        }
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// First error code of each extension whose errors we name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorBases {
    pub xfixes: Option<u8>,
    pub damage: Option<u8>,
    pub render: Option<u8>,
}

impl ErrorBases {
    /// Classify a raw error code against the extension bases.
    ///
    /// Later extensions win when ranges overlap, matching the order the
    /// categories are checked in: region, then damage, then picture family.
    pub fn classify(&self, error_code: u8) -> Option<ProtocolErrorKind> {
        let relative = |base: Option<u8>| base.and_then(|b| error_code.checked_sub(b));

        let mut kind = None;
        if relative(self.xfixes) == Some(0) {
            kind = Some(ProtocolErrorKind::BadRegion);
        }
        if relative(self.damage) == Some(0) {
            kind = Some(ProtocolErrorKind::BadDamage);
        }
        match relative(self.render) {
            Some(0) => kind = Some(ProtocolErrorKind::BadPictFormat),
            Some(1) => kind = Some(ProtocolErrorKind::BadPicture),
            Some(2) => kind = Some(ProtocolErrorKind::BadPictOp),
            Some(3) => kind = Some(ProtocolErrorKind::BadGlyphSet),
            Some(4) => kind = Some(ProtocolErrorKind::BadGlyph),
            _ => {}
        }
        kind
    }
}

/// A protocol error delivered by the display connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub serial: u64,
    pub error_code: u8,
    pub request_code: u8,
    pub minor_code: u16,
    /// Generic text supplied by the backend for unclassified codes
    pub generic_text: String,
    /// Set by the backend when the failing request was the compositing
    /// redirect of the root's children, i.e. another compositor owns it
    pub redirect_conflict: bool,
}

impl ProtocolError {
    /// Name used in logs: the classified category or the generic text
    pub fn describe(&self, bases: &ErrorBases) -> String {
        match bases.classify(self.error_code) {
            Some(kind) => kind.name().to_string(),
            None if !self.generic_text.is_empty() => self.generic_text.clone(),
            None => "unknown".to_string(),
        }
    }
}

/// Request serials whose errors are expected consequences of our own races
#[derive(Debug, Default)]
pub struct IgnoreList {
    serials: VecDeque<u64>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect (and swallow) an error for the request with `serial`
    pub fn set(&mut self, serial: u64) {
        self.serials.push_back(serial);
    }

    /// Drop every entry strictly older than `serial`
    pub fn discard_before(&mut self, serial: u64) {
        while let Some(&front) = self.serials.front() {
            if serial > front {
                self.serials.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn should_ignore(&mut self, serial: u64) -> bool {
        self.discard_before(serial);
        self.serials.front() == Some(&serial)
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}
