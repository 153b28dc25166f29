use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifying user agent sent with every request
pub const USER_AGENT: &str = concat!("heritage-loader/", env!("CARGO_PKG_VERSION"));

/// Page size for the element listing; large enough for the whole vocabulary
pub const ELEMENTS_PER_PAGE: u32 = 200;

/// Retries after the first attempt for transient failures
pub const MAX_RETRIES: u32 = 3;

/// First backoff step; doubles on each retry
pub const RETRY_BACKOFF_MS: u64 = 500;

/// Upper bound for a single backoff sleep (also caps Retry-After)
pub const RETRY_BACKOFF_MAX_SECS: u64 = 30;

/// HTTP statuses treated as transient
pub const RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Connectivity probe ceiling
pub const PROBE_TIMEOUT_SECS: u64 = 10;

pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Ceiling for any other request so a hung server cannot stall the batch
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default pause between item creations
pub const DEFAULT_DELAY_MS: u64 = 100;

/// How often the CLI drains the event queue
pub const DRAIN_INTERVAL_MS: u64 = 60;

/// Bytes read from the head of a CSV file when sniffing the delimiter
pub const SNIFF_SAMPLE_BYTES: usize = 2048;

/// Characters of the JSON payload shown by a single-row test
pub const PAYLOAD_PREVIEW_CHARS: usize = 300;

/// Dublin Core fields resolved for every row, in payload order
pub const DC_FIELDS: &[&str] = &[
    "Title",
    "Creator",
    "Subject",
    "Description",
    "Publisher",
    "Contributor",
    "Date",
    "Type",
    "Format",
    "Identifier",
    "Source",
    "Language",
    "Relation",
    "Coverage",
    "Rights",
];

/// Field that must exist in a healthy mapping
pub const REQUIRED_FIELD: &str = "Title";

pub const TAGS_FIELD: &str = "Tags";

/// File columns, in lookup order
pub const FILES_COLUMNS: &[&str] = &["Files (if available)", "Files"];

/// Element ids of a stock Omeka Classic install, used when the live listing is unavailable
pub const FALLBACK_ELEMENT_IDS: &[(&str, u64)] = &[
    ("Identifier", 43),
    ("Title", 50),
    ("Creator", 39),
    ("Contributor", 37),
    ("Subject", 49),
    ("Type", 51),
    ("Description", 41),
    ("Date", 40),
    ("Language", 44),
    ("Format", 42),
    ("Rights", 47),
    ("Publisher", 45),
    ("Relation", 46),
    ("Source", 48),
    ("Coverage", 38),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API base URL is not set")]
    MissingApiBase,

    #[error("API base URL is invalid: {0}")]
    InvalidApiBase(String),

    #[error("element mapping is empty; fetch element ids before uploading")]
    EmptyMapping,

    #[error("unknown language '{0}' (expected 'english' or 'spanish')")]
    UnknownLanguage(String),

    #[error("invalid delimiter '{0}' (expected auto, comma, semicolon, tab or a single character)")]
    InvalidDelimiter(String),
}

/// Which language-qualified column wins when both are filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Language {
    #[default]
    English,
    Spanish,
}

impl Language {
    /// Column suffix, e.g. `EN` for `Title (EN)`
    pub fn suffix(self) -> &'static str {
        match self {
            Language::English => "EN",
            Language::Spanish => "ES",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Language::English => Language::Spanish,
            Language::Spanish => Language::English,
        }
    }
}

impl FromStr for Language {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "english" | "en" => Ok(Language::English),
            "spanish" | "es" => Ok(Language::Spanish),
            other => Err(ConfigError::UnknownLanguage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelimiterChoice {
    #[default]
    Auto,
    Comma,
    Semicolon,
    Tab,
    Other(u8),
}

impl DelimiterChoice {
    /// The fixed byte, or `None` when the file has to be sniffed
    pub fn fixed(self) -> Option<u8> {
        match self {
            DelimiterChoice::Auto => None,
            DelimiterChoice::Comma => Some(b','),
            DelimiterChoice::Semicolon => Some(b';'),
            DelimiterChoice::Tab => Some(b'\t'),
            DelimiterChoice::Other(b) => Some(b),
        }
    }
}

impl FromStr for DelimiterChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DelimiterChoice::Auto),
            "comma" | "," => Ok(DelimiterChoice::Comma),
            "semicolon" | ";" => Ok(DelimiterChoice::Semicolon),
            "tab" | "\t" | "\\t" => Ok(DelimiterChoice::Tab),
            _ if s.len() == 1 && s.is_ascii() => Ok(DelimiterChoice::Other(s.as_bytes()[0])),
            _ => Err(ConfigError::InvalidDelimiter(s.to_string())),
        }
    }
}

/// Everything a batch run needs from its caller
#[derive(Clone)]
pub struct UploadConfig {
    pub api_base: String,
    pub api_key: String,
    pub language: Language,
    /// Send values containing markup as HTML instead of escaping them
    pub render_html: bool,
    pub public: bool,
    pub dry_run: bool,
    /// Maximum rows to process (0 = unlimited)
    pub limit: usize,
    pub delay_ms: u64,
    pub delimiter: DelimiterChoice,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            language: Language::English,
            render_html: true,
            public: true,
            dry_run: false,
            limit: 0,
            delay_ms: DEFAULT_DELAY_MS,
            delimiter: DelimiterChoice::Auto,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::MissingApiBase);
        }
        reqwest::Url::parse(self.api_base.trim())
            .map_err(|e| ConfigError::InvalidApiBase(e.to_string()))?;
        Ok(())
    }
}

// The key never reaches logs, even through `{:?}`.
impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("language", &self.language)
            .field("render_html", &self.render_html)
            .field("public", &self.public)
            .field("dry_run", &self.dry_run)
            .field("limit", &self.limit)
            .field("delay_ms", &self.delay_ms)
            .field("delimiter", &self.delimiter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_table_covers_every_dc_field() {
        assert_eq!(FALLBACK_ELEMENT_IDS.len(), 15);
        for field in DC_FIELDS {
            assert!(
                FALLBACK_ELEMENT_IDS.iter().any(|(name, _)| name == field),
                "missing fallback id for {field}"
            );
        }
    }

    #[test]
    fn language_parsing() {
        assert_eq!("english".parse::<Language>(), Ok(Language::English));
        assert_eq!("Spanish".parse::<Language>(), Ok(Language::Spanish));
        assert!("french".parse::<Language>().is_err());
        assert_eq!(Language::English.other(), Language::Spanish);
        assert_eq!(Language::Spanish.suffix(), "ES");
    }

    #[test]
    fn delimiter_parsing() {
        assert_eq!("auto".parse::<DelimiterChoice>(), Ok(DelimiterChoice::Auto));
        assert_eq!("Semicolon".parse::<DelimiterChoice>(), Ok(DelimiterChoice::Semicolon));
        assert_eq!("tab".parse::<DelimiterChoice>().unwrap().fixed(), Some(b'\t'));
        assert_eq!("|".parse::<DelimiterChoice>(), Ok(DelimiterChoice::Other(b'|')));
        assert!("pipe-ish".parse::<DelimiterChoice>().is_err());
        assert_eq!(DelimiterChoice::Auto.fixed(), None);
    }

    #[test]
    fn validate_requires_parseable_base() {
        let mut config = UploadConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::MissingApiBase));

        config.api_base = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidApiBase(_))));

        config.api_base = "https://example.org/api/".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_redacts_key() {
        let config = UploadConfig {
            api_key: "s3cret".to_string(),
            ..UploadConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
