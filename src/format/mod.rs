//! Listing output formats for the host CLI

mod json;

pub use self::json::*;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::Serialize;

use crate::emit::{AssemblyRecord, PcodeRecord};

/// Errors raised while rendering a listing
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Supported output formats for decode listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    #[default]
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    JsonLines,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" | "json-lines" => Ok(OutputFormat::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::JsonLines]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ListingFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
        }
    }
}

/// One successfully decoded instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedInstruction {
    pub address: u64,
    pub length: usize,
    pub bytes: Vec<u8>,
    pub assembly: AssemblyRecord,
    /// Empty unless micro-operations were requested
    pub pcode: Vec<PcodeRecord>,
}

/// One step of a sweep over an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingEntry {
    Decoded(DecodedInstruction),
    Failed { address: u64, error: String },
}

impl ListingEntry {
    pub fn address(&self) -> u64 {
        match self {
            ListingEntry::Decoded(insn) => insn.address,
            ListingEntry::Failed { address, .. } => *address,
        }
    }
}

/// The result of a sweep, ready to be formatted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    /// Processor name
    pub language: String,
    /// Code space name
    pub space: String,
    pub entries: Vec<ListingEntry>,
}

impl Listing {
    pub fn new(language: impl Into<String>, space: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            space: space.into(),
            entries: Vec::new(),
        }
    }

    pub fn decoded_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ListingEntry::Decoded(_)))
            .count()
    }
}

/// Formatter trait for decode listings
pub trait ListingFormatter {
    fn format(&self, listing: &Listing) -> Result<String, FormatError>;
}

/// Format listings in plain text
pub struct TextFormatter;

/// Format listings in JSON
pub struct JsonFormatter;

/// Format listings in JSON Lines
pub struct JsonLinesFormatter;

pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl ListingFormatter for TextFormatter {
    fn format(&self, listing: &Listing) -> Result<String, FormatError> {
        let mut output = String::new();
        output.push_str(&format!("Listing for {} ({}):\n\n", listing.language, listing.space));

        for entry in &listing.entries {
            match entry {
                ListingEntry::Decoded(insn) => {
                    output.push_str(&format!(
                        "0x{:08x}: {:<24} ; {}\n",
                        insn.address,
                        insn.assembly.to_string(),
                        hex_bytes(&insn.bytes)
                    ));
                    for op in &insn.pcode {
                        output.push_str(&format!("            {}\n", op));
                    }
                }
                ListingEntry::Failed { address, error } => {
                    output.push_str(&format!("0x{:08x}: <invalid> ; {}\n", address, error));
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::emit::VarnodeRecord;
    use crate::opcode::Opcode;

    pub(crate) fn sample_listing() -> Listing {
        let reg = |offset| VarnodeRecord {
            space: "register".into(),
            offset,
            size: 2,
        };
        let mut listing = Listing::new("toy16", "ram");
        listing.entries.push(ListingEntry::Decoded(DecodedInstruction {
            address: 0x100,
            length: 2,
            bytes: vec![0x10, 0x10],
            assembly: AssemblyRecord {
                space: "ram".into(),
                address: 0x100,
                mnemonic: "mov".into(),
                body: "r1, r0".into(),
            },
            pcode: vec![PcodeRecord {
                address: 0x100,
                opcode: Opcode::Copy,
                output: Some(reg(2)),
                inputs: vec![reg(0)],
            }],
        }));
        listing.entries.push(ListingEntry::Failed {
            address: 0x102,
            error: "No instruction matches at 0x102".into(),
        });
        listing
    }

    #[test]
    fn test_text_formatter() {
        let result = TextFormatter.format(&sample_listing()).unwrap();

        assert!(result.starts_with("Listing for toy16 (ram):"));
        assert!(result.contains("0x00000100: mov r1, r0"));
        assert!(result.contains("; 10 10"));
        assert!(result.contains("(register, 0x2, 2) = COPY (register, 0x0, 2)"));
        assert!(result.contains("0x00000102: <invalid>"));
    }

    #[test]
    fn test_format_names() {
        for format in OutputFormat::available_formats() {
            assert_eq!(format.to_string().parse::<OutputFormat>(), Ok(*format));
            let _ = format.get_formatter();
        }
        assert!("csv".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::default(), OutputFormat::Text);
    }

    #[test]
    fn test_listing_helpers() {
        let listing = sample_listing();
        assert_eq!(listing.decoded_count(), 1);
        assert_eq!(listing.entries[1].address(), 0x102);
    }
}
