//! JSON and JSON Lines output formatters

use serde::Serialize;
use serde_json::json;

use super::{hex_bytes, FormatError, Listing, ListingEntry, ListingFormatter};
use crate::emit::PcodeRecord;

/// Serializable instruction for JSON output
#[derive(Serialize)]
struct InstructionJson<'a> {
    /// Address of the instruction
    address: String,
    /// Size of the instruction in bytes
    length: usize,
    mnemonic: &'a str,
    operands: &'a str,
    /// Bytes of the instruction as hex string
    bytes: String,
    #[serde(skip_serializing_if = "no_pcode")]
    pcode: &'a [PcodeRecord],
}

fn no_pcode(ops: &&[PcodeRecord]) -> bool {
    ops.is_empty()
}

/// Serializable decode failure for JSON output
#[derive(Serialize)]
struct FailureJson<'a> {
    address: String,
    error: &'a str,
}

/// Serializable listing for JSON output
#[derive(Serialize)]
struct ListingJson<'a> {
    language: &'a str,
    space: &'a str,
    instructions: Vec<InstructionJson<'a>>,
    failures: Vec<FailureJson<'a>>,
}

impl ListingFormatter for super::JsonFormatter {
    fn format(&self, listing: &Listing) -> Result<String, FormatError> {
        let mut result = ListingJson {
            language: &listing.language,
            space: &listing.space,
            instructions: Vec::new(),
            failures: Vec::new(),
        };

        for entry in &listing.entries {
            match entry {
                ListingEntry::Decoded(insn) => result.instructions.push(InstructionJson {
                    address: format!("0x{:x}", insn.address),
                    length: insn.length,
                    mnemonic: &insn.assembly.mnemonic,
                    operands: &insn.assembly.body,
                    bytes: hex_bytes(&insn.bytes),
                    pcode: &insn.pcode,
                }),
                ListingEntry::Failed { address, error } => result.failures.push(FailureJson {
                    address: format!("0x{:x}", address),
                    error,
                }),
            }
        }

        Ok(serde_json::to_string_pretty(&result)?)
    }
}

impl ListingFormatter for super::JsonLinesFormatter {
    fn format(&self, listing: &Listing) -> Result<String, FormatError> {
        let mut output = String::new();

        for entry in &listing.entries {
            let line = match entry {
                ListingEntry::Decoded(insn) => json!({
                    "type": "instruction",
                    "language": listing.language,
                    "address": format!("0x{:x}", insn.address),
                    "length": insn.length,
                    "mnemonic": insn.assembly.mnemonic,
                    "operands": insn.assembly.body,
                    "bytes": hex_bytes(&insn.bytes),
                    "pcode": insn.pcode,
                }),
                ListingEntry::Failed { address, error } => json!({
                    "type": "failure",
                    "language": listing.language,
                    "address": format!("0x{:x}", address),
                    "error": error,
                }),
            };
            output.push_str(&serde_json::to_string(&line)?);
            output.push('\n');
        }

        Ok(output)
    }
}
