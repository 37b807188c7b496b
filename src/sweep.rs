//! Host-side linear sweep built on single-instruction decode.

use crate::decoder::DecodeEngine;
use crate::emit::{AssemblyRecorder, PcodeRecorder};
use crate::format::{DecodedInstruction, Listing, ListingEntry};
use crate::{ByteSource, DecodeError};

/// Decode up to `count` consecutive instructions starting at `start`.
///
/// A failed decode is recorded and the sweep resumes one alignment unit
/// later. The sweep stops early when the byte source has nothing at the
/// current address or the address leaves the code space.
pub fn linear_sweep<S: ByteSource>(
    engine: &mut DecodeEngine<S>,
    start: u64,
    count: usize,
    with_pcode: bool,
) -> Listing {
    let code = engine.default_code_space().clone();
    let step = u64::from(engine.language().alignment());
    let mut listing = Listing::new(engine.language().name(), code.name());
    let mut asm = AssemblyRecorder::default();
    let mut ops = PcodeRecorder::default();
    let mut addr = start;

    while listing.entries.len() < count {
        let result = engine.disassemble_one(addr, &mut asm).and_then(|len| {
            if with_pcode {
                ops.clear();
                engine.decode_one(addr, &mut ops)?;
            }
            Ok(len)
        });

        let len = match result {
            Ok(len) => len,
            Err(DecodeError::ByteSource { address, .. }) if address == addr => {
                log::debug!("Sweep reached the end of the image at {:#x}", addr);
                break;
            }
            Err(DecodeError::OutOfSpace { .. }) => {
                log::debug!("Sweep left the {} space at {:#x}", code.name(), addr);
                break;
            }
            Err(err) => {
                listing.entries.push(ListingEntry::Failed {
                    address: addr,
                    error: err.to_string(),
                });
                addr = addr.wrapping_add(step);
                continue;
            }
        };

        let bytes = engine.last_instruction_bytes().to_vec();
        let Some(assembly) = asm.take().pop() else {
            break;
        };
        listing.entries.push(ListingEntry::Decoded(DecodedInstruction {
            address: addr,
            length: len,
            bytes,
            assembly,
            pcode: ops.take(),
        }));
        addr = addr.wrapping_add(len as u64);
    }

    listing
}
