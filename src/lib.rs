//! Decode/emit bridge between a host program and a declarative instruction decoder.
//!
//! The host owns the bytes of the image under analysis and hands the bridge a
//! [`ByteSource`]. A [`DecodeEngine`](decoder::DecodeEngine) built from a
//! processor specification document pulls bytes on demand, decodes one
//! instruction at a time and pushes the result back through a [`PcodeSink`]
//! (micro-operations) or an [`AssemblySink`] (assembly text). Faults raised by
//! host callbacks during a decode are contained and reported as
//! [`DecodeError`] values.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use pcode_bridge::{
//!     decoder::DecodeEngine,
//!     emit::PcodeRecorder,
//!     image::MemoryImage,
//!     parser::DocumentStorage,
//! };
//!
//! // Load the processor specification
//! let text = fs::read_to_string("specs/toy16.xml").unwrap();
//! let storage = DocumentStorage::from_text(&text).unwrap();
//!
//! // Build an engine over a flat image loaded at 0
//! let image = MemoryImage::new(0, vec![0x10, 0x01]);
//! let mut engine = DecodeEngine::new(image, &storage).unwrap();
//!
//! // Decode one instruction and collect its micro-operations
//! let mut ops = PcodeRecorder::default();
//! let len = engine.decode_one(0, &mut ops).unwrap();
//! for op in ops.records() {
//!     println!("{}", op);
//! }
//! # let _ = len;
//! ```

pub mod space;
pub mod opcode;
pub mod parser;
pub mod language;
pub mod context;
pub mod emit;
pub mod decoder;
pub mod image;
pub mod format;
pub mod sweep;
mod large_tests;

pub use context::{ContextDatabase, ContextError, ContextField};
pub use decoder::DecodeEngine;
pub use language::{ConstructionError, Language};
pub use opcode::Opcode;
pub use parser::{DocumentError, DocumentStorage};
pub use space::{Address, AddressSpace, SpaceId, SpaceKind, Varnode, VarnodeData};

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 8;

/// Host-supplied byte supply.
///
/// The engine calls [`load_fill`](ByteSource::load_fill) synchronously while
/// it decodes, asking for exactly `buf.len()` bytes at `addr`. There is no
/// partial success: either the whole buffer is filled or an error is
/// returned.
pub trait ByteSource {
    /// Fill `buf` with the bytes stored at `addr`.
    fn load_fill(&mut self, buf: &mut [u8], addr: &Address<'_>) -> Result<(), ByteSourceError>;

    /// Rebase the source's notion of address zero by `adjust` bytes.
    fn adjust_vma(&mut self, _adjust: i64) {}
}

impl<T: ByteSource + ?Sized> ByteSource for &mut T {
    fn load_fill(&mut self, buf: &mut [u8], addr: &Address<'_>) -> Result<(), ByteSourceError> {
        (**self).load_fill(buf, addr)
    }

    fn adjust_vma(&mut self, adjust: i64) {
        (**self).adjust_vma(adjust)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Box<T> {
    fn load_fill(&mut self, buf: &mut [u8], addr: &Address<'_>) -> Result<(), ByteSourceError> {
        (**self).load_fill(buf, addr)
    }

    fn adjust_vma(&mut self, adjust: i64) {
        (**self).adjust_vma(adjust)
    }
}

/// Receiver of decoded micro-operations.
///
/// Called once per operation, in execution order. The varnodes borrow
/// engine-owned scratch storage and are only valid for the duration of the
/// call; copy them out (see [`Varnode::data`]) to keep them.
pub trait PcodeSink {
    fn dump(
        &mut self,
        address: &Address<'_>,
        opcode: Opcode,
        output: Option<&Varnode<'_>>,
        inputs: &[Varnode<'_>],
    );
}

/// Receiver of one assembly line per successful disassembly.
pub trait AssemblySink {
    fn dump(&mut self, address: &Address<'_>, mnemonic: &str, body: &str);
}

/// Failure reported by a [`ByteSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ByteSourceError {
    /// The requested range is not backed by the image
    #[error("{size} bytes at {offset:#x} are outside the image")]
    OutOfRange { offset: u64, size: usize },

    /// Any other host-side failure
    #[error("{0}")]
    Message(String),
}

/// Failure of a single decode or disassemble call.
///
/// None of these poison the engine; the next call starts from scratch.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The byte source could not supply the bytes the decoder needed
    #[error("Byte source failed for {size} bytes at {address:#x}: {source}")]
    ByteSource {
        address: u64,
        size: usize,
        #[source]
        source: ByteSourceError,
    },

    /// No encoding matches the bytes under the current context
    #[error("No instruction matches at {0:#x}")]
    NoMatch(u64),

    /// The offset does not fit in the code space's address width
    #[error("Offset {address:#x} is outside the {space} space")]
    OutOfSpace { address: u64, space: String },

    /// The address violates the processor's instruction alignment
    #[error("Address {address:#x} is not aligned to {alignment} bytes")]
    Misaligned { address: u64, alignment: u32 },

    /// An operand field selects a reserved value
    #[error("Operand '{field}' has reserved value {value:#x} at {address:#x}")]
    InvalidOperand {
        address: u64,
        field: String,
        value: u64,
    },

    /// A host callback panicked; the panic was caught at the engine boundary
    #[error("Callback fault at {address:#x}: {message}")]
    CallbackFault { address: u64, message: String },
}

impl DecodeError {
    /// Offset at which the failure was detected.
    pub fn address(&self) -> u64 {
        match self {
            DecodeError::ByteSource { address, .. }
            | DecodeError::OutOfSpace { address, .. }
            | DecodeError::Misaligned { address, .. }
            | DecodeError::InvalidOperand { address, .. }
            | DecodeError::CallbackFault { address, .. } => *address,
            DecodeError::NoMatch(address) => *address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Zeros {
        calls: usize,
        adjusted: i64,
    }

    impl ByteSource for Zeros {
        fn load_fill(&mut self, buf: &mut [u8], _addr: &Address<'_>) -> Result<(), ByteSourceError> {
            self.calls += 1;
            buf.fill(0);
            Ok(())
        }

        fn adjust_vma(&mut self, adjust: i64) {
            self.adjusted += adjust;
        }
    }

    fn fill_through<S: ByteSource>(mut src: S, space: &AddressSpace) -> Result<(), ByteSourceError> {
        let mut buf = [0xffu8; 4];
        src.load_fill(&mut buf, &Address::new(space, 0))?;
        src.adjust_vma(-4);
        assert_eq!(buf, [0; 4]);
        Ok(())
    }

    #[test]
    fn test_byte_source_forwarding() {
        let space = AddressSpace::new(SpaceId(1), "ram", SpaceKind::Processor, 4, 1, false);
        let mut zeros = Zeros { calls: 0, adjusted: 0 };

        fill_through(&mut zeros, &space).unwrap();
        assert_eq!(zeros.calls, 1);
        assert_eq!(zeros.adjusted, -4);

        let boxed: Box<dyn ByteSource> = Box::new(Zeros { calls: 0, adjusted: 0 });
        fill_through(boxed, &space).unwrap();
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::ByteSource {
            address: 0x10,
            size: 2,
            source: ByteSourceError::OutOfRange { offset: 0x10, size: 2 },
        };
        assert_eq!(
            err.to_string(),
            "Byte source failed for 2 bytes at 0x10: 2 bytes at 0x10 are outside the image"
        );
        assert_eq!(err.address(), 0x10);
        assert_eq!(DecodeError::NoMatch(0x20).address(), 0x20);
    }
}
