//! The decode engine: one instruction per call, results pushed to host sinks.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::context::{ContextDatabase, ContextError};
use crate::emit::{AssemblyEmitProxy, LoadImageProxy, PcodeEmitProxy};
use crate::language::{ConstructionError, Instruction, Language, ResolvedOp};
use crate::parser::DocumentStorage;
use crate::space::{Address, AddressSpace, Varnode, VarnodeData};
use crate::{AssemblySink, ByteSource, DecodeError, PcodeSink, MAX_INSTRUCTION_SIZE};

/// Owns a byte source, a processor context and a loaded language.
///
/// Every decode entry point contains faults: byte-source failures, unmatched
/// encodings and panics raised by host callbacks all come back as
/// [`DecodeError`], and the engine stays usable afterwards.
pub struct DecodeEngine<S: ByteSource> {
    source: S,
    language: Language,
    context: ContextDatabase,
    scratch: Vec<ResolvedOp>,
    fetched: [u8; MAX_INSTRUCTION_SIZE],
    fetched_len: usize,
}

impl<S: ByteSource> DecodeEngine<S> {
    /// Build an engine from the processor document registered in `storage`.
    pub fn new(source: S, storage: &DocumentStorage) -> Result<Self, ConstructionError> {
        let language = Language::from_storage(storage)?;
        Ok(Self::with_language(source, language))
    }

    /// Build an engine over an already validated language.
    pub fn with_language(source: S, language: Language) -> Self {
        let context = ContextDatabase::new(language.context_fields().to_vec());
        log::debug!("Created decode engine for {}", language);
        Self {
            source,
            language,
            context,
            scratch: Vec::new(),
            fetched: [0; MAX_INSTRUCTION_SIZE],
            fetched_len: 0,
        }
    }

    /// Decode the instruction at `offset` in the default code space and emit
    /// its micro-operations to `sink`, in execution order.
    ///
    /// Returns the instruction length in bytes. `offset` must lie inside the
    /// code space; larger values fail with [`DecodeError::OutOfSpace`].
    pub fn decode_one(&mut self, offset: u64, sink: &mut dyn PcodeSink) -> Result<usize, DecodeError> {
        let Self {
            source,
            language,
            context,
            scratch,
            fetched,
            fetched_len,
        } = self;
        *fetched_len = 0;

        contain(offset, || {
            let insn = fetch_instruction(language, context, source, offset, fetched)?;
            language.semantics(&insn, scratch)?;

            let addr = Address::new(language.default_code_space(), insn.start());
            let mut proxy = PcodeEmitProxy::new(sink, language);
            for op in scratch.iter() {
                proxy.dump(&addr, op);
            }
            *fetched_len = insn.length();
            Ok(insn.length())
        })
    }

    /// Disassemble the instruction at `offset` and emit one assembly line to `sink`.
    ///
    /// Returns the instruction length in bytes. Offsets are checked the same
    /// way as for [`decode_one`](Self::decode_one).
    pub fn disassemble_one(&mut self, offset: u64, sink: &mut dyn AssemblySink) -> Result<usize, DecodeError> {
        let Self {
            source,
            language,
            context,
            fetched,
            fetched_len,
            ..
        } = self;
        *fetched_len = 0;

        contain(offset, || {
            let insn = fetch_instruction(language, context, source, offset, fetched)?;
            let (mnemonic, body) = language.render(&insn)?;

            let addr = Address::new(language.default_code_space(), insn.start());
            AssemblyEmitProxy::new(sink).dump(&addr, &mnemonic, &body);
            *fetched_len = insn.length();
            Ok(insn.length())
        })
    }

    /// Encoding bytes of the instruction handled by the last successful
    /// decode call; empty after a failure.
    pub fn last_instruction_bytes(&self) -> &[u8] {
        &self.fetched[..self.fetched_len]
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    /// All address spaces, indexed by [`SpaceId`](crate::space::SpaceId).
    pub fn address_spaces(&self) -> &[AddressSpace] {
        self.language.spaces()
    }

    pub fn space_by_name(&self, name: &str) -> Option<&AddressSpace> {
        self.language.space_by_name(name)
    }

    pub fn default_code_space(&self) -> &AddressSpace {
        self.language.default_code_space()
    }

    /// Address of `offset` in the default code space.
    pub fn code_address(&self, offset: u64) -> Address<'_> {
        Address::new(self.language.default_code_space(), offset)
    }

    /// Storage of the named register.
    pub fn register_by_name(&self, name: &str) -> Option<Varnode<'_>> {
        let reg = self.language.register_by_name(name)?;
        let space = self.language.space(reg.varnode.space);
        Some(Varnode::new(Address::new(space, reg.varnode.offset), reg.varnode.size))
    }

    /// Name of the register stored exactly at `varnode`.
    pub fn register_name(&self, varnode: &VarnodeData) -> Option<&str> {
        self.language.register_name(varnode)
    }

    pub fn register_names(&self) -> impl Iterator<Item = &str> {
        self.language.registers().iter().map(|r| r.name.as_str())
    }

    pub fn context(&self) -> &ContextDatabase {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextDatabase {
        &mut self.context
    }

    /// Assign a context field from `offset` in the code space onward.
    pub fn set_context_variable(&mut self, name: &str, offset: u64, value: u32) -> Result<(), ContextError> {
        let addr = Address::new(self.language.default_code_space(), offset);
        self.context.set_variable(name, &addr, value)
    }

    /// Assign a context field over `[begin, end)` in the code space.
    pub fn set_context_region(&mut self, name: &str, begin: u64, end: u64, value: u32) -> Result<(), ContextError> {
        let space = self.language.default_code_space();
        self.context
            .set_variable_region(name, &Address::new(space, begin), &Address::new(space, end), value)
    }

    /// Value of a context field at `offset` in the code space.
    pub fn context_variable(&self, name: &str, offset: u64) -> Result<u32, ContextError> {
        self.context.get_variable(name, &self.code_address(offset))
    }

    pub fn byte_source(&self) -> &S {
        &self.source
    }

    pub fn byte_source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Drop the engine and hand the byte source back.
    pub fn into_byte_source(self) -> S {
        self.source
    }

    /// Forward a base-address adjustment to the byte source.
    pub fn adjust_vma(&mut self, adjust: i64) {
        log::debug!("Adjusting byte source base by {}", adjust);
        self.source.adjust_vma(adjust);
    }
}

impl<S: ByteSource> fmt::Debug for DecodeEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeEngine")
            .field("language", &self.language.name())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Match the instruction at `offset`, pulling only the bytes each candidate needs.
fn fetch_instruction<'l, S: ByteSource + ?Sized>(
    language: &'l Language,
    context: &ContextDatabase,
    source: &mut S,
    offset: u64,
    bytes: &mut [u8; MAX_INSTRUCTION_SIZE],
) -> Result<Instruction<'l>, DecodeError> {
    let code = language.default_code_space();
    if offset > code.highest() {
        return Err(DecodeError::OutOfSpace {
            address: offset,
            space: code.name().to_string(),
        });
    }
    let start = offset;
    let alignment = language.alignment();
    if start % alignment as u64 != 0 {
        return Err(DecodeError::Misaligned {
            address: start,
            alignment,
        });
    }

    let addr = Address::new(code, start);
    let ctx = context.snapshot(&addr);
    let mut loader = LoadImageProxy::new(source);
    let mut fetched = 0;

    for ctor in language.constructors() {
        if !ctor.context_matches(&ctx) {
            continue;
        }
        let len = ctor.length();
        if len > fetched {
            loader.fill(&mut bytes[fetched..len], &addr.add(fetched as u64))?;
            fetched = len;
        }
        let word = language.assemble_word(&bytes[..len]);
        if ctor.matches(word) {
            log::trace!("{} matched {} at {}", ctor.mnemonic(), ctor.length(), addr);
            return Ok(language.instantiate(ctor, word, start));
        }
    }
    Err(DecodeError::NoMatch(start))
}

/// Run one decode, converting a panic anywhere inside it into a `CallbackFault`.
fn contain<T>(offset: u64, f: impl FnOnce() -> Result<T, DecodeError>) -> Result<T, DecodeError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            log::debug!("Decode failed at {:#x}: {}", offset, err);
            Err(err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::warn!("Contained callback fault at {:#x}: {}", offset, message);
            Err(DecodeError::CallbackFault {
                address: offset,
                message,
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
