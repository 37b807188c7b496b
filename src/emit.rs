//! Proxies between the engine and host callbacks, plus recording sinks.
//!
//! The proxies turn the engine's resolved representation into the borrowed
//! records the [`PcodeSink`] and [`AssemblySink`] traits receive. They do not
//! buffer or reorder anything: every call is forwarded synchronously.
//!
//! [`PcodeRecorder`] and [`AssemblyRecorder`] are ready-made sinks that copy
//! each record into owned, serializable form.

use std::fmt;

use serde::Serialize;

use crate::language::{Language, ResolvedOp};
use crate::opcode::Opcode;
use crate::space::{Address, Varnode, VarnodeData};
use crate::{AssemblySink, ByteSource, DecodeError, PcodeSink};

/// Forwards byte requests to a [`ByteSource`].
pub(crate) struct LoadImageProxy<'a, S: ?Sized> {
    source: &'a mut S,
}

impl<'a, S: ByteSource + ?Sized> LoadImageProxy<'a, S> {
    pub(crate) fn new(source: &'a mut S) -> Self {
        Self { source }
    }

    /// Fill all of `buf` from `addr`; on failure the buffer is zeroed.
    pub(crate) fn fill(&mut self, buf: &mut [u8], addr: &Address<'_>) -> Result<(), DecodeError> {
        log::trace!("load_fill {} bytes at {}", buf.len(), addr);
        match self.source.load_fill(buf, addr) {
            Ok(()) => Ok(()),
            Err(source) => {
                buf.fill(0);
                Err(DecodeError::ByteSource {
                    address: addr.offset(),
                    size: buf.len(),
                    source,
                })
            }
        }
    }
}

/// Forwards resolved micro-operations to a [`PcodeSink`].
pub(crate) struct PcodeEmitProxy<'a, 'l> {
    sink: &'a mut dyn PcodeSink,
    language: &'l Language,
    inputs: Vec<Varnode<'l>>,
}

impl<'a, 'l> PcodeEmitProxy<'a, 'l> {
    pub(crate) fn new(sink: &'a mut dyn PcodeSink, language: &'l Language) -> Self {
        Self {
            sink,
            language,
            inputs: Vec::new(),
        }
    }

    fn varnode(&self, data: &VarnodeData) -> Varnode<'l> {
        Varnode::new(Address::new(self.language.space(data.space), data.offset), data.size)
    }

    pub(crate) fn dump(&mut self, address: &Address<'_>, op: &ResolvedOp) {
        let output = op.output.as_ref().map(|data| self.varnode(data));

        // Scratch storage is reused; sinks only ever see it borrowed.
        self.inputs.clear();
        for data in &op.inputs {
            let vn = self.varnode(data);
            self.inputs.push(vn);
        }

        log::trace!("emit {} at {}", op.opcode, address);
        self.sink.dump(address, op.opcode, output.as_ref(), &self.inputs);
    }
}

/// Forwards one rendered instruction to an [`AssemblySink`].
pub(crate) struct AssemblyEmitProxy<'a> {
    sink: &'a mut dyn AssemblySink,
}

impl<'a> AssemblyEmitProxy<'a> {
    pub(crate) fn new(sink: &'a mut dyn AssemblySink) -> Self {
        Self { sink }
    }

    pub(crate) fn dump(&mut self, address: &Address<'_>, mnemonic: &str, body: &str) {
        log::trace!("emit '{} {}' at {}", mnemonic, body, address);
        self.sink.dump(address, mnemonic, body);
    }
}

/// Owned copy of a varnode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VarnodeRecord {
    pub space: String,
    pub offset: u64,
    pub size: u32,
}

impl From<&Varnode<'_>> for VarnodeRecord {
    fn from(vn: &Varnode<'_>) -> Self {
        Self {
            space: vn.space().name().to_string(),
            offset: vn.offset(),
            size: vn.size(),
        }
    }
}

impl fmt::Display for VarnodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:#x}, {})", self.space, self.offset, self.size)
    }
}

/// Owned copy of one micro-operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PcodeRecord {
    pub address: u64,
    pub opcode: Opcode,
    pub output: Option<VarnodeRecord>,
    pub inputs: Vec<VarnodeRecord>,
}

impl fmt::Display for PcodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(out) = &self.output {
            write!(f, "{} = ", out)?;
        }
        write!(f, "{}", self.opcode)?;
        for (i, input) in self.inputs.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{}", sep, input)?;
        }
        Ok(())
    }
}

/// Sink that keeps every micro-operation it receives.
#[derive(Debug, Clone, Default)]
pub struct PcodeRecorder {
    records: Vec<PcodeRecord>,
}

impl PcodeRecorder {
    pub fn records(&self) -> &[PcodeRecord] {
        &self.records
    }

    /// Take the recorded operations, leaving the recorder empty.
    pub fn take(&mut self) -> Vec<PcodeRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PcodeSink for PcodeRecorder {
    fn dump(
        &mut self,
        address: &Address<'_>,
        opcode: Opcode,
        output: Option<&Varnode<'_>>,
        inputs: &[Varnode<'_>],
    ) {
        self.records.push(PcodeRecord {
            address: address.offset(),
            opcode,
            output: output.map(VarnodeRecord::from),
            inputs: inputs.iter().map(VarnodeRecord::from).collect(),
        });
    }
}

/// Owned copy of one assembly line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyRecord {
    pub space: String,
    pub address: u64,
    pub mnemonic: String,
    pub body: String,
}

impl fmt::Display for AssemblyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.body.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.body)
        }
    }
}

/// Sink that keeps every assembly line it receives.
#[derive(Debug, Clone, Default)]
pub struct AssemblyRecorder {
    records: Vec<AssemblyRecord>,
}

impl AssemblyRecorder {
    pub fn records(&self) -> &[AssemblyRecord] {
        &self.records
    }

    /// The most recent line, if any.
    pub fn last(&self) -> Option<&AssemblyRecord> {
        self.records.last()
    }

    pub fn take(&mut self) -> Vec<AssemblyRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AssemblySink for AssemblyRecorder {
    fn dump(&mut self, address: &Address<'_>, mnemonic: &str, body: &str) {
        self.records.push(AssemblyRecord {
            space: address.space().name().to_string(),
            address: address.offset(),
            mnemonic: mnemonic.to_string(),
            body: body.to_string(),
        });
    }
}
