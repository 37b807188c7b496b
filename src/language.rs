//! Validated processor model.
//!
//! A [`Language`] is built once from the `<processor>` root of a
//! specification document. Every name in the document is resolved here, so a
//! successfully built language never fails on a dangling reference during
//! decode; the only decode-time failures left are byte supply, unmatched
//! encodings and reserved operand values.

use std::collections::HashMap;
use std::fmt;

use crate::context::{ContextField, ContextSnapshot};
use crate::opcode::Opcode;
use crate::parser::{DocumentError, DocumentStorage, Element};
use crate::space::{AddressSpace, SpaceId, SpaceKind, VarnodeData};
use crate::{DecodeError, MAX_INSTRUCTION_SIZE};

/// Tag of the root element a language is built from.
pub const PROCESSOR_TAG: &str = "processor";

/// Name of the implicit constant space.
pub const CONSTANT_SPACE: &str = "const";

/// Name of the temporary space used by `$offset:size` expressions.
pub const UNIQUE_SPACE: &str = "unique";

/// Errors raised while building a language; fatal for the engine being built.
#[derive(Debug, thiserror::Error)]
pub enum ConstructionError {
    /// The storage has no processor root
    #[error("Specification has no <{0}> root element")]
    MissingRoot(&'static str),

    /// A required child element is absent
    #[error("<{parent}> is missing a <{child}> element")]
    MissingElement { parent: String, child: &'static str },

    /// A required attribute is absent
    #[error("<{element}> is missing required attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: &'static str },

    /// An attribute is present but unusable
    #[error("<{element}> has invalid {attribute}=\"{value}\"")]
    InvalidAttribute {
        element: String,
        attribute: &'static str,
        value: String,
    },

    /// Two declarations share a name
    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("Unknown address space '{0}'")]
    UnknownSpace(String),

    #[error("Unknown register table '{0}'")]
    UnknownTable(String),

    #[error("Unknown context field '{0}'")]
    UnknownContextField(String),

    /// An instruction declaration is internally inconsistent
    #[error("Instruction '{mnemonic}': {reason}")]
    BadInstruction { mnemonic: String, reason: String },

    /// The document itself could not be loaded
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

type Result<T> = std::result::Result<T, ConstructionError>;

/// A named register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub varnode: VarnodeData,
}

#[derive(Debug, Clone)]
struct RegisterTable {
    name: String,
    entries: Vec<Option<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Register { table: usize },
    Immediate { signed: bool, size: u32 },
    Relative { scale: i64 },
    Absolute,
}

#[derive(Debug, Clone)]
struct OperandField {
    name: String,
    lsb: u32,
    width: u32,
    kind: FieldKind,
}

impl OperandField {
    fn extract(&self, word: u64) -> u64 {
        (word >> self.lsb) & low_mask(self.width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarnodeTemplate {
    Field(usize),
    Register(usize),
    Constant { value: u64, size: u32 },
    Unique { offset: u64, size: u32 },
    SpaceRef(SpaceId),
    InstStart,
    InstNext,
}

#[derive(Debug, Clone)]
struct OpTemplate {
    opcode: Opcode,
    output: Option<VarnodeTemplate>,
    inputs: Vec<VarnodeTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DisplayPiece {
    Literal(String),
    Field(usize),
}

/// One instruction encoding with its display and semantics.
#[derive(Debug, Clone)]
pub struct Constructor {
    mnemonic: String,
    length: usize,
    mask: u64,
    bits: u64,
    constraints: Vec<(usize, u32)>,
    fields: Vec<OperandField>,
    display: Vec<DisplayPiece>,
    ops: Vec<OpTemplate>,
}

impl Constructor {
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Encoding length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn context_matches(&self, ctx: &ContextSnapshot) -> bool {
        self.constraints.iter().all(|&(field, value)| ctx.value(field) == value)
    }

    pub(crate) fn matches(&self, word: u64) -> bool {
        word & self.mask == self.bits
    }
}

/// A matched constructor plus the operand values read from the encoding.
#[derive(Debug)]
pub(crate) struct Instruction<'l> {
    ctor: &'l Constructor,
    start: u64,
    values: Vec<u64>,
}

impl Instruction<'_> {
    pub(crate) fn start(&self) -> u64 {
        self.start
    }

    pub(crate) fn length(&self) -> usize {
        self.ctor.length
    }
}

/// A fully resolved micro-operation, held in the engine's scratch buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedOp {
    pub opcode: Opcode,
    pub output: Option<VarnodeData>,
    pub inputs: Vec<VarnodeData>,
}

/// The processor model: spaces, registers, context fields and encodings.
#[derive(Debug, Clone)]
pub struct Language {
    name: String,
    big_endian: bool,
    alignment: u32,
    spaces: Vec<AddressSpace>,
    code_space: SpaceId,
    constant_space: SpaceId,
    unique_space: SpaceId,
    registers: Vec<Register>,
    register_index: HashMap<String, usize>,
    tables: Vec<RegisterTable>,
    context_fields: Vec<ContextField>,
    constructors: Vec<Constructor>,
}

impl Language {
    /// Build the language registered under [`PROCESSOR_TAG`] in `storage`.
    pub fn from_storage(storage: &DocumentStorage) -> Result<Self> {
        let root = storage
            .root(PROCESSOR_TAG)
            .ok_or(ConstructionError::MissingRoot(PROCESSOR_TAG))?;
        Self::from_element(root)
    }

    /// Build a language from a `<processor>` element.
    pub fn from_element(root: &Element) -> Result<Self> {
        let mut lang = LanguageBuilder::new(root)?;
        lang.read_spaces(child(root, "spaces")?)?;
        for regs in root.children_named("registers") {
            lang.read_registers(regs)?;
        }
        for table in root.children_named("table") {
            lang.read_table(table)?;
        }
        if let Some(ctx) = root.child("context") {
            lang.read_context(ctx)?;
        }
        for insn in child(root, "instructions")?.children_named("instruction") {
            lang.read_instruction(insn)?;
        }
        let lang = lang.finish();

        log::debug!(
            "Built language '{}': {} spaces, {} registers, {} encodings",
            lang.name,
            lang.spaces.len(),
            lang.registers.len(),
            lang.constructors.len()
        );
        Ok(lang)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Required instruction alignment in bytes.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn spaces(&self) -> &[AddressSpace] {
        &self.spaces
    }

    pub fn space(&self, id: SpaceId) -> &AddressSpace {
        &self.spaces[id.0]
    }

    pub fn space_by_name(&self, name: &str) -> Option<&AddressSpace> {
        self.spaces.iter().find(|s| s.name() == name)
    }

    pub fn default_code_space(&self) -> &AddressSpace {
        self.space(self.code_space)
    }

    pub fn constant_space(&self) -> &AddressSpace {
        self.space(self.constant_space)
    }

    pub fn unique_space(&self) -> &AddressSpace {
        self.space(self.unique_space)
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn register_by_name(&self, name: &str) -> Option<&Register> {
        self.register_index.get(name).map(|&idx| &self.registers[idx])
    }

    /// Name of the register occupying exactly `varnode`, if any.
    pub fn register_name(&self, varnode: &VarnodeData) -> Option<&str> {
        self.registers
            .iter()
            .find(|r| r.varnode == *varnode)
            .map(|r| r.name.as_str())
    }

    pub fn context_fields(&self) -> &[ContextField] {
        &self.context_fields
    }

    /// Encodings, shortest first, declaration order within a length.
    pub fn constructors(&self) -> &[Constructor] {
        &self.constructors
    }

    /// Assemble instruction bytes into a word using the processor's byte order.
    pub(crate) fn assemble_word(&self, bytes: &[u8]) -> u64 {
        if self.big_endian {
            bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
        } else {
            bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64)
        }
    }

    pub(crate) fn instantiate<'l>(&self, ctor: &'l Constructor, word: u64, start: u64) -> Instruction<'l> {
        Instruction {
            ctor,
            start,
            values: ctor.fields.iter().map(|f| f.extract(word)).collect(),
        }
    }

    fn field_varnode(&self, insn: &Instruction<'_>, idx: usize) -> std::result::Result<VarnodeData, DecodeError> {
        let field = &insn.ctor.fields[idx];
        let raw = insn.values[idx];
        let code = self.default_code_space();

        Ok(match field.kind {
            FieldKind::Register { table } => {
                let reg = self.table_register(insn, idx, table)?;
                self.registers[reg].varnode
            }
            FieldKind::Immediate { signed, size } => {
                let value = if signed {
                    sign_extend(raw, field.width) as u64
                } else {
                    raw
                };
                VarnodeData {
                    space: self.constant_space,
                    offset: value & low_mask(size * 8),
                    size,
                }
            }
            FieldKind::Relative { .. } | FieldKind::Absolute => VarnodeData {
                space: self.code_space,
                offset: self.branch_target(insn, idx),
                size: code.address_size(),
            },
        })
    }

    fn table_register(
        &self,
        insn: &Instruction<'_>,
        idx: usize,
        table: usize,
    ) -> std::result::Result<usize, DecodeError> {
        let raw = insn.values[idx];
        self.tables[table]
            .entries
            .get(raw as usize)
            .copied()
            .flatten()
            .ok_or_else(|| DecodeError::InvalidOperand {
                address: insn.start,
                field: insn.ctor.fields[idx].name.clone(),
                value: raw,
            })
    }

    fn branch_target(&self, insn: &Instruction<'_>, idx: usize) -> u64 {
        let field = &insn.ctor.fields[idx];
        let raw = insn.values[idx];
        let code = self.default_code_space();
        match field.kind {
            FieldKind::Relative { scale } => {
                let delta = sign_extend(raw, field.width).wrapping_mul(scale);
                code.wrap_offset(insn.start.wrapping_add(delta as u64))
            }
            _ => code.wrap_offset(raw),
        }
    }

    fn resolve(
        &self,
        insn: &Instruction<'_>,
        tpl: VarnodeTemplate,
    ) -> std::result::Result<VarnodeData, DecodeError> {
        let addr_size = self.default_code_space().address_size();
        Ok(match tpl {
            VarnodeTemplate::Field(idx) => self.field_varnode(insn, idx)?,
            VarnodeTemplate::Register(idx) => self.registers[idx].varnode,
            VarnodeTemplate::Constant { value, size } => VarnodeData {
                space: self.constant_space,
                offset: value,
                size,
            },
            VarnodeTemplate::Unique { offset, size } => VarnodeData {
                space: self.unique_space,
                offset,
                size,
            },
            VarnodeTemplate::SpaceRef(id) => VarnodeData {
                space: self.constant_space,
                offset: id.0 as u64,
                size: 8,
            },
            VarnodeTemplate::InstStart => VarnodeData {
                space: self.constant_space,
                offset: insn.start,
                size: addr_size,
            },
            VarnodeTemplate::InstNext => VarnodeData {
                space: self.constant_space,
                offset: self
                    .default_code_space()
                    .wrap_offset(insn.start.wrapping_add(insn.ctor.length as u64)),
                size: addr_size,
            },
        })
    }

    /// Resolve the micro-operations of `insn` into `out`, in execution order.
    pub(crate) fn semantics(
        &self,
        insn: &Instruction<'_>,
        out: &mut Vec<ResolvedOp>,
    ) -> std::result::Result<(), DecodeError> {
        out.clear();
        for op in &insn.ctor.ops {
            let output = op.output.map(|tpl| self.resolve(insn, tpl)).transpose()?;
            let inputs = op
                .inputs
                .iter()
                .map(|&tpl| self.resolve(insn, tpl))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            out.push(ResolvedOp {
                opcode: op.opcode,
                output,
                inputs,
            });
        }
        Ok(())
    }

    /// Render the mnemonic and operand text of `insn`.
    pub(crate) fn render(&self, insn: &Instruction<'_>) -> std::result::Result<(String, String), DecodeError> {
        let mut body = String::new();
        for piece in &insn.ctor.display {
            match piece {
                DisplayPiece::Literal(text) => body.push_str(text),
                DisplayPiece::Field(idx) => self.render_field(insn, *idx, &mut body)?,
            }
        }
        Ok((insn.ctor.mnemonic.clone(), body))
    }

    fn render_field(
        &self,
        insn: &Instruction<'_>,
        idx: usize,
        body: &mut String,
    ) -> std::result::Result<(), DecodeError> {
        let field = &insn.ctor.fields[idx];
        let raw = insn.values[idx];
        let text = match field.kind {
            FieldKind::Register { table } => {
                let reg = self.table_register(insn, idx, table)?;
                self.registers[reg].name.clone()
            }
            FieldKind::Immediate { signed: true, .. } => {
                let value = sign_extend(raw, field.width);
                if value < 0 {
                    format!("-{:#x}", value.unsigned_abs())
                } else {
                    format!("{:#x}", value)
                }
            }
            FieldKind::Immediate { signed: false, .. } => format!("{:#x}", raw),
            FieldKind::Relative { .. } | FieldKind::Absolute => {
                format!("{:#x}", self.branch_target(insn, idx))
            }
        };
        body.push_str(&text);
        Ok(())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}-endian, {} encodings)",
            self.name,
            if self.big_endian { "big" } else { "little" },
            self.constructors.len()
        )
    }
}

/// Mask with the low `bits` bits set.
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_extend(value: u64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return value as i64;
    }
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

fn child<'a>(el: &'a Element, name: &'static str) -> Result<&'a Element> {
    el.child(name).ok_or_else(|| ConstructionError::MissingElement {
        parent: el.name().to_string(),
        child: name,
    })
}

fn attr<'a>(el: &'a Element, name: &'static str) -> Result<&'a str> {
    el.attribute(name).ok_or_else(|| ConstructionError::MissingAttribute {
        element: el.name().to_string(),
        attribute: name,
    })
}

fn invalid(el: &Element, attribute: &'static str, value: &str) -> ConstructionError {
    ConstructionError::InvalidAttribute {
        element: el.name().to_string(),
        attribute,
        value: value.to_string(),
    }
}

fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim().replace('_', "");
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_i64(text: &str) -> Option<i64> {
    match text.trim().strip_prefix('-') {
        Some(rest) => parse_u64(rest).and_then(|v| i64::try_from(v).ok()).map(|v| -v),
        None => parse_u64(text).and_then(|v| i64::try_from(v).ok()),
    }
}

fn num_attr(el: &Element, name: &'static str) -> Result<u64> {
    let text = attr(el, name)?;
    parse_u64(text).ok_or_else(|| invalid(el, name, text))
}

fn opt_num_attr(el: &Element, name: &'static str, default: u64) -> Result<u64> {
    match el.attribute(name) {
        Some(text) => parse_u64(text).ok_or_else(|| invalid(el, name, text)),
        None => Ok(default),
    }
}

fn u32_attr(el: &Element, name: &'static str) -> Result<u32> {
    let text = attr(el, name)?;
    parse_u64(text)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| invalid(el, name, text))
}

fn bool_attr(el: &Element, name: &'static str, default: bool) -> Result<bool> {
    match el.attribute(name) {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(invalid(el, name, other)),
    }
}

/// Accumulates declarations while a document is walked.
struct LanguageBuilder {
    name: String,
    big_endian: bool,
    alignment: u32,
    spaces: Vec<AddressSpace>,
    code_space: Option<SpaceId>,
    registers: Vec<Register>,
    register_index: HashMap<String, usize>,
    tables: Vec<RegisterTable>,
    context_fields: Vec<ContextField>,
    constructors: Vec<Constructor>,
}

impl LanguageBuilder {
    fn new(root: &Element) -> Result<Self> {
        let name = attr(root, "name")?.to_string();
        let big_endian = match root.attribute("endian").unwrap_or("little") {
            "big" => true,
            "little" => false,
            other => return Err(invalid(root, "endian", other)),
        };
        let alignment = opt_num_attr(root, "alignment", 1)?;
        if alignment == 0 || alignment > MAX_INSTRUCTION_SIZE as u64 || !alignment.is_power_of_two() {
            return Err(invalid(root, "alignment", &alignment.to_string()));
        }

        let constant = AddressSpace::new(SpaceId(0), CONSTANT_SPACE, SpaceKind::Constant, 8, 1, big_endian);

        Ok(Self {
            name,
            big_endian,
            alignment: alignment as u32,
            spaces: vec![constant],
            code_space: None,
            registers: Vec::new(),
            register_index: HashMap::new(),
            tables: Vec::new(),
            context_fields: Vec::new(),
            constructors: Vec::new(),
        })
    }

    fn space_id(&self, name: &str) -> Option<SpaceId> {
        self.spaces.iter().find(|s| s.name() == name).map(|s| s.id())
    }

    fn read_spaces(&mut self, spaces: &Element) -> Result<()> {
        for el in spaces.children_named("space") {
            let name = attr(el, "name")?;
            if self.space_id(name).is_some() {
                return Err(ConstructionError::Duplicate {
                    kind: "address space",
                    name: name.to_string(),
                });
            }

            let kind_text = el.attribute("kind").unwrap_or("processor");
            let kind: SpaceKind = kind_text.parse().map_err(|_| invalid(el, "kind", kind_text))?;
            if kind == SpaceKind::Constant {
                return Err(invalid(el, "kind", kind_text));
            }

            let size = num_attr(el, "size")?;
            if size == 0 || size > 8 {
                return Err(invalid(el, "size", &size.to_string()));
            }
            let word_size = match el.attribute("wordsize") {
                Some(_) => u32_attr(el, "wordsize")?,
                None => 1,
            };
            if word_size == 0 {
                return Err(invalid(el, "wordsize", "0"));
            }
            let big_endian = bool_attr(el, "bigendian", self.big_endian)?;

            let id = SpaceId(self.spaces.len());
            self.spaces.push(AddressSpace::new(
                id,
                name,
                kind,
                size as u32,
                word_size,
                big_endian,
            ));
        }

        let default = attr(spaces, "default")?;
        let code = self
            .space_id(default)
            .ok_or_else(|| ConstructionError::UnknownSpace(default.to_string()))?;
        if self.spaces[code.0].kind() != SpaceKind::Processor {
            return Err(invalid(spaces, "default", default));
        }
        self.code_space = Some(code);

        if self.space_id(UNIQUE_SPACE).is_none() {
            let id = SpaceId(self.spaces.len());
            self.spaces.push(AddressSpace::new(
                id,
                UNIQUE_SPACE,
                SpaceKind::Internal,
                4,
                1,
                self.big_endian,
            ));
        }
        Ok(())
    }

    fn read_registers(&mut self, regs: &Element) -> Result<()> {
        let space_name = attr(regs, "space")?;
        let space = self
            .space_id(space_name)
            .ok_or_else(|| ConstructionError::UnknownSpace(space_name.to_string()))?;
        let highest = self.spaces[space.0].highest();

        for el in regs.children_named("register") {
            let name = attr(el, "name")?;
            let offset = num_attr(el, "offset")?;
            let size = num_attr(el, "size")?;
            if size == 0 || size > 64 {
                return Err(invalid(el, "size", &size.to_string()));
            }
            if offset.checked_add(size - 1).map_or(true, |last| last > highest) {
                return Err(invalid(el, "offset", &format!("{:#x}", offset)));
            }
            if self.register_index.contains_key(name) {
                return Err(ConstructionError::Duplicate {
                    kind: "register",
                    name: name.to_string(),
                });
            }

            self.register_index.insert(name.to_string(), self.registers.len());
            self.registers.push(Register {
                name: name.to_string(),
                varnode: VarnodeData {
                    space,
                    offset,
                    size: size as u32,
                },
            });
        }
        Ok(())
    }

    fn read_table(&mut self, el: &Element) -> Result<()> {
        let name = attr(el, "name")?;
        if self.tables.iter().any(|t| t.name == name) {
            return Err(ConstructionError::Duplicate {
                kind: "register table",
                name: name.to_string(),
            });
        }

        let list = attr(el, "registers")?;
        let mut entries = Vec::new();
        for entry in list.split_whitespace() {
            if entry == "_" {
                entries.push(None);
                continue;
            }
            let idx = self
                .register_index
                .get(entry)
                .copied()
                .ok_or_else(|| invalid(el, "registers", entry))?;
            entries.push(Some(idx));
        }
        if entries.is_empty() {
            return Err(invalid(el, "registers", list));
        }

        self.tables.push(RegisterTable {
            name: name.to_string(),
            entries,
        });
        Ok(())
    }

    fn read_context(&mut self, ctx: &Element) -> Result<()> {
        for el in ctx.children_named("field") {
            let name = attr(el, "name")?;
            if self.context_fields.iter().any(|f| f.name == name) {
                return Err(ConstructionError::Duplicate {
                    kind: "context field",
                    name: name.to_string(),
                });
            }
            let width = num_attr(el, "width")?;
            if width == 0 || width > 32 {
                return Err(invalid(el, "width", &width.to_string()));
            }
            let default = opt_num_attr(el, "default", 0)?;
            if default >> width != 0 {
                return Err(invalid(el, "default", &default.to_string()));
            }
            self.context_fields.push(ContextField {
                name: name.to_string(),
                width: width as u32,
                default: default as u32,
            });
        }
        Ok(())
    }

    fn read_instruction(&mut self, el: &Element) -> Result<()> {
        let mnemonic = attr(el, "mnemonic")?.to_string();
        let bad = |reason: String| ConstructionError::BadInstruction {
            mnemonic: mnemonic.clone(),
            reason,
        };

        let length = num_attr(el, "length")?;
        if length == 0 || length > MAX_INSTRUCTION_SIZE as u64 {
            return Err(invalid(el, "length", &length.to_string()));
        }
        let length = length as usize;
        let bit_len = (length * 8) as u32;

        let mask = num_attr(el, "mask")?;
        let bits = num_attr(el, "match")?;
        if mask & !low_mask(bit_len) != 0 {
            return Err(bad(format!("mask {:#x} is wider than {} bytes", mask, length)));
        }
        if bits & !mask != 0 {
            return Err(bad(format!("match {:#x} has bits outside mask {:#x}", bits, mask)));
        }

        let mut constraints = Vec::new();
        for when in el.children_named("when") {
            let name = attr(when, "field")?;
            let field = self
                .context_fields
                .iter()
                .position(|f| f.name == name)
                .ok_or_else(|| ConstructionError::UnknownContextField(name.to_string()))?;
            let value = num_attr(when, "value")?;
            if value >> self.context_fields[field].width != 0 {
                return Err(invalid(when, "value", &value.to_string()));
            }
            constraints.push((field, value as u32));
        }

        let mut fields: Vec<OperandField> = Vec::new();
        for f in el.children_named("field") {
            let name = attr(f, "name")?;
            if fields.iter().any(|o| o.name == name) {
                return Err(ConstructionError::Duplicate {
                    kind: "operand field",
                    name: name.to_string(),
                });
            }
            let lsb = u32_attr(f, "lsb")?;
            let width = u32_attr(f, "width")?;
            if width == 0 || lsb.saturating_add(width) > bit_len {
                return Err(bad(format!("field '{}' does not fit in {} bytes", name, length)));
            }
            let kind = self.read_field_kind(f, width)?;
            fields.push(OperandField {
                name: name.to_string(),
                lsb,
                width,
                kind,
            });
        }

        let display = parse_display(el.attribute("operands").unwrap_or(""), &fields).map_err(&bad)?;

        let mut ops = Vec::new();
        for op in el.children_named("op") {
            let code = attr(op, "code")?;
            let opcode: Opcode = code.parse().map_err(|_| invalid(op, "code", code))?;
            let output = match op.attribute("out") {
                Some(text) => {
                    let tpl = self.parse_varnode(text, &fields).map_err(&bad)?;
                    if !self.is_writable(tpl, &fields) {
                        return Err(bad(format!("'{}' cannot be an output", text)));
                    }
                    Some(tpl)
                }
                None => None,
            };
            let inputs = op
                .attribute("in")
                .unwrap_or("")
                .split_whitespace()
                .map(|text| self.parse_varnode(text, &fields))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(&bad)?;
            ops.push(OpTemplate {
                opcode,
                output,
                inputs,
            });
        }

        self.constructors.push(Constructor {
            mnemonic,
            length,
            mask,
            bits,
            constraints,
            fields,
            display,
            ops,
        });
        Ok(())
    }

    fn read_field_kind(&self, f: &Element, width: u32) -> Result<FieldKind> {
        let kind = attr(f, "kind")?;
        Ok(match kind {
            "register" => {
                let table = attr(f, "table")?;
                let idx = self
                    .tables
                    .iter()
                    .position(|t| t.name == table)
                    .ok_or_else(|| ConstructionError::UnknownTable(table.to_string()))?;
                FieldKind::Register { table: idx }
            }
            "immediate" => {
                let size = opt_num_attr(f, "size", width.div_ceil(8) as u64)?;
                if size == 0 || size > 8 {
                    return Err(invalid(f, "size", &size.to_string()));
                }
                FieldKind::Immediate {
                    signed: bool_attr(f, "signed", false)?,
                    size: size as u32,
                }
            }
            "relative" => {
                let scale = match f.attribute("scale") {
                    Some(text) => parse_i64(text).ok_or_else(|| invalid(f, "scale", text))?,
                    None => 1,
                };
                FieldKind::Relative { scale }
            }
            "absolute" => FieldKind::Absolute,
            other => return Err(invalid(f, "kind", other)),
        })
    }

    fn is_writable(&self, tpl: VarnodeTemplate, fields: &[OperandField]) -> bool {
        match tpl {
            VarnodeTemplate::Register(_) | VarnodeTemplate::Unique { .. } => true,
            VarnodeTemplate::Field(idx) => matches!(fields[idx].kind, FieldKind::Register { .. }),
            _ => false,
        }
    }

    /// Parse one varnode expression of an `<op>` template.
    fn parse_varnode(&self, text: &str, fields: &[OperandField]) -> std::result::Result<VarnodeTemplate, String> {
        let sized = |body: &str| -> std::result::Result<(i64, u32), String> {
            let (value, size) = body
                .split_once(':')
                .ok_or_else(|| format!("'{}' needs an explicit :size", text))?;
            let value = parse_i64(value).ok_or_else(|| format!("bad value in '{}'", text))?;
            let size = parse_u64(size)
                .filter(|s| (1..=8).contains(s))
                .ok_or_else(|| format!("bad size in '{}'", text))?;
            Ok((value, size as u32))
        };

        if let Some(body) = text.strip_prefix('#') {
            let (value, size) = sized(body)?;
            return Ok(VarnodeTemplate::Constant {
                value: value as u64 & low_mask(size * 8),
                size,
            });
        }
        if let Some(body) = text.strip_prefix('$') {
            let (offset, size) = sized(body)?;
            if offset < 0 {
                return Err(format!("negative temporary offset in '{}'", text));
            }
            return Ok(VarnodeTemplate::Unique {
                offset: offset as u64,
                size,
            });
        }
        if let Some(space) = text.strip_prefix('@') {
            return self
                .space_id(space)
                .map(VarnodeTemplate::SpaceRef)
                .ok_or_else(|| format!("unknown address space '{}'", space));
        }
        match text {
            "inst_start" => return Ok(VarnodeTemplate::InstStart),
            "inst_next" => return Ok(VarnodeTemplate::InstNext),
            _ => {}
        }
        if let Some(idx) = fields.iter().position(|f| f.name == text) {
            return Ok(VarnodeTemplate::Field(idx));
        }
        self.register_index
            .get(text)
            .map(|&idx| VarnodeTemplate::Register(idx))
            .ok_or_else(|| format!("'{}' is neither an operand field nor a register", text))
    }

    fn finish(self) -> Language {
        let mut constructors = self.constructors;
        // Stable: declaration order is kept within one length.
        constructors.sort_by_key(|c| c.length);

        let constant_space = SpaceId(0);
        let unique_space = self
            .spaces
            .iter()
            .find(|s| s.name() == UNIQUE_SPACE)
            .map(|s| s.id())
            .unwrap_or(constant_space);

        Language {
            name: self.name,
            big_endian: self.big_endian,
            alignment: self.alignment,
            code_space: self.code_space.unwrap_or(constant_space),
            constant_space,
            unique_space,
            spaces: self.spaces,
            registers: self.registers,
            register_index: self.register_index,
            tables: self.tables,
            context_fields: self.context_fields,
            constructors,
        }
    }
}

/// Split an operand template like `"{rd}, [{rs}]"` into literal and field pieces.
fn parse_display(template: &str, fields: &[OperandField]) -> std::result::Result<Vec<DisplayPiece>, String> {
    let mut pieces = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        if open > 0 {
            pieces.push(DisplayPiece::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unclosed '{{' in operands \"{}\"", template))?;
        let name = &after[..close];
        let idx = fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| format!("operands refer to unknown field '{}'", name))?;
        pieces.push(DisplayPiece::Field(idx));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        pieces.push(DisplayPiece::Literal(rest.to_string()));
    }
    Ok(pieces)
}
