//! Address spaces, addresses and varnodes.
//!
//! An [`AddressSpace`] is created once when a processor specification is
//! loaded and never changes afterwards. [`Address`] and [`Varnode`] borrow the
//! space they live in, so they cannot outlive the engine that produced them.
//! [`VarnodeData`] is the owned, space-id based form the engine keeps in its
//! scratch buffers.

use std::fmt;
use std::str::FromStr;

use num_derive::FromPrimitive;
use serde::Serialize;

/// Kind tag of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, FromPrimitive)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    /// Offsets are the constant values themselves
    Constant = 0,
    /// Normal space modelled by the processor (ram, registers)
    Processor = 1,
    /// Offsets relative to a base register
    SpaceBase = 2,
    /// Internally managed temporaries
    Internal = 3,
    /// Call-specification references
    Fspec = 4,
    /// Operation references
    Iop = 5,
    /// Virtual space for split variables
    Join = 6,
}

impl SpaceKind {
    /// Map the engine's numeric kind back to the enum.
    pub fn from_u32(val: u32) -> Option<Self> {
        <Self as num_traits::FromPrimitive>::from_u32(val)
    }

    /// Single character used when printing addresses in this kind of space.
    fn default_shortcut(self) -> char {
        match self {
            SpaceKind::Constant => '#',
            SpaceKind::Processor => '*',
            SpaceKind::SpaceBase => 's',
            SpaceKind::Internal => 'u',
            SpaceKind::Fspec => 'f',
            SpaceKind::Iop => 'i',
            SpaceKind::Join => 'j',
        }
    }
}

impl fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceKind::Constant => write!(f, "constant"),
            SpaceKind::Processor => write!(f, "processor"),
            SpaceKind::SpaceBase => write!(f, "spacebase"),
            SpaceKind::Internal => write!(f, "internal"),
            SpaceKind::Fspec => write!(f, "fspec"),
            SpaceKind::Iop => write!(f, "iop"),
            SpaceKind::Join => write!(f, "join"),
        }
    }
}

impl FromStr for SpaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "constant" | "const" => Ok(SpaceKind::Constant),
            "processor" | "ram" => Ok(SpaceKind::Processor),
            "spacebase" => Ok(SpaceKind::SpaceBase),
            "internal" | "unique" => Ok(SpaceKind::Internal),
            "fspec" => Ok(SpaceKind::Fspec),
            "iop" => Ok(SpaceKind::Iop),
            "join" => Ok(SpaceKind::Join),
            _ => Err(format!("Unknown space kind: {}", s)),
        }
    }
}

/// Index of an address space inside its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SpaceId(pub(crate) usize);

impl SpaceId {
    /// Raw index; stable for the lifetime of the engine.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named, linear, byte-addressable region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    id: SpaceId,
    name: String,
    kind: SpaceKind,
    word_size: u32,
    address_size: u32,
    big_endian: bool,
    shortcut: char,
}

impl AddressSpace {
    pub(crate) fn new(
        id: SpaceId,
        name: impl Into<String>,
        kind: SpaceKind,
        address_size: u32,
        word_size: u32,
        big_endian: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            word_size,
            address_size,
            big_endian,
            shortcut: kind.default_shortcut(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn index(&self) -> usize {
        self.id.0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Bytes per addressable unit.
    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    /// Bytes in an offset of this space.
    pub fn address_size(&self) -> u32 {
        self.address_size
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn shortcut(&self) -> char {
        self.shortcut
    }

    pub fn is_constant(&self) -> bool {
        self.kind == SpaceKind::Constant
    }

    /// Largest valid offset.
    pub fn highest(&self) -> u64 {
        if self.address_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.address_size * 8)) - 1
        }
    }

    /// Wrap `off` into the valid offset range of this space.
    pub fn wrap_offset(&self, off: u64) -> u64 {
        off & self.highest()
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// An offset within an address space.
#[derive(Clone, Copy)]
pub struct Address<'a> {
    space: &'a AddressSpace,
    offset: u64,
}

impl<'a> Address<'a> {
    /// Build an address; the offset is wrapped to the space's width.
    pub fn new(space: &'a AddressSpace, offset: u64) -> Self {
        Self {
            space,
            offset: space.wrap_offset(offset),
        }
    }

    pub fn space(&self) -> &'a AddressSpace {
        self.space
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_constant(&self) -> bool {
        self.space.is_constant()
    }

    pub fn is_big_endian(&self) -> bool {
        self.space.is_big_endian()
    }

    pub fn address_size(&self) -> u32 {
        self.space.address_size()
    }

    /// Address `delta` bytes further on, wrapping within the space.
    pub fn add(&self, delta: u64) -> Self {
        Self::new(self.space, self.offset.wrapping_add(delta))
    }

    /// True if `[self, self+size)` lies inside `[other, other+other_size)`.
    pub fn contained_by(&self, size: u64, other: &Address<'_>, other_size: u64) -> bool {
        if self.space.id() != other.space.id() || self.offset < other.offset {
            return false;
        }
        let end = self.offset as u128 + size as u128;
        let other_end = other.offset as u128 + other_size as u128;
        end <= other_end
    }

    /// Byte position of `self + skip` within `[other, other+size)`, if it falls there.
    pub fn overlap(&self, skip: u64, other: &Address<'_>, size: u64) -> Option<u64> {
        if self.space.id() != other.space.id() || self.is_constant() {
            return None;
        }
        let pos = self.offset.wrapping_add(skip);
        let dist = pos.wrapping_sub(other.offset);
        (dist < size).then_some(dist)
    }

    /// True if `[low, low+low_size)` immediately follows `[self, self+size)`
    /// in memory order for the space's endianness.
    pub fn is_contiguous(&self, size: u64, low: &Address<'_>, low_size: u64) -> bool {
        if self.space.id() != low.space.id() {
            return false;
        }
        if self.space.is_big_endian() {
            self.offset.wrapping_add(size) == low.offset
        } else {
            low.offset.wrapping_add(low_size) == self.offset
        }
    }
}

impl PartialEq for Address<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.space.id() == other.space.id() && self.offset == other.offset
    }
}

impl Eq for Address<'_> {}

impl fmt::Debug for Address<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("space", &self.space.name())
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish()
    }
}

impl fmt::Display for Address<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:0width$x}",
            self.space.name(),
            self.offset,
            width = 2 * self.space.address_size() as usize
        )
    }
}

/// Owned varnode description, independent of any borrow on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarnodeData {
    pub space: SpaceId,
    pub offset: u64,
    pub size: u32,
}

/// A storage location handed to a sink: space, offset and size in bytes.
///
/// Only valid for the duration of the callback that receives it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Varnode<'a> {
    address: Address<'a>,
    size: u32,
}

impl<'a> Varnode<'a> {
    pub fn new(address: Address<'a>, size: u32) -> Self {
        Self { address, size }
    }

    pub fn address(&self) -> Address<'a> {
        self.address
    }

    pub fn space(&self) -> &'a AddressSpace {
        self.address.space()
    }

    pub fn offset(&self) -> u64 {
        self.address.offset()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn data(&self) -> VarnodeData {
        VarnodeData {
            space: self.address.space().id(),
            offset: self.address.offset(),
            size: self.size,
        }
    }
}

impl fmt::Debug for Varnode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:#x}, {})", self.space().name(), self.offset(), self.size)
    }
}

impl fmt::Display for Varnode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]#{}", self.address, self.size)
    }
}
