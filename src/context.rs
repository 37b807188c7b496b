//! Processor context: named bit-fields that select between encodings.
//!
//! Every field has a global default. Values can additionally be assigned to
//! address ranges; when several ranges cover an address the narrowest one
//! wins, and among equally narrow ranges the most recent assignment wins.

use crate::space::{Address, SpaceId};

/// Errors raised by context queries and updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// No field with this name is declared by the processor
    #[error("Unknown context variable: {0}")]
    UnknownVariable(String),

    /// Value does not fit in the field
    #[error("Value {value:#x} does not fit in {width}-bit context variable {name}")]
    ValueOutOfRange { name: String, value: u32, width: u32 },

    /// Range is empty or spans two spaces
    #[error("Invalid context range for {0}")]
    InvalidRange(String),
}

/// Declaration of one context bit-field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextField {
    pub name: String,
    pub width: u32,
    pub default: u32,
}

impl ContextField {
    fn fits(&self, value: u32) -> bool {
        self.width >= 32 || value >> self.width == 0
    }
}

#[derive(Debug, Clone)]
struct Region {
    space: SpaceId,
    first: u64,
    last: u64,
    value: u32,
    serial: u64,
}

impl Region {
    fn contains(&self, space: SpaceId, offset: u64) -> bool {
        self.space == space && self.first <= offset && offset <= self.last
    }

    fn span(&self) -> u64 {
        self.last - self.first
    }
}

/// Context values resolved for one address, indexed like the field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContextSnapshot(Vec<u32>);

impl ContextSnapshot {
    pub(crate) fn value(&self, field: usize) -> u32 {
        self.0[field]
    }
}

/// The context store owned by a decode engine.
#[derive(Debug, Clone)]
pub struct ContextDatabase {
    fields: Vec<ContextField>,
    regions: Vec<Vec<Region>>,
    next_serial: u64,
}

impl ContextDatabase {
    /// Create a store holding the declared defaults.
    pub fn new(fields: Vec<ContextField>) -> Self {
        let regions = vec![Vec::new(); fields.len()];
        Self {
            fields,
            regions,
            next_serial: 0,
        }
    }

    /// Names of all declared fields, in declaration order.
    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn fields(&self) -> &[ContextField] {
        &self.fields
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    fn lookup(&self, name: &str) -> Result<usize, ContextError> {
        self.index_of(name)
            .ok_or_else(|| ContextError::UnknownVariable(name.to_string()))
    }

    fn check_value(&self, idx: usize, value: u32) -> Result<(), ContextError> {
        let field = &self.fields[idx];
        if field.fits(value) {
            Ok(())
        } else {
            Err(ContextError::ValueOutOfRange {
                name: field.name.clone(),
                value,
                width: field.width,
            })
        }
    }

    /// Global default of a field.
    pub fn default_value(&self, name: &str) -> Result<u32, ContextError> {
        let idx = self.lookup(name)?;
        Ok(self.fields[idx].default)
    }

    /// Replace the global default of a field.
    pub fn set_default(&mut self, name: &str, value: u32) -> Result<(), ContextError> {
        let idx = self.lookup(name)?;
        self.check_value(idx, value)?;
        self.fields[idx].default = value;
        Ok(())
    }

    /// Assign `value` from `addr` to the end of its space.
    ///
    /// A later assignment at a higher address is narrower and so takes over
    /// from there on.
    pub fn set_variable(&mut self, name: &str, addr: &Address<'_>, value: u32) -> Result<(), ContextError> {
        let last = addr.space().highest();
        self.assign(name, addr.space().id(), addr.offset(), last, value)
    }

    /// Assign `value` to the half-open range `[begin, end)`.
    pub fn set_variable_region(
        &mut self,
        name: &str,
        begin: &Address<'_>,
        end: &Address<'_>,
        value: u32,
    ) -> Result<(), ContextError> {
        if begin.space().id() != end.space().id() || end.offset() <= begin.offset() {
            return Err(ContextError::InvalidRange(name.to_string()));
        }
        self.assign(name, begin.space().id(), begin.offset(), end.offset() - 1, value)
    }

    fn assign(&mut self, name: &str, space: SpaceId, first: u64, last: u64, value: u32) -> Result<(), ContextError> {
        let idx = self.lookup(name)?;
        self.check_value(idx, value)?;

        let serial = self.next_serial;
        self.next_serial += 1;
        let regions = &mut self.regions[idx];
        match regions
            .iter_mut()
            .find(|r| r.space == space && r.first == first && r.last == last)
        {
            Some(region) => {
                region.value = value;
                region.serial = serial;
            }
            None => regions.push(Region {
                space,
                first,
                last,
                value,
                serial,
            }),
        }
        log::trace!("context {} = {:#x} over {}:{:#x}..={:#x}", name, value, space, first, last);
        Ok(())
    }

    /// Value of a field at `addr`.
    pub fn get_variable(&self, name: &str, addr: &Address<'_>) -> Result<u32, ContextError> {
        let idx = self.lookup(name)?;
        Ok(self.resolve(idx, addr.space().id(), addr.offset()))
    }

    /// Drop every range assignment of a field, leaving only its default.
    pub fn clear_variable(&mut self, name: &str) -> Result<(), ContextError> {
        let idx = self.lookup(name)?;
        self.regions[idx].clear();
        Ok(())
    }

    fn resolve(&self, idx: usize, space: SpaceId, offset: u64) -> u32 {
        self.regions[idx]
            .iter()
            .filter(|r| r.contains(space, offset))
            .min_by_key(|r| (r.span(), std::cmp::Reverse(r.serial)))
            .map(|r| r.value)
            .unwrap_or(self.fields[idx].default)
    }

    /// Resolve every field at `addr`.
    pub(crate) fn snapshot(&self, addr: &Address<'_>) -> ContextSnapshot {
        let space = addr.space().id();
        ContextSnapshot(
            (0..self.fields.len())
                .map(|idx| self.resolve(idx, space, addr.offset()))
                .collect(),
        )
    }
}
