//! Executable image parsing.
//!
//! Turns an ELF image (32- or 64-bit, any of the supported machines) into a
//! sorted symbol table supporting the two queries the debugger needs:
//! nearest-symbol-at-or-below an address, and exact lookup by name.

use object::{Object, ObjectSegment, ObjectSymbol};
use tracing::debug;

use super::demangle::{make_symbol_name, SymbolName};
use crate::error::{DebugError, Result};

/// What an image symbol refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind
{
    /// Executable code.
    Function,
    /// Data object.
    Data,
    /// Anything else (sections, files, unknown).
    Other,
}

/// One symbol from an image's symbol table.
///
/// Addresses are module-relative: the offset from the image's load base,
/// independent of where the target mapped it.
#[derive(Debug, Clone)]
pub struct Symbol
{
    /// Raw and demangled name.
    pub name: SymbolName,
    /// Module-relative address.
    pub address: u64,
    /// Size in bytes as reported by the image; often zero or imprecise.
    pub size: u64,
    /// Kind tag.
    pub kind: SymbolKind,
}

/// An image's symbol table, sorted by address.
///
/// Immutable once parsed; may be read concurrently by any number of
/// resolver queries without locking.
#[derive(Debug)]
pub struct ImageSymbols
{
    symbols: Vec<Symbol>,
}

impl ImageSymbols
{
    /// Parse an ELF image's symbol table.
    ///
    /// Symbol addresses are rebased to module-relative offsets using the
    /// lowest loadable segment address (zero for relocatable images).
    ///
    /// ## Errors
    ///
    /// `ImageFormat` when the bytes are not a parseable image. The caller
    /// keeps tracking the module and degrades to raw-address display.
    pub fn parse(path: &str, bytes: &[u8]) -> Result<Self>
    {
        let file = object::File::parse(bytes).map_err(|err| DebugError::ImageFormat {
            path: path.to_string(),
            detail: err.to_string(),
        })?;

        let image_base = file.segments().map(|segment| segment.address()).min().unwrap_or(0);

        let mut symbols = Vec::new();
        for symbol in file.symbols() {
            if symbol.is_undefined() {
                continue;
            }
            let Ok(raw_name) = symbol.name() else { continue };
            if raw_name.is_empty() {
                continue;
            }
            let kind = match symbol.kind() {
                object::SymbolKind::Text => SymbolKind::Function,
                object::SymbolKind::Data => SymbolKind::Data,
                _ => SymbolKind::Other,
            };
            symbols.push(Symbol {
                name: make_symbol_name(raw_name.to_string()),
                address: symbol.address().saturating_sub(image_base),
                size: symbol.size(),
                kind,
            });
        }

        debug!(path, count = symbols.len(), "parsed image symbol table");
        Ok(Self::from_symbols(symbols))
    }

    /// Build a table from already-extracted symbols (sorts by address).
    #[must_use]
    pub fn from_symbols(mut symbols: Vec<Symbol>) -> Self
    {
        symbols.sort_by_key(|symbol| symbol.address);
        ImageSymbols { symbols }
    }

    /// Nearest symbol at or below the module-relative address, plus the
    /// byte offset from its start.
    ///
    /// Offsets past a symbol's reported size are still returned: sizes are
    /// frequently missing or wrong, and a "name+large offset" display beats
    /// a bare address.
    #[must_use]
    pub fn nearest_below(&self, relative: u64) -> Option<(&Symbol, u64)>
    {
        let index = match self.symbols.binary_search_by_key(&relative, |symbol| symbol.address) {
            Ok(exact) => exact,
            Err(0) => return None,
            Err(insertion) => insertion - 1,
        };
        let symbol = &self.symbols[index];
        Some((symbol, relative - symbol.address))
    }

    /// Exact lookup by raw or demangled name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Symbol>
    {
        self.symbols.iter().find(|symbol| symbol.name.matches(name))
    }

    /// Number of symbols in the table.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.symbols.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.symbols.is_empty()
    }

    /// All symbols in address order.
    #[must_use]
    pub fn symbols(&self) -> &[Symbol]
    {
        &self.symbols
    }
}
