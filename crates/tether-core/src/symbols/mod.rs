//! Symbol and module tracking.
//!
//! The session learns about loaded images from module-load notifications;
//! this module owns the bookkeeping: which image covers which address
//! range, and how addresses map to names (and back).
//!
//! Symbol tables are parsed lazily, on the first query that needs them, and
//! are immutable afterwards. A module whose image cannot be found or parsed
//! stays tracked — its address range is still known to belong to *some*
//! image — but resolution inside it degrades to raw addresses.

pub mod demangle;
pub mod image;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

pub use demangle::{SymbolLanguage, SymbolName};
pub use image::{ImageSymbols, Symbol, SymbolKind};

use crate::types::Address;

/// One loaded executable image in the target.
///
/// Modules are keyed by base address. A base address may be reused after an
/// unload; reload produces a *new* `Module` with a fresh generation, so
/// symbol data from the unloaded image is never consulted again.
#[derive(Debug)]
pub struct Module
{
    base: Address,
    size: u64,
    path: String,
    generation: u64,
    image: Option<Vec<u8>>,
    symbols: OnceCell<Option<Arc<ImageSymbols>>>,
}

impl Module
{
    fn new(base: Address, size: u64, path: String, generation: u64) -> Self
    {
        Module {
            base,
            size,
            path,
            generation,
            image: None,
            symbols: OnceCell::new(),
        }
    }

    /// Base load address.
    #[must_use]
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// Mapped size in bytes.
    #[must_use]
    pub fn size(&self) -> u64
    {
        self.size
    }

    /// Target-side image path.
    #[must_use]
    pub fn path(&self) -> &str
    {
        &self.path
    }

    /// Monotonic generation stamp; distinguishes reloads at a reused base.
    #[must_use]
    pub fn generation(&self) -> u64
    {
        self.generation
    }

    /// Short display name: the file stem of the image path.
    #[must_use]
    pub fn name(&self) -> &str
    {
        Path::new(&self.path)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.path)
    }

    /// Whether `address` falls inside this module's mapped range.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address.value() < self.base.value().saturating_add(self.size)
    }

    /// The lazily-parsed symbol table, if the image could be parsed.
    ///
    /// The first call reads and parses the image; failures are logged once
    /// and cached as `None` so a broken image is not re-parsed per query.
    #[must_use]
    pub fn symbols(&self) -> Option<&Arc<ImageSymbols>>
    {
        self.symbols
            .get_or_init(|| {
                let owned;
                let bytes: &[u8] = match &self.image {
                    Some(bytes) => bytes,
                    None => match fs::read(&self.path) {
                        Ok(read) => {
                            owned = read;
                            &owned
                        }
                        Err(err) => {
                            debug!(path = %self.path, %err, "image not readable locally, raw addresses only");
                            return None;
                        }
                    },
                };
                match ImageSymbols::parse(&self.path, bytes) {
                    Ok(symbols) => Some(Arc::new(symbols)),
                    Err(err) => {
                        warn!(path = %self.path, %err, "unparseable image, raw addresses only");
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// A successful address-to-symbol resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol
{
    /// Short name of the owning module.
    pub module: String,
    /// Display name of the symbol.
    pub symbol: String,
    /// Byte offset of the queried address from the symbol's start.
    pub offset: u64,
}

impl std::fmt::Display for ResolvedSymbol
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        if self.offset == 0 {
            write!(f, "{}!{}", self.module, self.symbol)
        } else {
            write!(f, "{}!{}+0x{:x}", self.module, self.symbol, self.offset)
        }
    }
}

/// The set of modules currently loaded in the target, in load order.
///
/// Owned exclusively by the session and mutated only under its lock; the
/// symbol tables inside each module are immutable and safe to share.
#[derive(Debug, Default)]
pub struct ModuleMap
{
    modules: Vec<Arc<Module>>,
    next_generation: u64,
}

impl ModuleMap
{
    /// Create an empty module map.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Track a newly loaded module.
    ///
    /// If a module already exists at `base` (a reused base address after an
    /// unload the client missed), it is evicted first: the new load always
    /// gets a fresh `Module` object and generation.
    pub fn insert(&mut self, base: Address, size: u64, path: String) -> Arc<Module>
    {
        if self.remove(base).is_some() {
            debug!(%base, "evicting stale module at reused base address");
        }
        self.next_generation += 1;
        let module = Arc::new(Module::new(base, size, path, self.next_generation));
        debug!(%base, size, path = module.path(), generation = module.generation(), "module loaded");
        self.modules.push(Arc::clone(&module));
        module
    }

    /// Track a module whose image bytes are already in hand (no filesystem
    /// access; used for targets that push images over the wire and by
    /// tests).
    pub fn insert_with_image(&mut self, base: Address, size: u64, path: String, image: Vec<u8>) -> Arc<Module>
    {
        if self.remove(base).is_some() {
            debug!(%base, "evicting stale module at reused base address");
        }
        self.next_generation += 1;
        let mut module = Module::new(base, size, path, self.next_generation);
        module.image = Some(image);
        let module = Arc::new(module);
        self.modules.push(Arc::clone(&module));
        module
    }

    /// Stop tracking the module at `base`, returning it.
    pub fn remove(&mut self, base: Address) -> Option<Arc<Module>>
    {
        let index = self.modules.iter().position(|module| module.base() == base)?;
        Some(self.modules.remove(index))
    }

    /// The module at exactly `base`.
    #[must_use]
    pub fn get(&self, base: Address) -> Option<&Arc<Module>>
    {
        self.modules.iter().find(|module| module.base() == base)
    }

    /// All tracked modules in load order.
    #[must_use]
    pub fn list(&self) -> &[Arc<Module>]
    {
        &self.modules
    }

    /// Number of tracked modules.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.modules.len()
    }

    /// Whether no modules are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.modules.is_empty()
    }

    /// Drop every module. Used when the target exits or the session ends.
    pub fn clear(&mut self)
    {
        self.modules.clear();
    }

    /// Resolve a target address to module!symbol+offset.
    ///
    /// Returns `None` when no module covers the address or the covering
    /// module has no usable symbols.
    #[must_use]
    pub fn resolve(&self, address: Address) -> Option<ResolvedSymbol>
    {
        // Most recently loaded wins if ranges ever overlap.
        let module = self.modules.iter().rev().find(|module| module.contains(address))?;
        let relative = address.value() - module.base().value();
        let (symbol, offset) = module.symbols()?.nearest_below(relative)?;
        Some(ResolvedSymbol {
            module: module.name().to_string(),
            symbol: symbol.name.display().to_string(),
            offset,
        })
    }

    /// Find a symbol by name across all modules, returning its target
    /// address.
    ///
    /// A bare name searches every module, most recently loaded first; a
    /// `module!name` query restricts the search to that module.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Address>
    {
        let (module_filter, symbol_name) = match name.split_once('!') {
            Some((module, symbol)) => (Some(module), symbol),
            None => (None, name),
        };

        for module in self.modules.iter().rev() {
            if let Some(filter) = module_filter {
                if module.name() != filter {
                    continue;
                }
            }
            if let Some(symbols) = module.symbols() {
                if let Some(symbol) = symbols.find(symbol_name) {
                    return Some(module.base() + symbol.address);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests
{
    use super::demangle::make_symbol_name;
    use super::*;

    fn table(entries: &[(&str, u64, u64)]) -> Vec<Symbol>
    {
        entries
            .iter()
            .map(|(name, address, size)| Symbol {
                name: make_symbol_name((*name).to_string()),
                address: *address,
                size: *size,
                kind: SymbolKind::Function,
            })
            .collect()
    }

    fn insert_with_symbols(map: &mut ModuleMap, base: u64, size: u64, path: &str, symbols: Vec<Symbol>) -> Arc<Module>
    {
        let module = map.insert(Address::new(base), size, path.to_string());
        module
            .symbols
            .set(Some(Arc::new(ImageSymbols::from_symbols(symbols))))
            .expect("symbols already initialized");
        module
    }

    #[test]
    fn test_resolve_nearest_below()
    {
        let mut map = ModuleMap::new();
        insert_with_symbols(
            &mut map,
            0x40_0000,
            0x1_0000,
            "/bin/krnl",
            table(&[("foo", 0x1000, 0x20), ("bar", 0x1020, 0x10)]),
        );

        let resolved = map.resolve(Address::new(0x40_1005)).unwrap();
        assert_eq!(resolved.symbol, "foo");
        assert_eq!(resolved.offset, 0x5);
        assert_eq!(resolved.module, "krnl");

        let resolved = map.resolve(Address::new(0x40_1030)).unwrap();
        assert_eq!(resolved.symbol, "bar");
        assert_eq!(resolved.offset, 0x10);

        assert!(map.resolve(Address::new(0x40_0fff)).is_none());
        assert!(map.resolve(Address::new(0x80_0000)).is_none());
    }

    #[test]
    fn test_find_prefers_most_recent_module()
    {
        let mut map = ModuleMap::new();
        insert_with_symbols(&mut map, 0x10_0000, 0x1000, "/bin/older", table(&[("entry", 0x100, 0)]));
        insert_with_symbols(&mut map, 0x20_0000, 0x1000, "/bin/newer", table(&[("entry", 0x200, 0)]));

        assert_eq!(map.find("entry"), Some(Address::new(0x20_0200)));
        assert_eq!(map.find("older!entry"), Some(Address::new(0x10_0100)));
        assert_eq!(map.find("newer!entry"), Some(Address::new(0x20_0200)));
        assert_eq!(map.find("missing!entry"), None);
        assert_eq!(map.find("nosuch"), None);
    }

    #[test]
    fn test_reload_at_reused_base_is_new_module()
    {
        let mut map = ModuleMap::new();
        let first = insert_with_symbols(&mut map, 0x40_0000, 0x1000, "/bin/a", table(&[("stale_sym", 0x10, 0)]));
        let first_generation = first.generation();
        assert_eq!(map.resolve(Address::new(0x40_0010)).unwrap().symbol, "stale_sym");

        map.remove(Address::new(0x40_0000)).unwrap();
        assert!(map.resolve(Address::new(0x40_0010)).is_none());

        // Reload at the same base: fresh module, fresh generation, and the
        // stale symbols must never come back.
        let second = insert_with_symbols(&mut map, 0x40_0000, 0x1000, "/bin/b", table(&[("fresh_sym", 0x10, 0)]));
        assert_ne!(second.generation(), first_generation);
        assert_eq!(map.resolve(Address::new(0x40_0010)).unwrap().symbol, "fresh_sym");
        // The evicted module object still exists for anyone holding it, but
        // the map no longer consults it.
        assert_eq!(first.symbols().unwrap().find("stale_sym").unwrap().address, 0x10);
    }

    #[test]
    fn test_unparseable_module_degrades_to_raw()
    {
        let mut map = ModuleMap::new();
        // Garbage bytes: parse fails, module stays tracked.
        map.insert_with_image(Address::new(0x50_0000), 0x1000, "/bin/blob".to_string(), vec![0u8; 32]);
        assert_eq!(map.len(), 1);
        assert!(map.resolve(Address::new(0x50_0800)).is_none());
        assert!(map.get(Address::new(0x50_0000)).is_some());
    }

    #[test]
    fn test_display_formats()
    {
        let resolved = ResolvedSymbol {
            module: "krnl".to_string(),
            symbol: "foo".to_string(),
            offset: 0,
        };
        assert_eq!(resolved.to_string(), "krnl!foo");
        let resolved = ResolvedSymbol {
            offset: 0x2a,
            ..resolved
        };
        assert_eq!(resolved.to_string(), "krnl!foo+0x2a");
    }
}
