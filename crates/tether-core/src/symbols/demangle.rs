//! Symbol demangling utilities.
//!
//! Compilers "mangle" symbol names to encode type information and
//! namespaces; this module turns them back into something a human can read
//! at a breakpoint prompt.
//!
//! - **Rust**: v0 or legacy mangling (`_R...`, `_ZN...`)
//! - **C++**: Itanium ABI mangling (`_Z...`)
//! - **C**: typically unmangled

use std::fmt;

use rustc_demangle::try_demangle;

/// Source language guessed from a symbol's mangling pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLanguage
{
    /// Rust mangling (`_R`, `_ZN`, or already contains `::`).
    Rust,
    /// Itanium C++ mangling (`_Z`).
    Cpp,
    /// No recognizable mangling.
    Unknown,
}

/// A symbol name in both raw and demangled forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolName
{
    raw: String,
    demangled: Option<String>,
    language: SymbolLanguage,
}

impl SymbolName
{
    /// The raw (mangled) name as it appears in the image.
    #[must_use]
    pub fn raw(&self) -> &str
    {
        &self.raw
    }

    /// The demangled name, when demangling succeeded.
    #[must_use]
    pub fn demangled(&self) -> Option<&str>
    {
        self.demangled.as_deref()
    }

    /// The best name for display: demangled if available, raw otherwise.
    #[must_use]
    pub fn display(&self) -> &str
    {
        self.demangled.as_deref().unwrap_or(&self.raw)
    }

    /// The guessed source language.
    #[must_use]
    pub fn language(&self) -> SymbolLanguage
    {
        self.language
    }

    /// Whether `candidate` names this symbol, in either raw or demangled
    /// form.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool
    {
        self.raw == candidate || self.demangled.as_deref() == Some(candidate)
    }
}

impl fmt::Display for SymbolName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.display())
    }
}

/// Create a [`SymbolName`] from a raw mangled symbol string.
///
/// Attempts demangling via `rustc_demangle` (which also handles the shared
/// `_ZN` prefix for legacy Rust symbols) and guesses the language from the
/// mangling pattern.
pub(crate) fn make_symbol_name(raw: String) -> SymbolName
{
    let demangled = try_demangle(&raw).ok().map(|d| d.to_string());
    let language = if raw.starts_with("_R") || raw.starts_with("_ZN") || raw.contains("::") {
        SymbolLanguage::Rust
    } else if raw.starts_with("_Z") {
        SymbolLanguage::Cpp
    } else {
        SymbolLanguage::Unknown
    };

    SymbolName {
        raw,
        demangled,
        language,
    }
}
