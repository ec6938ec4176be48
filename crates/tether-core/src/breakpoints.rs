//! Breakpoint bookkeeping.
//!
//! This module centralizes breakpoint lifecycle tracking so the session can
//! focus on the wire mechanics of arming and disarming. The invariant the
//! store enforces: at most one breakpoint exists (and therefore at most one
//! trap is armed) at a given address at a time.
//!
//! Arming state is tracked here but the actual memory patching is the
//! session's job: the store records the original bytes a trap replaced so
//! they can be restored on disarm, exactly once.

use std::collections::BTreeMap;
use std::time::SystemTime;

use smallvec::SmallVec;

use crate::error::{DebugError, Result};
use crate::types::Address;

/// Saved instruction bytes displaced by a trap opcode (at most 4 bytes on
/// the supported architectures).
pub type SavedBytes = SmallVec<[u8; 4]>;

/// One tracked breakpoint.
#[derive(Debug, Clone)]
pub struct Breakpoint
{
    /// Target address the trap is placed at.
    pub address: Address,
    /// Whether the breakpoint participates in arming on resume.
    pub enabled: bool,
    /// Original bytes currently displaced by the trap; `Some` exactly while
    /// the trap instruction is present in target memory.
    pub original_bytes: Option<SavedBytes>,
    /// Number of times this breakpoint has been hit.
    pub hit_count: u64,
    /// When the breakpoint was requested.
    pub requested_at: SystemTime,
}

impl Breakpoint
{
    fn new(address: Address) -> Self
    {
        Breakpoint {
            address,
            enabled: true,
            original_bytes: None,
            hit_count: 0,
            requested_at: SystemTime::now(),
        }
    }

    /// Whether the trap instruction is currently written in target memory.
    #[must_use]
    pub fn is_armed(&self) -> bool
    {
        self.original_bytes.is_some()
    }
}

/// Address-keyed breakpoint store.
///
/// Owned exclusively by the session and mutated only under its lock; the
/// ordering of `BTreeMap` keeps listings stable for display.
#[derive(Debug, Default)]
pub struct BreakpointStore
{
    by_address: BTreeMap<Address, Breakpoint>,
}

impl BreakpointStore
{
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Track a new breakpoint at `address`.
    ///
    /// ## Errors
    ///
    /// `BreakpointExists` if one is already tracked there; the invariant is
    /// one breakpoint per address, so callers must clear first.
    pub fn insert(&mut self, address: Address) -> Result<&Breakpoint>
    {
        if self.by_address.contains_key(&address) {
            return Err(DebugError::BreakpointExists(address));
        }
        Ok(self.by_address.entry(address).or_insert_with(|| Breakpoint::new(address)))
    }

    /// Remove the breakpoint at `address`, returning it.
    ///
    /// ## Errors
    ///
    /// `NoBreakpoint` if none is tracked there.
    pub fn remove(&mut self, address: Address) -> Result<Breakpoint>
    {
        self.by_address.remove(&address).ok_or(DebugError::NoBreakpoint(address))
    }

    /// Look up the breakpoint at `address`.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&Breakpoint>
    {
        self.by_address.get(&address)
    }

    /// Enable or disable the breakpoint at `address`.
    ///
    /// A disabled breakpoint stays tracked but is skipped when arming.
    ///
    /// ## Errors
    ///
    /// `NoBreakpoint` if none is tracked there.
    pub fn set_enabled(&mut self, address: Address, enabled: bool) -> Result<()>
    {
        let breakpoint = self
            .by_address
            .get_mut(&address)
            .ok_or(DebugError::NoBreakpoint(address))?;
        breakpoint.enabled = enabled;
        Ok(())
    }

    /// Addresses of enabled breakpoints that are not yet armed.
    #[must_use]
    pub fn pending_arm(&self) -> Vec<Address>
    {
        self.by_address
            .values()
            .filter(|breakpoint| breakpoint.enabled && !breakpoint.is_armed())
            .map(|breakpoint| breakpoint.address)
            .collect()
    }

    /// Addresses of breakpoints whose trap is currently in target memory.
    #[must_use]
    pub fn armed(&self) -> Vec<Address>
    {
        self.by_address
            .values()
            .filter(|breakpoint| breakpoint.is_armed())
            .map(|breakpoint| breakpoint.address)
            .collect()
    }

    /// Record that the trap was written, saving the displaced bytes.
    ///
    /// ## Errors
    ///
    /// `NoBreakpoint` if none is tracked at `address`.
    pub fn mark_armed(&mut self, address: Address, original_bytes: SavedBytes) -> Result<()>
    {
        let breakpoint = self
            .by_address
            .get_mut(&address)
            .ok_or(DebugError::NoBreakpoint(address))?;
        breakpoint.original_bytes = Some(original_bytes);
        Ok(())
    }

    /// Record that the trap was removed, taking back the displaced bytes.
    ///
    /// Returns `None` if the breakpoint was not armed.
    #[must_use]
    pub fn take_armed_bytes(&mut self, address: Address) -> Option<SavedBytes>
    {
        self.by_address
            .get_mut(&address)
            .and_then(|breakpoint| breakpoint.original_bytes.take())
    }

    /// Record a hit at `address`; returns the updated hit count if an
    /// enabled breakpoint is tracked there.
    pub fn record_hit(&mut self, address: Address) -> Option<u64>
    {
        let breakpoint = self.by_address.get_mut(&address)?;
        if !breakpoint.enabled {
            return None;
        }
        breakpoint.hit_count = breakpoint.hit_count.saturating_add(1);
        Some(breakpoint.hit_count)
    }

    /// List all tracked breakpoints in address order.
    #[must_use]
    pub fn list(&self) -> Vec<Breakpoint>
    {
        self.by_address.values().cloned().collect()
    }

    /// Number of tracked breakpoints.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.by_address.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.by_address.is_empty()
    }

    /// Drop every breakpoint. Used when the target exits or the session
    /// detaches; nothing is restored in target memory.
    pub fn invalidate_all(&mut self)
    {
        self.by_address.clear();
    }
}

#[cfg(test)]
mod tests
{
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn test_one_breakpoint_per_address()
    {
        let mut store = BreakpointStore::new();
        let address = Address::new(0x4000_2000);
        store.insert(address).unwrap();
        assert!(matches!(
            store.insert(address),
            Err(DebugError::BreakpointExists(a)) if a == address
        ));
    }

    #[test]
    fn test_arm_disarm_cycle()
    {
        let mut store = BreakpointStore::new();
        let address = Address::new(0x1000);
        store.insert(address).unwrap();
        assert_eq!(store.pending_arm(), vec![address]);

        store.mark_armed(address, smallvec![0x55, 0x48]).unwrap();
        assert!(store.get(address).unwrap().is_armed());
        assert!(store.pending_arm().is_empty());
        assert_eq!(store.armed(), vec![address]);

        let bytes = store.take_armed_bytes(address).unwrap();
        assert_eq!(bytes.as_slice(), &[0x55, 0x48]);
        assert!(!store.get(address).unwrap().is_armed());
        // A second take returns nothing; restoration is exactly-once.
        assert!(store.take_armed_bytes(address).is_none());
    }

    #[test]
    fn test_disabled_breakpoints_skip_arming_and_hits()
    {
        let mut store = BreakpointStore::new();
        let address = Address::new(0x2000);
        store.insert(address).unwrap();
        store.set_enabled(address, false).unwrap();
        assert!(store.pending_arm().is_empty());
        assert_eq!(store.record_hit(address), None);

        store.set_enabled(address, true).unwrap();
        assert_eq!(store.record_hit(address), Some(1));
        assert_eq!(store.record_hit(address), Some(2));
    }

    #[test]
    fn test_invalidate_all()
    {
        let mut store = BreakpointStore::new();
        store.insert(Address::new(0x1000)).unwrap();
        store.insert(Address::new(0x2000)).unwrap();
        assert_eq!(store.len(), 2);
        store.invalidate_all();
        assert!(store.is_empty());
        assert!(matches!(
            store.remove(Address::new(0x1000)),
            Err(DebugError::NoBreakpoint(_))
        ));
    }
}
