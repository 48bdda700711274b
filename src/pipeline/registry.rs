//! Loan table for buffers currently visible to the consumer

use std::collections::HashMap;

use crate::capture::frame::FrameDescriptor;

/// Buffers on loan, keyed by the address of the image handed out.
///
/// The table only tracks; releasing whatever leaves it is up to the caller.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    loans: HashMap<usize, FrameDescriptor>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.loans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loans.is_empty()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.loans.contains_key(&address)
    }

    /// Record a loan, returning whatever was on loan at that address before
    pub fn publish(&mut self, address: usize, descriptor: FrameDescriptor) -> Option<FrameDescriptor> {
        self.loans.insert(address, descriptor)
    }

    /// Take back a loan the consumer returned
    pub fn reclaim(&mut self, address: usize) -> Option<FrameDescriptor> {
        self.loans.remove(&address)
    }

    /// Remove the loan with the smallest sequence number.
    ///
    /// Equal sequence numbers resolve to the lowest address.
    pub fn evict_oldest(&mut self) -> Option<FrameDescriptor> {
        let address = self
            .loans
            .iter()
            .min_by_key(|(address, descriptor)| (descriptor.meta().sequence, **address))
            .map(|(address, _)| *address)?;
        self.loans.remove(&address)
    }

    /// Pick the loan to give back before the next publish.
    ///
    /// A returned image wins; otherwise the oldest loan goes once `budget`
    /// loans are out.
    pub fn recycle(&mut self, returned: Option<usize>, budget: usize) -> Option<Recycled> {
        if let Some(descriptor) = returned.and_then(|address| self.reclaim(address)) {
            return Some(Recycled::Returned(descriptor));
        }
        if !self.loans.is_empty() && self.loans.len() >= budget {
            return self.evict_oldest().map(Recycled::Evicted);
        }
        None
    }

    /// Empty the table
    pub fn drain(&mut self) -> impl Iterator<Item = FrameDescriptor> + '_ {
        self.loans.drain().map(|(_, descriptor)| descriptor)
    }
}

/// Why a loan left the table
#[derive(Debug)]
pub enum Recycled {
    Returned(FrameDescriptor),
    Evicted(FrameDescriptor),
}
