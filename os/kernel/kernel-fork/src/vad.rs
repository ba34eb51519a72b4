//! # Virtual Address Descriptors
//!
//! One [`Vad`] per contiguous region of a process's address space, kept in
//! a [`VadTree`] ordered by start page. File and image views reference a
//! shared [`ControlArea`] whose counters track how many views and user
//! references exist across all processes.
//!
//! Fork duplicates the inheritable VADs of the parent into [`OwnedVad`]s,
//! which hold the pool charge and control-area references of the duplicate
//! until the child takes them over.

use crate::error::VadError;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_alloc::NonPagedPool;
use kernel_memory_addresses::{PoolAddress, VirtualPageNumber, VirtualPageRange};
use kernel_vmem::Protection;

/// Non-paged pool bytes of one VAD node.
pub const VAD_SIZE: usize = size_of::<Vad>();

/// Kind of region a VAD describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VadType {
    Private,
    MappedFile,
    Image,
    PhysicalDevice,
    /// Address windowing extensions.
    Awe,
    LargePages,
    RotatePhysical,
    LargePageSection,
}

impl VadType {
    /// Kinds that fork can carry into a child at all.
    #[must_use]
    pub const fn is_clonable(self) -> bool {
        !matches!(
            self,
            Self::Awe | Self::LargePages | Self::RotatePhysical | Self::LargePageSection
        )
    }

    /// Kinds whose presence makes the whole fork fail.
    #[must_use]
    pub const fn rejects_fork(self) -> bool {
        matches!(
            self,
            Self::Awe | Self::PhysicalDevice | Self::LargePages | Self::RotatePhysical | Self::LargePageSection
        )
    }
}

/// What a child inherits of a shared view.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Inherit {
    #[default]
    Share,
    Unmap,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct VadFlags {
    /// Protection of the region cannot be changed.
    pub no_change: bool,
    /// Protection is fixed by the section itself.
    pub sec_no_change: bool,
    /// One secured range exists.
    pub one_secured: bool,
    /// Several secured ranges exist.
    pub multiple_secured: bool,
    #[bits(28)]
    __: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SectionKind {
    Data,
    Image,
}

/// Shared description of a section backing file or image views.
///
/// The prototype PTEs of page `i` live at `prototypes + 8 * i`.
#[derive(Debug)]
pub struct ControlArea {
    kind: SectionKind,
    pages: u64,
    prototypes: PoolAddress,
    mapped_views: AtomicU32,
    user_references: AtomicU32,
    writable_user_references: AtomicU32,
}

impl ControlArea {
    pub(crate) const fn new(kind: SectionKind, pages: u64, prototypes: PoolAddress) -> Self {
        Self {
            kind,
            pages,
            prototypes,
            mapped_views: AtomicU32::new(0),
            user_references: AtomicU32::new(0),
            writable_user_references: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SectionKind {
        self.kind
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    /// Address of the prototype PTE for page `index` of the section.
    #[must_use]
    pub const fn prototype(&self, index: u64) -> PoolAddress {
        self.prototypes.add(index * 8)
    }

    /// Whether `address` is one of this section's prototype PTEs.
    #[must_use]
    pub fn owns_prototype(&self, address: PoolAddress) -> bool {
        address
            .offset_from(self.prototypes)
            .is_some_and(|offset| offset < self.pages * 8)
    }

    #[must_use]
    pub fn mapped_views(&self) -> u32 {
        self.mapped_views.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn user_references(&self) -> u32 {
        self.user_references.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn writable_user_references(&self) -> u32 {
        self.writable_user_references.load(Ordering::Acquire)
    }

    const fn counts_writable(&self, protection: Protection) -> bool {
        matches!(self.kind, SectionKind::Data) && protection.is_writable()
    }

    /// Records one more view mapped with `protection`.
    pub(crate) fn reference_view(&self, protection: Protection) {
        self.mapped_views.fetch_add(1, Ordering::AcqRel);
        self.user_references.fetch_add(1, Ordering::AcqRel);
        if self.counts_writable(protection) {
            self.writable_user_references.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn release_view(&self, protection: Protection) {
        self.mapped_views.fetch_sub(1, Ordering::AcqRel);
        self.user_references.fetch_sub(1, Ordering::AcqRel);
        if self.counts_writable(protection) {
            self.writable_user_references.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Vad {
    pub range: VirtualPageRange,
    pub kind: VadType,
    pub protection: Protection,
    pub inherit: Inherit,
    /// Commit charged for the region in pages; `usize::MAX` when the charge
    /// failed and nothing may be returned.
    pub commit_charge: usize,
    pub flags: VadFlags,
    pub control_area: Option<Arc<ControlArea>>,
}

impl Vad {
    /// Committed private memory.
    #[must_use]
    pub fn private(range: VirtualPageRange, protection: Protection) -> Self {
        Self {
            range,
            kind: VadType::Private,
            protection,
            inherit: Inherit::Share,
            commit_charge: usize::try_from(range.len()).unwrap_or(usize::MAX),
            flags: VadFlags::new(),
            control_area: None,
        }
    }

    /// A region of a kind without a backing section (physical, AWE, large pages).
    #[must_use]
    pub const fn special(kind: VadType, range: VirtualPageRange, protection: Protection) -> Self {
        Self {
            range,
            kind,
            protection,
            inherit: Inherit::Share,
            commit_charge: 0,
            flags: VadFlags::new(),
            control_area: None,
        }
    }

    /// A view of `control_area`; the caller has referenced the view already.
    #[must_use]
    pub(crate) const fn view(
        kind: VadType,
        range: VirtualPageRange,
        protection: Protection,
        inherit: Inherit,
        control_area: Arc<ControlArea>,
    ) -> Self {
        Self {
            range,
            kind,
            protection,
            inherit,
            commit_charge: 0,
            flags: VadFlags::new(),
            control_area: Some(control_area),
        }
    }

    #[must_use]
    pub const fn is_private(&self) -> bool {
        matches!(self.kind, VadType::Private)
    }

    /// Whether fork copies this region into the child.
    #[must_use]
    pub const fn is_inherited(&self) -> bool {
        self.kind.is_clonable() && (self.is_private() || matches!(self.inherit, Inherit::Share))
    }

    /// The region's copy as seen by a child: secured ranges are not carried
    /// over, and neither is `no_change` unless the section imposes it.
    fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.flags = copy.flags.with_one_secured(false).with_multiple_secured(false);
        if self.is_private() || !self.flags.sec_no_change() {
            copy.flags.set_no_change(false);
        }
        copy
    }

    /// Releases the control-area references of the view, if any.
    pub(crate) fn release_view(&self) {
        if let Some(control_area) = &self.control_area {
            control_area.release_view(self.protection);
        }
    }
}

/// A fork duplicate not yet inserted into a child.
///
/// Dropping it returns its node to non-paged pool and releases its view
/// references.
pub struct OwnedVad<'a> {
    vad: Option<Vad>,
    pool: &'a NonPagedPool,
}

impl<'a> OwnedVad<'a> {
    /// Allocates the node and duplicates `source` into it.
    ///
    /// # Errors
    /// [`VadError::Pool`] when no node can be allocated.
    pub fn duplicate(source: &Vad, pool: &'a NonPagedPool) -> Result<Self, VadError> {
        pool.allocate(VAD_SIZE)?;
        let vad = source.duplicate();
        if let Some(control_area) = &vad.control_area {
            control_area.reference_view(vad.protection);
        }
        Ok(Self { vad: Some(vad), pool })
    }

    #[must_use]
    pub fn get(&self) -> &Vad {
        let Some(vad) = &self.vad else {
            unreachable!("owned VAD accessed after hand-over");
        };
        vad
    }

    /// Hands the node and its references over to the caller.
    #[must_use]
    pub fn into_vad(mut self) -> Vad {
        let Some(vad) = self.vad.take() else {
            unreachable!("owned VAD handed over twice");
        };
        vad
    }
}

impl Drop for OwnedVad<'_> {
    fn drop(&mut self) {
        if let Some(vad) = self.vad.take() {
            vad.release_view();
            self.pool.free(VAD_SIZE);
        }
    }
}

/// Address-ordered set of non-overlapping VADs.
#[derive(Default)]
pub struct VadTree {
    nodes: BTreeMap<VirtualPageNumber, Vad>,
}

impl VadTree {
    /// Inserts `vad`.
    ///
    /// # Errors
    /// [`VadError::Overlap`] when the range intersects an existing VAD.
    pub fn insert(&mut self, vad: Vad) -> Result<(), VadError> {
        let range = vad.range;
        let before = self.nodes.range(..=range.end()).next_back();
        if before.is_some_and(|(_, existing)| existing.range.overlaps(range)) {
            return Err(VadError::Overlap { start: range.start() });
        }
        self.nodes.insert(range.start(), vad);
        Ok(())
    }

    /// The VAD covering `vpn`.
    #[must_use]
    pub fn find(&self, vpn: VirtualPageNumber) -> Option<&Vad> {
        self.nodes
            .range(..=vpn)
            .next_back()
            .map(|(_, vad)| vad)
            .filter(|vad| vad.range.contains(vpn))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vad> {
        self.nodes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Vad> {
        core::mem::take(&mut self.nodes).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, pages: u64) -> VirtualPageRange {
        VirtualPageRange::with_len(VirtualPageNumber::new(start), pages)
    }

    #[test]
    fn overlapping_insert_is_refused() {
        let mut tree = VadTree::default();
        tree.insert(Vad::private(range(0x100, 4), Protection::READWRITE)).unwrap();
        tree.insert(Vad::private(range(0x200, 4), Protection::READWRITE)).unwrap();

        let err = tree
            .insert(Vad::private(range(0x1FE, 4), Protection::READWRITE))
            .unwrap_err();
        assert_eq!(err, VadError::Overlap { start: VirtualPageNumber::new(0x1FE) });
        assert!(tree.insert(Vad::private(range(0x104, 1), Protection::READONLY)).is_ok());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn find_returns_covering_region() {
        let mut tree = VadTree::default();
        tree.insert(Vad::private(range(0x100, 4), Protection::READWRITE)).unwrap();
        assert!(tree.find(VirtualPageNumber::new(0x103)).is_some());
        assert!(tree.find(VirtualPageNumber::new(0x104)).is_none());
        assert!(tree.find(VirtualPageNumber::new(0xFF)).is_none());
    }

    #[test]
    fn inheritance_rules() {
        let section = Arc::new(ControlArea::new(SectionKind::Data, 4, PoolAddress::new(0x6000_0000_0000)));
        let shared = Vad::view(
            VadType::MappedFile,
            range(0, 4),
            Protection::READWRITE,
            Inherit::Share,
            Arc::clone(&section),
        );
        let mut unmapped = shared.clone();
        unmapped.inherit = Inherit::Unmap;
        let mut private = Vad::private(range(0, 1), Protection::READWRITE);
        private.inherit = Inherit::Unmap;

        assert!(shared.is_inherited());
        assert!(!unmapped.is_inherited());
        assert!(private.is_inherited());
        assert!(!Vad::special(VadType::Awe, range(0, 1), Protection::READWRITE).is_inherited());
        assert!(Vad::special(VadType::PhysicalDevice, range(0, 1), Protection::READWRITE).is_inherited());
    }

    #[test]
    fn duplicate_clears_secured_flags_and_references_the_view() {
        let pool = NonPagedPool::new();
        let section = Arc::new(ControlArea::new(SectionKind::Data, 4, PoolAddress::new(0x6000_0000_0000)));
        section.reference_view(Protection::READWRITE);
        let mut source = Vad::view(
            VadType::MappedFile,
            range(0, 4),
            Protection::READWRITE,
            Inherit::Share,
            Arc::clone(&section),
        );
        source.flags = VadFlags::new()
            .with_no_change(true)
            .with_sec_no_change(true)
            .with_one_secured(true);

        let copy = OwnedVad::duplicate(&source, &pool).unwrap();
        assert!(copy.get().flags.no_change());
        assert!(!copy.get().flags.one_secured());
        assert_eq!(section.mapped_views(), 2);
        assert_eq!(section.writable_user_references(), 2);
        assert_eq!(pool.bytes_in_use(), VAD_SIZE);

        drop(copy);
        assert_eq!(section.mapped_views(), 1);
        assert_eq!(pool.bytes_in_use(), 0);
    }

    #[test]
    fn private_duplicate_loses_no_change() {
        let pool = NonPagedPool::new();
        let mut source = Vad::private(range(0, 2), Protection::READWRITE);
        source.flags = VadFlags::new().with_no_change(true);
        let copy = OwnedVad::duplicate(&source, &pool).unwrap();
        assert!(!copy.get().flags.no_change());
        let vad = copy.into_vad();
        assert_eq!(vad.commit_charge, 2);
        assert_eq!(pool.bytes_in_use(), VAD_SIZE);
    }
}
