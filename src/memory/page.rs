//! Pages and the four-level radix page table.
//!
//! A page is a 4 KiB aligned unit of the linear address space carrying
//! permission flags and a reference count. The table is indexed by address
//! bits [47:39], [38:30], [29:21] and [20:12], 512 entries per level, with
//! each level owning its children. Missing inner levels mean "no page".

use bitflags::bitflags;

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 4096;
/// Mask extracting the byte offset within a page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;
/// Entries per page-table level.
const FANOUT: usize = 512;

bitflags! {
    /// Permission and state bits carried by each page.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        const READ    = 1;
        const WRITE   = 1 << 1;
        const EXEC    = 1 << 2;
        const PRESENT = 1 << 3;
    }
}

impl PageFlags {
    /// Read-execute, used for the text segment.
    pub const RX: PageFlags = PageFlags::READ.union(PageFlags::EXEC).union(PageFlags::PRESENT);
    /// Read-only, used for rodata.
    pub const R: PageFlags = PageFlags::READ.union(PageFlags::PRESENT);
    /// Read-write, used for data, bss, stacks and the heap.
    pub const RW: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::PRESENT);
}

/// A committed page: flags, the number of allocation records spanning it,
/// and its backing buffer.
///
/// The buffer materializes on first write; reads of a committed page that was
/// never written observe zeros, which is exactly what a freshly committed
/// page holds.
pub struct Page {
    pub flags: PageFlags,
    pub ref_count: u64,
    data: Option<Box<[u8; PAGE_SIZE as usize]>>,
}

impl Page {
    fn new(flags: PageFlags) -> Self {
        Self {
            flags,
            ref_count: 0,
            data: None,
        }
    }

    pub fn readable(&self) -> bool {
        self.flags.contains(PageFlags::READ)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITE)
    }

    pub fn executable(&self) -> bool {
        self.flags.contains(PageFlags::EXEC)
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the page.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        match &self.data {
            Some(data) => dst.copy_from_slice(&data[offset..offset + dst.len()]),
            None => dst.fill(0),
        }
    }

    /// Copies `src` into the page at `offset`, materializing the buffer.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        let data = self
            .data
            .get_or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
        data[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// Index of the slot at `level` (3 = root) for `addr`.
fn slot(addr: u64, level: u32) -> usize {
    ((addr >> (12 + 9 * level)) & 0x1FF) as usize
}

fn empty_slots<T>() -> Box<[Option<T>]> {
    (0..FANOUT).map(|_| None).collect()
}

struct Directory<T> {
    slots: Box<[Option<T>]>,
}

impl<T> Directory<T> {
    fn new() -> Self {
        Self {
            slots: empty_slots(),
        }
    }
}

type Leaf = Directory<Page>;
type L2 = Directory<Box<Leaf>>;
type L3 = Directory<Box<L2>>;

/// Four-level radix tree from page-aligned addresses to [`Page`]s.
///
/// Inner levels are kept sparse once created; only leaf pages are released.
pub struct PageTable {
    root: Directory<Box<L3>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            root: Directory::new(),
        }
    }

    /// Looks up the page containing `addr`.
    pub fn page(&self, addr: u64) -> Option<&Page> {
        self.root.slots[slot(addr, 3)]
            .as_ref()?
            .slots[slot(addr, 2)]
            .as_ref()?
            .slots[slot(addr, 1)]
            .as_ref()?
            .slots[slot(addr, 0)]
            .as_ref()
    }

    /// Mutable lookup of the page containing `addr`.
    pub fn page_mut(&mut self, addr: u64) -> Option<&mut Page> {
        self.root.slots[slot(addr, 3)]
            .as_mut()?
            .slots[slot(addr, 2)]
            .as_mut()?
            .slots[slot(addr, 1)]
            .as_mut()?
            .slots[slot(addr, 0)]
            .as_mut()
    }

    /// Commits the page containing `addr` if absent, creating intermediate
    /// levels as needed, and returns it. An existing page keeps its buffer
    /// and has `flags` OR-ed in (segments and allocations may share a
    /// boundary page).
    pub fn set_if_absent(&mut self, addr: u64, flags: PageFlags) -> &mut Page {
        let l3 = self.root.slots[slot(addr, 3)].get_or_insert_with(|| Box::new(Directory::new()));
        let l2 = l3.slots[slot(addr, 2)].get_or_insert_with(|| Box::new(Directory::new()));
        let leaf = l2.slots[slot(addr, 1)].get_or_insert_with(|| Box::new(Directory::new()));
        let page = leaf.slots[slot(addr, 0)].get_or_insert_with(|| Page::new(flags));
        page.flags |= flags;
        page
    }

    /// Drops the page containing `addr`. Intermediate levels stay sparse.
    pub fn release(&mut self, addr: u64) {
        let Some(l3) = self.root.slots[slot(addr, 3)].as_mut() else {
            return;
        };
        let Some(l2) = l3.slots[slot(addr, 2)].as_mut() else {
            return;
        };
        let Some(leaf) = l2.slots[slot(addr, 1)].as_mut() else {
            return;
        };
        leaf.slots[slot(addr, 0)] = None;
    }

    /// Drops every page and every level.
    pub fn reset(&mut self) {
        self.root = Directory::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_page_is_none() {
        let table = PageTable::new();
        assert!(table.page(0).is_none());
        assert!(table.page(0x7fff_ffff_f000).is_none());
    }

    #[test]
    fn set_if_absent_then_lookup() {
        let mut table = PageTable::new();
        table.set_if_absent(0x1000, PageFlags::RW).ref_count = 1;
        let page = table.page(0x1abc).expect("same page for any offset");
        assert_eq!(page.ref_count, 1);
        assert!(page.writable());
        assert!(table.page(0x2000).is_none());
    }

    #[test]
    fn set_if_absent_unions_flags() {
        let mut table = PageTable::new();
        table.set_if_absent(0, PageFlags::RX);
        let page = table.set_if_absent(0, PageFlags::RW);
        assert!(page.readable() && page.writable() && page.executable());
    }

    #[test]
    fn release_drops_only_the_leaf() {
        let mut table = PageTable::new();
        table.set_if_absent(0x1000, PageFlags::RW);
        table.set_if_absent(0x2000, PageFlags::RW);
        table.release(0x1000);
        assert!(table.page(0x1000).is_none());
        assert!(table.page(0x2000).is_some());
    }

    #[test]
    fn distant_addresses_use_distinct_subtrees() {
        let mut table = PageTable::new();
        table.set_if_absent(0x0000_0000_1000, PageFlags::RW);
        table.set_if_absent(0xffff_ffff_f000, PageFlags::R);
        assert!(table.page(0x0000_0000_1000).is_some());
        assert!(table.page(0xffff_ffff_f000).is_some());
        table.reset();
        assert!(table.page(0x0000_0000_1000).is_none());
    }

    #[test]
    fn reads_before_first_write_are_zero() {
        let mut table = PageTable::new();
        let page = table.set_if_absent(0, PageFlags::RW);
        let mut buf = [0xFF; 4];
        page.read(100, &mut buf);
        assert_eq!(buf, [0; 4]);
        page.write(100, &[1, 2]);
        page.read(100, &mut buf);
        assert_eq!(buf, [1, 2, 0, 0]);
    }
}
