//! Region-based pool of connection slots. Slots are handed out through a
//! free-list and addressed by stable indices; a freed slot bumps its
//! generation so any handle minted for the previous occupant goes stale.

use crate::logging;
use crate::net::conn::{ClientToken, Connection};
use once_cell::sync::OnceCell;
use std::sync::{Mutex, MutexGuard};

/// Upper bound on the number of slot regions.
pub const MAX_REGIONS: usize = 100;
/// Slots carved out of each region.
pub const REGION_SLOTS: usize = 128;

/// One pooled connection slot. The index never changes; the connection
/// behind the mutex is recycled across clients.
pub struct Slot {
    index: usize,
    conn: Mutex<Connection>,
}

impl Slot {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn connection(&self) -> MutexGuard<Connection> {
        self.conn.lock().expect("connection lock poisoned")
    }
}

struct FreeList {
    indices: Vec<usize>,
    regions: usize,
}

pub struct ClientArena {
    // Fixed table of lazily-created regions, so slots stay reachable without
    // taking the free-list lock.
    regions: Box<[OnceCell<Box<[Slot]>>]>,
    free: Mutex<FreeList>,
    max_regions: usize,
    log: logging::Logger,
}

impl ClientArena {
    pub fn new(log: logging::Logger) -> ClientArena {
        Self::with_capacity(MAX_REGIONS, log)
    }

    /// Build an arena bounded at `max_regions` regions. The first region is
    /// carved eagerly so startup failures surface early.
    pub fn with_capacity(max_regions: usize, log: logging::Logger) -> ClientArena {
        assert!(max_regions >= 1 && max_regions <= MAX_REGIONS);

        let arena = ClientArena {
            regions: (0..max_regions).map(|_| OnceCell::new()).collect::<Vec<_>>().into_boxed_slice(),
            free: Mutex::new(FreeList {
                indices: Vec::new(),
                regions: 0,
            }),
            max_regions,
            log,
        };

        {
            let mut free = arena.free.lock().expect("arena free-list lock poisoned");
            arena.grow(&mut free);
        }

        arena
    }

    /// Carve a new region and push its slots onto the free-list. Returns
    /// false once the region cap is reached.
    fn grow(&self, free: &mut FreeList) -> bool {
        if free.regions == self.max_regions {
            logging::warn!(self.log, "client arena at region cap"; "regions" => free.regions);
            return false;
        }

        let base = free.regions * REGION_SLOTS;
        let slots: Box<[Slot]> = (0..REGION_SLOTS)
            .map(|offset| Slot {
                index: base + offset,
                conn: Mutex::new(Connection::new()),
            })
            .collect();

        self.regions[free.regions]
            .set(slots)
            .unwrap_or_else(|_| panic!("Region {} initialized twice", free.regions));

        free.regions += 1;

        // Reverse order so low indices are loaned out first.
        for offset in (0..REGION_SLOTS).rev() {
            free.indices.push(base + offset);
        }

        logging::debug!(self.log, "client arena grew"; "regions" => free.regions, "slots" => free.regions * REGION_SLOTS);

        true
    }

    /// Loan out a vacant slot. `None` means every region is carved and every
    /// slot is in use.
    pub fn alloc(&self) -> Option<ClientToken> {
        let index = {
            let mut free = self.free.lock().expect("arena free-list lock poisoned");

            if free.indices.is_empty() && !self.grow(&mut free) {
                return None;
            }

            free.indices.pop().expect("free-list populated by grow")
        };

        let generation = self
            .slot(index)
            .expect("allocated slot must exist")
            .connection()
            .generation();

        Some(ClientToken { index, generation })
    }

    /// Return a slot to the free-list. The connection is closed and its
    /// generation advanced, so `token` and any copies of it become inert. A
    /// stale token is a no-op.
    pub fn free(&self, token: ClientToken) {
        let slot = match self.slot(token.index) {
            Some(slot) => slot,
            None => return,
        };

        {
            let mut conn = slot.connection();

            if conn.generation() != token.generation {
                return;
            }

            conn.close();
        }

        let mut free = self.free.lock().expect("arena free-list lock poisoned");
        free.indices.push(token.index);
    }

    /// Look up a slot by index. `None` for indices in regions that were
    /// never carved.
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        let region = index / REGION_SLOTS;
        let offset = index % REGION_SLOTS;

        self.regions
            .get(region)
            .and_then(|cell| cell.get())
            .map(|slots| &slots[offset])
    }

    /// Number of slots currently loaned out.
    pub fn loaned(&self) -> usize {
        let free = self.free.lock().expect("arena free-list lock poisoned");
        free.regions * REGION_SLOTS - free.indices.len()
    }
}
