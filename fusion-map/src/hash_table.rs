//! Block-coordinate hash table.
//!
//! `bucket_count` buckets of [`BUCKET_SIZE`] inline slots, followed by a shared
//! excess list. The last inline slot of a bucket links into the excess list and
//! excess entries link onward. Entries are only ever added until
//! [`HashTable::reset`], so a bucket's inline slots fill front to back.

use crate::error::MapError;
use glam::IVec3;

/// Inline slots per bucket.
pub const BUCKET_SIZE: usize = 2;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    coord: IVec3,
    block: u32,
    next: u32,
}

impl Slot {
    const EMPTY: Slot = Slot {
        coord: IVec3::ZERO,
        block: NIL,
        next: NIL,
    };

    fn is_occupied(&self) -> bool {
        self.block != NIL
    }
}

/// Why a coordinate could not be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFailure {
    /// The bucket was full and no excess entries were left.
    ExcessFull,
    /// The block pool had no blocks left.
    PoolFull,
}

/// Outcome of [`HashTable::find_or_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Found(u32),
    Inserted(u32),
    Failed(InsertFailure),
}

impl Insertion {
    pub fn block(&self) -> Option<u32> {
        match *self {
            Insertion::Found(block) | Insertion::Inserted(block) => Some(block),
            Insertion::Failed(_) => None,
        }
    }
}

/// Spatial hash of a block coordinate into `[0, bucket_count)`.
#[inline]
pub fn hash_coord(coord: IVec3, bucket_count: usize) -> usize {
    let h = (coord.x as i64 * 73_856_093) ^ (coord.y as i64 * 19_349_669) ^ (coord.z as i64 * 83_492_791);
    h.rem_euclid(bucket_count as i64) as usize
}

#[derive(Debug)]
pub struct HashTable {
    slots: Vec<Slot>,
    bucket_count: usize,
    excess_count: usize,
    excess_used: usize,
    occupied: usize,
}

impl HashTable {
    pub fn new(bucket_count: usize, excess_count: usize) -> Result<Self, MapError> {
        let total = bucket_count * BUCKET_SIZE + excess_count;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(total)
            .map_err(|source| MapError::Allocation {
                what: "hash entries",
                requested: total,
                source,
            })?;
        slots.resize(total, Slot::EMPTY);
        Ok(Self {
            slots,
            bucket_count,
            excess_count,
            excess_used: 0,
            occupied: 0,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Excess entries handed out since the last reset.
    pub fn excess_used(&self) -> usize {
        self.excess_used
    }

    /// Coordinates currently stored.
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Block index stored for `coord`.
    pub fn find(&self, coord: IVec3) -> Option<u32> {
        let base = hash_coord(coord, self.bucket_count) * BUCKET_SIZE;
        for slot in &self.slots[base..base + BUCKET_SIZE] {
            if !slot.is_occupied() {
                return None;
            }
            if slot.coord == coord {
                return Some(slot.block);
            }
        }
        let mut next = self.slots[base + BUCKET_SIZE - 1].next;
        while next != NIL {
            let slot = &self.slots[next as usize];
            if slot.coord == coord {
                return Some(slot.block);
            }
            next = slot.next;
        }
        None
    }

    /// Look up `coord`, inserting it with a block from `reserve` if absent.
    ///
    /// `reserve` is only called when a slot is available, so a failed
    /// insertion never consumes a block.
    pub fn find_or_insert(&mut self, coord: IVec3, reserve: impl FnOnce() -> Option<u32>) -> Insertion {
        let base = hash_coord(coord, self.bucket_count) * BUCKET_SIZE;

        for i in base..base + BUCKET_SIZE {
            let slot = self.slots[i];
            if slot.is_occupied() {
                if slot.coord == coord {
                    return Insertion::Found(slot.block);
                }
                continue;
            }
            let Some(block) = reserve() else {
                return Insertion::Failed(InsertFailure::PoolFull);
            };
            self.slots[i] = Slot {
                coord,
                block,
                next: NIL,
            };
            self.occupied += 1;
            return Insertion::Inserted(block);
        }

        // Walk the excess chain, remembering its tail.
        let mut tail = base + BUCKET_SIZE - 1;
        while self.slots[tail].next != NIL {
            tail = self.slots[tail].next as usize;
            if self.slots[tail].coord == coord {
                return Insertion::Found(self.slots[tail].block);
            }
        }

        if self.excess_used >= self.excess_count {
            return Insertion::Failed(InsertFailure::ExcessFull);
        }
        let Some(block) = reserve() else {
            return Insertion::Failed(InsertFailure::PoolFull);
        };
        let index = self.bucket_count * BUCKET_SIZE + self.excess_used;
        self.excess_used += 1;
        self.slots[index] = Slot {
            coord,
            block,
            next: NIL,
        };
        self.slots[tail].next = index as u32;
        self.occupied += 1;
        Insertion::Inserted(block)
    }

    /// Forget every entry. Capacity is kept.
    pub fn reset(&mut self) {
        self.slots.fill(Slot::EMPTY);
        self.excess_used = 0;
        self.occupied = 0;
    }
}
