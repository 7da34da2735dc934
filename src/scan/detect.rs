//! Sliding-window recognition of RC4-style substitution tables.
//!
//! The target builds keep each of the 256 table slots in its own fixed-size
//! unit (8 bytes in the 64-bit builds, 4 in the 32-bit ones) with the slot
//! value in the lowest-addressed byte and the rest of the unit taken up by
//! padding that matches a known bit pattern. That padding is what makes
//! scanning tractable: a single mask test throws out almost every position
//! in ordinary memory before any uniqueness bookkeeping runs.
//!
//! A table is recovered wherever 256 consecutive units at one stride and
//! offset all pass the mask test and their value bytes are pairwise
//! distinct, i.e. form a permutation of 0..=255.

pub(crate) const TABLE_LEN: usize = 256;

/// Sentinel for an unoccupied slot in either direction of the window maps.
const EMPTY: u16 = u16::MAX;

/// How raw units at one stride are interpreted, and which bit pattern marks
/// a unit as unable to encode a table slot.
///
/// The masks are empirical constants recovered from the analysed Shockwave
/// builds. They are configuration for this particular target family, not a
/// general property of RC4 state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryLayout {
    pub(crate) stride: usize,
    pub(crate) invalid_mask: u64,
}

/// 64-bit builds: one table slot per 8-byte unit.
pub(crate) const SHOCKWAVE_WIDE: EntryLayout = EntryLayout {
    stride: 8,
    invalid_mask: 0xffff_fffb_ffff_ff00,
};

/// 32-bit builds: one table slot per 4-byte unit.
pub(crate) const SHOCKWAVE_NARROW: EntryLayout = EntryLayout {
    stride: 4,
    invalid_mask: 0xffff_ff00,
};

impl EntryLayout {
    /// Alignment probes worth running for this layout. Tables are not
    /// guaranteed to start on a unit boundary of the containing mapping, so
    /// the half-stride offset is scanned as well.
    pub(crate) fn offsets(self) -> [usize; 2] {
        [0, self.stride / 2]
    }
}

/// A recovered table: the 256 value bytes in buffer order, plus the byte
/// offset of the first unit within the scanned buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Table {
    pub(crate) offset: usize,
    pub(crate) bytes: [u8; TABLE_LEN],
}

/// Lazily yields every table found in `buf` at the given layout and
/// starting byte offset, in ascending buffer position.
pub(crate) fn tables(buf: &[u8], layout: EntryLayout, offset: usize) -> Tables<'_> {
    // A buffer that cannot hold 256 units is rejected up front.
    let pos = if buf.len().saturating_sub(offset) < TABLE_LEN * layout.stride {
        buf.len()
    } else {
        offset
    };

    Tables {
        buf,
        layout,
        pos,
        run: 0,
        distinct: 0,
        slot_to_value: [EMPTY; TABLE_LEN],
        value_to_slot: [EMPTY; TABLE_LEN],
    }
}

pub(crate) struct Tables<'a> {
    buf: &'a [u8],
    layout: EntryLayout,
    /// Byte position of the next unit to examine.
    pos: usize,
    /// Units accepted since the current run started. Run-relative, so slot
    /// arithmetic never depends on absolute buffer offsets.
    run: usize,
    /// Values currently held by exactly one slot of the window.
    distinct: usize,
    slot_to_value: [u16; TABLE_LEN],
    value_to_slot: [u16; TABLE_LEN],
}

impl Tables<'_> {
    /// Tear down the window and start a fresh run.
    ///
    /// Only slots the current run actually wrote are visited, so a break
    /// costs at most as much as the entries inserted since the last reset;
    /// a break on an empty window touches nothing.
    fn reset_window(&mut self) {
        for slot in 0..self.run.min(TABLE_LEN) {
            let value = self.slot_to_value[slot];
            if value != EMPTY {
                debug_assert_eq!(self.value_to_slot[value as usize], slot as u16);
                self.value_to_slot[value as usize] = EMPTY;
                self.slot_to_value[slot] = EMPTY;
            }
        }
        self.run = 0;
        self.distinct = 0;
    }

    /// The window holds a complete permutation; copy it out in buffer
    /// order. `last` is the byte position of the newest unit.
    fn snapshot(&self, last: usize) -> Table {
        debug_assert!(self.run >= TABLE_LEN);
        debug_assert_eq!(self.distinct, TABLE_LEN);

        let mut bytes = [0u8; TABLE_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            // Oldest entry lives at slot `run % TABLE_LEN`.
            *byte = self.slot_to_value[(self.run + i) % TABLE_LEN] as u8;
        }

        Table {
            offset: last - (TABLE_LEN - 1) * self.layout.stride,
            bytes,
        }
    }
}

impl Iterator for Tables<'_> {
    type Item = Table;

    fn next(&mut self) -> Option<Table> {
        while self.pos + self.layout.stride <= self.buf.len() {
            let pos = self.pos;
            self.pos += self.layout.stride;

            let mut raw = [0u8; 8];
            raw[..self.layout.stride].copy_from_slice(&self.buf[pos..pos + self.layout.stride]);
            let raw = u64::from_le_bytes(raw);

            if raw & self.layout.invalid_mask != 0 {
                self.reset_window();
                continue;
            }

            let value = (raw & 0xff) as u16;
            let slot = self.run % TABLE_LEN;

            // The window is full and sliding: the slot's previous occupant
            // falls out of the window.
            let evicted = self.slot_to_value[slot];
            if evicted != EMPTY {
                self.value_to_slot[evicted as usize] = EMPTY;
                self.distinct -= 1;
            }

            // A value already held elsewhere is a collision: the stale slot
            // becomes a hole and the distinct count stays put, so the count
            // recovers naturally once the window slides over the hole.
            match self.value_to_slot[value as usize] {
                EMPTY => self.distinct += 1,
                stale => self.slot_to_value[stale as usize] = EMPTY,
            }
            self.value_to_slot[value as usize] = slot as u16;
            self.slot_to_value[slot] = value;
            self.run += 1;

            if self.distinct == TABLE_LEN {
                let table = self.snapshot(pos);
                // A recovered table consumes its run; the next table needs
                // 256 fresh units. Adjacent tables are still found.
                self.reset_window();
                return Some(table);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> [u8; TABLE_LEN] {
        let mut table = [0u8; TABLE_LEN];
        for (i, byte) in table.iter_mut().enumerate() {
            *byte = i as u8;
        }
        table
    }

    /// A fixed permutation that is not the identity. 7 is coprime to 256,
    /// so every value appears exactly once.
    fn scrambled() -> [u8; TABLE_LEN] {
        let mut table = [0u8; TABLE_LEN];
        for (i, byte) in table.iter_mut().enumerate() {
            *byte = (i * 7 + 13) as u8;
        }
        table
    }

    fn encode_wide(values: &[u8]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|&value| u64::from(value).to_le_bytes())
            .collect()
    }

    fn encode_narrow(values: &[u8]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|&value| u32::from(value).to_le_bytes())
            .collect()
    }

    #[test]
    fn empty_and_short_buffers_yield_nothing() {
        assert_eq!(tables(&[], SHOCKWAVE_WIDE, 0).count(), 0);

        // 255 units is one short of a table.
        let buf = encode_wide(&identity()[..255]);
        assert_eq!(tables(&buf, SHOCKWAVE_WIDE, 0).count(), 0);

        let buf = encode_narrow(&identity()[..255]);
        assert_eq!(tables(&buf, SHOCKWAVE_NARROW, 0).count(), 0);
    }

    #[test]
    fn recovers_identity_table() {
        let buf = encode_wide(&identity());
        let found: Vec<Table> = tables(&buf, SHOCKWAVE_WIDE, 0).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 0);
        assert_eq!(found[0].bytes, identity());
    }

    #[test]
    fn recovers_table_at_narrow_stride() {
        let buf = encode_narrow(&scrambled());
        let found: Vec<Table> = tables(&buf, SHOCKWAVE_NARROW, 0).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 0);
        assert_eq!(found[0].bytes, scrambled());
    }

    #[test]
    fn duplicate_value_yields_nothing() {
        let mut values = identity();
        values[10] = values[5];
        let buf = encode_wide(&values);
        assert_eq!(tables(&buf, SHOCKWAVE_WIDE, 0).count(), 0);
    }

    #[test]
    fn tiled_tables_found_once_per_tile() {
        let tile = encode_wide(&scrambled());
        let mut buf = Vec::new();
        for _ in 0..3 {
            buf.extend_from_slice(&tile);
        }

        let found: Vec<Table> = tables(&buf, SHOCKWAVE_WIDE, 0).collect();
        assert_eq!(found.len(), 3);
        for (i, table) in found.iter().enumerate() {
            assert_eq!(table.offset, i * tile.len());
            assert_eq!(table.bytes, scrambled());
        }
    }

    #[test]
    fn dirty_tile_skipped_but_clean_neighbors_found() {
        let clean = scrambled();
        let mut dirty = scrambled();
        dirty[10] = dirty[5];

        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_wide(&clean));
        buf.extend_from_slice(&encode_wide(&dirty));
        buf.extend_from_slice(&encode_wide(&clean));

        let found: Vec<Table> = tables(&buf, SHOCKWAVE_WIDE, 0).collect();
        assert_eq!(found.len(), 2);

        // First tile comes out intact.
        assert_eq!(found[0].offset, 0);
        assert_eq!(found[0].bytes, clean);

        // Nothing is reported for the dirty tile itself. The first complete
        // window after it starts at unit 11 of the dirty tile (the last unit
        // poisoned by the duplicate) plus one, and reads as a rotation of
        // the permutation.
        assert_ne!(found[1].offset, 256 * 8);
        assert_eq!(found[1].offset, (256 + 11) * 8);
        let mut rotated = [0u8; TABLE_LEN];
        rotated[..245].copy_from_slice(&clean[11..]);
        rotated[245..].copy_from_slice(&clean[..11]);
        assert_eq!(found[1].bytes, rotated);
    }

    #[test]
    fn masked_unit_restarts_run() {
        // 100 valid units, one unit with padding bits set, then a full
        // table. Only the table after the break may be reported, which also
        // means the run counter restarted at zero rather than carrying the
        // pre-break length.
        let mut buf = encode_wide(&identity()[..100]);
        buf.extend_from_slice(&0x100u64.to_le_bytes());
        buf.extend_from_slice(&encode_wide(&identity()));

        let found: Vec<Table> = tables(&buf, SHOCKWAVE_WIDE, 0).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 101 * 8);
        assert_eq!(found[0].bytes, identity());
    }

    #[test]
    fn offset_probe_finds_misaligned_table() {
        let mut buf = vec![0xff; 4];
        buf.extend_from_slice(&encode_wide(&scrambled()));

        assert_eq!(tables(&buf, SHOCKWAVE_WIDE, 0).count(), 0);

        let found: Vec<Table> = tables(&buf, SHOCKWAVE_WIDE, 4).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 4);
        assert_eq!(found[0].bytes, scrambled());
    }

    #[test]
    fn rescan_is_idempotent() {
        let mut buf = encode_wide(&scrambled());
        buf.extend_from_slice(&encode_wide(&identity()));

        let first: Vec<Table> = tables(&buf, SHOCKWAVE_WIDE, 0).collect();
        let second: Vec<Table> = tables(&buf, SHOCKWAVE_WIDE, 0).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }
}
