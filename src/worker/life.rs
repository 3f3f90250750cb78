//! Conway kernel over one strip framed by its two halo rows.
//!
//! Vertical wrap never happens here: the rows above and below the strip are
//! always supplied by the caller (a neighbour's edge row, or the strip's
//! own edge rows in single-worker mode). Horizontal wrap uses a bitmask
//! when the width is a power of two and falls back to modulo otherwise.

use rayon::prelude::*;

use crate::prelude::*;

/// Evolves a strip one turn. Returns the next strip and the flipped cells
/// translated to world coordinates via `row_offset`.
pub fn evolve_strip(
    strip: &World,
    top: &[u8],
    bottom: &[u8],
    row_offset: u32,
) -> (World, Vec<Cell>) {
    let width = strip.width() as usize;
    let height = strip.height() as usize;

    debug_assert_eq!(top.len(), width);
    debug_assert_eq!(bottom.len(), width);

    let mask = width.is_power_of_two().then(|| width - 1);

    let rows: Vec<(Vec<u8>, Vec<Cell>)> = (0..height)
        .into_par_iter()
        .map(|y| {
            let above = if y == 0 {
                top
            } else {
                strip.row(y as u32 - 1)
            };
            let below = if y + 1 == height {
                bottom
            } else {
                strip.row(y as u32 + 1)
            };
            let current = strip.row(y as u32);

            let mut next = vec![DEAD; width];
            let mut flipped = Vec::new();

            for x in 0..width {
                let neighbours = neighbour_count(above, current, below, x, width, mask);
                let cell = current[x];
                let new_cell = apply_rules(cell, neighbours);
                next[x] = new_cell;
                if cell ^ new_cell == ALIVE {
                    flipped.push(Cell::new(x as u32, y as u32 + row_offset));
                }
            }

            (next, flipped)
        })
        .collect();

    let mut cells = Vec::with_capacity(width * height);
    let mut all_flipped = Vec::new();
    for (row, flips) in rows {
        cells.extend(row);
        all_flipped.extend(flips);
    }

    (
        World::from_raw(strip.width(), strip.height(), cells),
        all_flipped,
    )
}

fn wrap_left(x: usize, width: usize, mask: Option<usize>) -> usize {
    match mask {
        Some(mask) => x.wrapping_sub(1) & mask,
        None => (x + width - 1) % width,
    }
}

fn wrap_right(x: usize, width: usize, mask: Option<usize>) -> usize {
    match mask {
        Some(mask) => (x + 1) & mask,
        None => (x + 1) % width,
    }
}

fn neighbour_count(
    above: &[u8],
    current: &[u8],
    below: &[u8],
    x: usize,
    width: usize,
    mask: Option<usize>,
) -> u8 {
    let left = wrap_left(x, width, mask);
    let right = wrap_right(x, width, mask);

    (above[left] >> 7)
        + (above[x] >> 7)
        + (above[right] >> 7)
        + (current[left] >> 7)
        + (current[right] >> 7)
        + (below[left] >> 7)
        + (below[x] >> 7)
        + (below[right] >> 7)
}

fn apply_rules(cell: u8, neighbours: u8) -> u8 {
    if !(2..=3).contains(&neighbours) {
        DEAD
    } else if cell & 0x80 == 0 && neighbours == 3 {
        ALIVE
    } else {
        cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattica_testing::{evolve, patterns};

    /// Runs the kernel as a single strip covering the whole world, taking
    /// its own edge rows as halos.
    fn evolve_whole(world: &World) -> (World, Vec<Cell>) {
        let top = world.row(world.height() - 1).to_vec();
        let bottom = world.row(0).to_vec();
        evolve_strip(world, &top, &bottom, 0)
    }

    #[test]
    fn matches_the_oracle_on_a_full_world() {
        let mut world = World::from_cells(16, 16, &patterns::r_pentomino());
        let mut expected = world.clone();

        for _ in 0..12 {
            expected = evolve(&expected);
            let (next, flipped) = evolve_whole(&world);
            let mut replayed = world.clone();
            replayed.apply(&flipped);
            assert_eq!(replayed, next);
            world = next;
        }

        assert_eq!(world, expected);
    }

    #[test]
    fn modulo_fallback_matches_the_oracle() {
        // width 12 disables the bitmask fast path
        let mut world = World::from_cells(12, 12, &patterns::glider());
        let mut expected = world.clone();

        for _ in 0..8 {
            expected = evolve(&expected);
            world = evolve_whole(&world).0;
        }

        assert_eq!(world, expected);
    }

    #[test]
    fn split_strips_agree_with_the_full_world() {
        let world = World::from_cells(16, 16, &patterns::r_pentomino());
        let expected = evolve(&world);

        // cut at row 7: strip A rows 0..7, strip B rows 7..16
        let strip_a = World::from_raw(16, 7, (0..7).flat_map(|y| world.row(y).to_vec()).collect());
        let strip_b =
            World::from_raw(16, 9, (7..16).flat_map(|y| world.row(y).to_vec()).collect());

        let (next_a, flips_a) =
            evolve_strip(&strip_a, world.row(15), world.row(7), 0);
        let (next_b, flips_b) =
            evolve_strip(&strip_b, world.row(6), world.row(0), 7);

        let mut glued = World::blank(16, 16);
        glued.apply(&world.alive_cells());
        glued.apply(&flips_a);
        glued.apply(&flips_b);
        assert_eq!(glued, expected);

        for y in 0..7 {
            assert_eq!(next_a.row(y), expected.row(y));
        }
        for y in 7..16 {
            assert_eq!(next_b.row(y - 7), expected.row(y));
        }
    }

    #[test]
    fn flipped_cells_carry_the_row_offset() {
        let strip = World::from_cells(8, 2, &[Cell::new(1, 0), Cell::new(2, 0), Cell::new(3, 0)]);
        let dead_row = vec![DEAD; 8];

        let (_, flipped) = evolve_strip(&strip, &dead_row, &dead_row, 4);

        assert!(flipped.iter().all(|c| c.y >= 4));
        assert!(flipped.contains(&Cell::new(2, 5)));
    }

    #[test]
    fn rules_read_only_the_msb() {
        // 0x81 counts as alive, 0x7F as dead
        assert_eq!(apply_rules(0x81, 1), DEAD);
        assert_eq!(apply_rules(0x81, 2), 0x81);
        assert_eq!(apply_rules(0x7F, 3), ALIVE);
        assert_eq!(apply_rules(0x7F, 2), 0x7F);
        assert_eq!(apply_rules(ALIVE, 4), DEAD);
    }
}
