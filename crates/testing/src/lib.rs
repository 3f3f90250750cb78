//! Test fixtures for the lattica crates: a straightforward single-threaded
//! Life simulator used as the oracle, plus a handful of canned patterns.
//!
//! The oracle deliberately shares no code with the engine kernel. It walks
//! the whole world with modulo arithmetic in both axes, so any agreement
//! between the two is meaningful.

use lattica_core::{Cell, World, DEAD};

const OFFSETS: [(i64, i64); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

fn neighbour_count(world: &World, x: u32, y: u32) -> u8 {
    let width = world.width() as i64;
    let height = world.height() as i64;

    let mut alive = 0;
    for (dy, dx) in OFFSETS {
        let nx = (x as i64 + dx).rem_euclid(width) as u32;
        let ny = (y as i64 + dy).rem_euclid(height) as u32;
        if world.is_alive(nx, ny) {
            alive += 1;
        }
    }
    alive
}

/// One generation of Conway's rules over the full toroidal world.
pub fn evolve(world: &World) -> World {
    let mut next = World::blank(world.width(), world.height());
    for y in 0..world.height() {
        for x in 0..world.width() {
            let neighbours = neighbour_count(world, x, y);
            let alive = match (world.is_alive(x, y), neighbours) {
                (true, 2) | (true, 3) => true,
                (false, 3) => true,
                _ => false,
            };
            if alive {
                next.set_alive(&Cell::new(x, y));
            }
        }
    }
    next
}

pub fn evolve_n(world: &World, turns: u64) -> World {
    let mut current = world.clone();
    for _ in 0..turns {
        current = evolve(&current);
    }
    current
}

/// Cells that differ between two worlds of the same size.
pub fn diff(a: &World, b: &World) -> Vec<Cell> {
    assert_eq!(a.width(), b.width());
    assert_eq!(a.height(), b.height());

    let mut flipped = Vec::new();
    for y in 0..a.height() {
        for x in 0..a.width() {
            if a.is_alive(x, y) != b.is_alive(x, y) {
                flipped.push(Cell::new(x, y));
            }
        }
    }
    flipped
}

pub mod patterns {
    use lattica_core::Cell;

    fn cells(raw: &[(u32, u32)]) -> Vec<Cell> {
        raw.iter().map(|c| Cell::from(*c)).collect()
    }

    /// Period-2 oscillator.
    pub fn blinker() -> Vec<Cell> {
        cells(&[(1, 0), (1, 1), (1, 2)])
    }

    /// 2x2 still life.
    pub fn block() -> Vec<Cell> {
        cells(&[(1, 1), (2, 1), (1, 2), (2, 2)])
    }

    /// Translates by (1, 1) every 4 generations.
    pub fn glider() -> Vec<Cell> {
        cells(&[(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)])
    }

    /// Methuselah with a long chaotic tail, handy for stressing deltas.
    pub fn r_pentomino() -> Vec<Cell> {
        cells(&[(11, 10), (12, 10), (10, 11), (11, 11), (11, 12)])
    }
}

/// Translates a pattern on the torus.
pub fn translate(cells: &[Cell], dx: u32, dy: u32, width: u32, height: u32) -> Vec<Cell> {
    cells
        .iter()
        .map(|c| Cell::new((c.x + dx) % width, (c.y + dy) % height))
        .collect()
}

/// Cheap content check used by assertions on byte values.
pub fn is_blank(world: &World) -> bool {
    (0..world.height()).all(|y| world.row(y).iter().all(|c| *c == DEAD))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blinker_oscillates_with_period_two() {
        let initial = World::from_cells(16, 16, &patterns::blinker());

        let one = evolve(&initial);
        let mut expected: Vec<Cell> = [(0, 1), (1, 1), (2, 1)]
            .iter()
            .map(|c| Cell::from(*c))
            .collect();
        expected.sort();
        let mut got = one.alive_cells();
        got.sort();
        assert_eq!(got, expected);

        let two = evolve(&one);
        assert_eq!(two, initial);
    }

    #[test]
    fn block_is_still() {
        let initial = World::from_cells(16, 16, &patterns::block());
        assert_eq!(evolve_n(&initial, 10), initial);
    }

    #[test]
    fn glider_translates_diagonally() {
        let initial = World::from_cells(16, 16, &patterns::glider());
        let moved = evolve_n(&initial, 4);

        let mut expected = translate(&patterns::glider(), 1, 1, 16, 16);
        expected.sort();
        let mut got = moved.alive_cells();
        got.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn evolution_wraps_across_the_seam() {
        // vertical blinker straddling the top edge
        let initial = World::from_cells(8, 8, &[
            Cell::new(3, 7),
            Cell::new(3, 0),
            Cell::new(3, 1),
        ]);

        let one = evolve(&initial);
        let mut got = one.alive_cells();
        got.sort();
        assert_eq!(
            got,
            vec![Cell::new(2, 0), Cell::new(3, 0), Cell::new(4, 0)]
        );

        assert_eq!(evolve(&one), initial);
    }

    #[test]
    fn diff_and_apply_agree() {
        let a = World::from_cells(16, 16, &patterns::r_pentomino());
        let b = evolve(&a);

        let delta = diff(&a, &b);
        let mut patched = a.clone();
        patched.apply(&delta);
        assert_eq!(patched, b);
    }

    #[test]
    fn empty_world_stays_empty() {
        let initial = World::blank(8, 8);
        assert!(is_blank(&evolve_n(&initial, 5)));
    }
}
