use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{BrokenInvariant, Cell, ALIVE, DEAD};

/// Dense cell grid, `height * width` bytes with rows stored contiguously.
/// One byte per cell, the MSB holds the alive bit.
///
/// The broker owns the authoritative copy during a run, the controller keeps
/// a lock-step shadow and each worker holds just its strip (with `y`
/// translated by the strip's row offset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    width: u32,
    height: u32,
    cells: Vec<u8>,
}

impl World {
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![DEAD; width as usize * height as usize],
        }
    }

    pub fn from_cells(width: u32, height: u32, alive: &[Cell]) -> Self {
        let mut world = Self::blank(width, height);
        for cell in alive {
            world.set_alive(cell);
        }
        world
    }

    /// Builds a world from pre-computed row bytes. Panics if the buffer does
    /// not match the dimensions; callers construct the buffer themselves.
    pub fn from_raw(width: u32, height: u32, cells: Vec<u8>) -> Self {
        assert_eq!(cells.len(), width as usize * height as usize);
        Self {
            width,
            height,
            cells,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn in_bounds(&self, cell: &Cell) -> bool {
        cell.x < self.width && cell.y < self.height
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.cells[self.index(x, y)]
    }

    pub fn is_alive(&self, x: u32, y: u32) -> bool {
        self.get(x, y) & 0x80 != 0
    }

    pub fn set_alive(&mut self, cell: &Cell) {
        if !self.in_bounds(cell) {
            warn!(
                violation = %BrokenInvariant::CellOutOfBounds(*cell, self.width, self.height),
                "ignoring cell"
            );
            return;
        }
        let idx = self.index(cell.x, cell.y);
        self.cells[idx] = ALIVE;
    }

    /// Inverts one cell. Flipping is its own inverse, which is what makes
    /// delta application idempotent in pairs.
    pub fn flip(&mut self, cell: &Cell) {
        if !self.in_bounds(cell) {
            warn!(
                violation = %BrokenInvariant::CellOutOfBounds(*cell, self.width, self.height),
                "ignoring cell"
            );
            return;
        }
        let idx = self.index(cell.x, cell.y);
        self.cells[idx] ^= ALIVE;
    }

    /// XOR-applies a flipped-cell delta.
    pub fn apply(&mut self, delta: &[Cell]) {
        for cell in delta {
            self.flip(cell);
        }
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = self.index(0, y);
        &self.cells[start..start + self.width as usize]
    }

    pub fn alive_cells(&self) -> Vec<Cell> {
        self.alive_cells_in_rows(0..self.height)
    }

    /// Alive cells within a row range, in world coordinates. This is what
    /// the broker ships to a worker as the initial state of its strip.
    pub fn alive_cells_in_rows(&self, rows: Range<u32>) -> Vec<Cell> {
        let mut cells = Vec::new();
        for y in rows {
            for (x, value) in self.row(y).iter().enumerate() {
                if value & 0x80 != 0 {
                    cells.push(Cell::new(x as u32, y));
                }
            }
        }
        cells
    }

    pub fn count_alive(&self) -> usize {
        self.cells.iter().filter(|c| *c & 0x80 != 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(raw: &[(u32, u32)]) -> Vec<Cell> {
        raw.iter().map(|c| Cell::from(*c)).collect()
    }

    #[test]
    fn construct_and_read_back() {
        let alive = cells(&[(1, 0), (1, 1), (1, 2)]);
        let world = World::from_cells(16, 16, &alive);

        assert_eq!(world.alive_cells(), alive);
        assert_eq!(world.count_alive(), 3);
        assert!(world.is_alive(1, 1));
        assert!(!world.is_alive(0, 0));
    }

    #[test]
    fn apply_twice_is_identity() {
        let initial = cells(&[(3, 3), (4, 3)]);
        let mut world = World::from_cells(8, 8, &initial);
        let delta = cells(&[(3, 3), (5, 5), (0, 7)]);

        world.apply(&delta);
        assert_eq!(world.count_alive(), 4);

        world.apply(&delta);
        assert_eq!(world, World::from_cells(8, 8, &initial));
    }

    #[test]
    fn strip_rows_translate_to_world_coordinates() {
        let world = World::from_cells(8, 8, &cells(&[(2, 0), (5, 3), (7, 4)]));

        assert_eq!(world.alive_cells_in_rows(3..5), cells(&[(5, 3), (7, 4)]));
        assert_eq!(world.alive_cells_in_rows(1..3), vec![]);
    }

    #[test]
    fn out_of_bounds_flip_is_ignored() {
        let mut world = World::blank(4, 4);
        world.flip(&Cell::new(9, 9));
        assert_eq!(world.count_alive(), 0);
    }

    #[test]
    fn row_access() {
        let world = World::from_cells(4, 2, &cells(&[(0, 1), (3, 1)]));
        assert_eq!(world.row(0), &[DEAD; 4]);
        assert_eq!(world.row(1), &[ALIVE, DEAD, DEAD, ALIVE]);
    }
}
