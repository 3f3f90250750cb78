//! Row partitioning across the worker pool.
//!
//! Strips are contiguous row ranges assigned in worker-id order. Heights
//! differ by at most one, with the remainder going to the lowest ids.

/// Per-worker strip heights for `height` rows across `workers` strips.
pub fn split_rows(height: u32, workers: usize) -> Vec<u32> {
    assert!(workers > 0, "cannot partition across zero workers");

    let base = height / workers as u32;
    let remainder = (height % workers as u32) as usize;

    (0..workers)
        .map(|i| base + u32::from(i < remainder))
        .collect()
}

/// Cumulative row offsets for strips of the given heights.
pub fn row_offsets(heights: &[u32]) -> Vec<u32> {
    let mut offset = 0;
    heights
        .iter()
        .map(|h| {
            let current = offset;
            offset += h;
            current
        })
        .collect()
}

/// Indices of the strip above and below `index`, wrapping toroidally: the
/// first strip's top neighbour is the last strip and vice versa.
pub fn wrap_neighbours(index: usize, count: usize) -> (usize, usize) {
    let top = if index == 0 { count - 1 } else { index - 1 };
    let bottom = if index + 1 == count { 0 } else { index + 1 };
    (top, bottom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_division() {
        assert_eq!(split_rows(16, 4), vec![4, 4, 4, 4]);
    }

    #[test]
    fn remainder_goes_to_lowest_ids() {
        assert_eq!(split_rows(16, 3), vec![6, 5, 5]);
        assert_eq!(split_rows(7, 4), vec![2, 2, 2, 1]);
    }

    #[test]
    fn heights_differ_by_at_most_one() {
        for height in 1..64u32 {
            for workers in 1..=height as usize {
                let heights = split_rows(height, workers);
                let max = heights.iter().max().unwrap();
                let min = heights.iter().min().unwrap();
                assert!(max - min <= 1);
                assert_eq!(heights.iter().sum::<u32>(), height);
            }
        }
    }

    #[test]
    fn offsets_are_cumulative() {
        assert_eq!(row_offsets(&[6, 5, 5]), vec![0, 6, 11]);
        assert_eq!(row_offsets(&[4]), vec![0]);
    }

    #[test]
    fn neighbours_wrap() {
        assert_eq!(wrap_neighbours(0, 4), (3, 1));
        assert_eq!(wrap_neighbours(3, 4), (2, 0));
        assert_eq!(wrap_neighbours(1, 4), (0, 2));
        // with two strips, each is both neighbours of the other
        assert_eq!(wrap_neighbours(0, 2), (1, 1));
        // a single strip is its own neighbour in both directions
        assert_eq!(wrap_neighbours(0, 1), (0, 0));
    }
}
