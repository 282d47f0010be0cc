//! Toroidal neighbor topology for the pond grid.
//!
//! Three variants are supported: 4-connected (von Neumann), 8-connected
//! (Moore) and 6-connected (offset-coordinate hexagonal). The hexagonal
//! variant routes the 5-bit facing value through a fixed lookup table that
//! biases certain facings toward certain directions.

/// Facing-to-direction table for the hexagonal grid. Indexed by the full
/// 5-bit facing value; entries are directions 0..5.
pub const HEX_DIRMAP: [u8; 32] = [
    0, 1, 2, 3, 4, 5, //
    0, 1, 2, 3, 3, 4, 5, //
    0, 1, 2, 3, 4, 5, //
    0, 1, 2, 2, 3, 4, 5, //
    0, 1, 2, 3, 4, 5,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Neighborhood {
    Four,
    Six,
    Eight,
}

impl Neighborhood {
    pub fn from_directions(n: u32) -> Option<Self> {
        match n {
            4 => Some(Neighborhood::Four),
            6 => Some(Neighborhood::Six),
            8 => Some(Neighborhood::Eight),
            _ => None,
        }
    }

    pub fn directions(self) -> u32 {
        match self {
            Neighborhood::Four => 4,
            Neighborhood::Six => 6,
            Neighborhood::Eight => 8,
        }
    }

    /// Map a cell position and facing to the neighboring position.
    /// Space is toroidal; it wraps at the edges.
    pub fn neighbor(
        self,
        width: usize,
        height: usize,
        x: usize,
        y: usize,
        facing: u8,
    ) -> (usize, usize) {
        let east = if x < width - 1 { x + 1 } else { 0 };
        let west = if x > 0 { x - 1 } else { width - 1 };
        let south = if y < height - 1 { y + 1 } else { 0 };
        let north = if y > 0 { y - 1 } else { height - 1 };

        match self {
            Neighborhood::Four => match facing & 0x3 {
                0 => (x, north),
                1 => (east, y),
                2 => (x, south),
                _ => (west, y),
            },
            Neighborhood::Eight => match facing & 0x7 {
                0 => (x, north),
                1 => (east, north),
                2 => (east, y),
                3 => (east, south),
                4 => (x, south),
                5 => (west, south),
                6 => (west, y),
                _ => (west, north),
            },
            Neighborhood::Six => {
                // Offset-coordinate hex grid: odd and even rows shear in
                // opposite directions.
                let dir = HEX_DIRMAP[(facing & 0x1f) as usize];
                if y & 1 == 1 {
                    match dir {
                        0 => (east, north),
                        1 => (east, y),
                        2 => (east, south),
                        3 => (x, south),
                        4 => (west, y),
                        _ => (x, north),
                    }
                } else {
                    match dir {
                        0 => (x, north),
                        1 => (east, y),
                        2 => (x, south),
                        3 => (west, south),
                        4 => (west, y),
                        _ => (west, north),
                    }
                }
            }
        }
    }
}
