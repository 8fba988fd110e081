//! Intermediate buffers shared by the three stages.
//!
//! The workspace holds three regions:
//!
//! - **tiles**: one packed tile per (row, vocab part) written by Stage 1:
//!   `2K` ids, `2K` raw values and the slice's [`Md`].
//! - **candidate ids**: `2K` token ids per row written by Stage 2.
//! - **candidate values**: `2K` total scores per row written by Stage 2.
//!
//! A candidate's origin beam is implied by its position: candidate `i` of a
//! batch item came from beam `i / 2K`.

use beamwise::{BeamSearchConfig, Error, Md, Result};

/// Id marking an empty tile entry.
pub const INVALID_ID: u32 = u32::MAX;

/// Packed Stage 1 output.
#[derive(Debug, Clone)]
pub struct TileBuffer {
    ids: Vec<u32>,
    values: Vec<f32>,
    md: Vec<Md>,
    tile_len: usize,
    n_parts: usize,
}

/// Read-only view of one tile.
#[derive(Debug, Clone, Copy)]
pub struct Tile<'a> {
    pub ids: &'a [u32],
    pub values: &'a [f32],
    pub md: Md,
}

/// Mutable view of one tile, handed to the group that owns it.
pub struct TileMut<'a> {
    pub ids: &'a mut [u32],
    pub values: &'a mut [f32],
    pub md: &'a mut Md,
}

impl TileBuffer {
    pub(crate) fn new(rows: usize, n_parts: usize, tile_len: usize) -> Self {
        let tiles = rows * n_parts;
        Self {
            ids: vec![INVALID_ID; tiles * tile_len],
            values: vec![f32::NEG_INFINITY; tiles * tile_len],
            md: vec![Md::EMPTY; tiles],
            tile_len,
            n_parts,
        }
    }

    /// Entries per tile (`2K`).
    #[must_use]
    pub fn tile_len(&self) -> usize {
        self.tile_len
    }

    /// Vocab parts per row.
    #[must_use]
    pub fn n_parts(&self) -> usize {
        self.n_parts
    }

    /// Number of rows the buffer can hold.
    #[must_use]
    pub fn max_rows(&self) -> usize {
        self.md.len() / self.n_parts
    }

    #[must_use]
    pub fn tile(&self, row: usize, part: usize) -> Tile<'_> {
        let t = row * self.n_parts + part;
        let range = t * self.tile_len..(t + 1) * self.tile_len;
        Tile {
            ids: &self.ids[range.clone()],
            values: &self.values[range],
            md: self.md[t],
        }
    }

    /// All tiles of `row`, packed back to back.
    #[must_use]
    pub fn row(&self, row: usize) -> (&[u32], &[f32], &[Md]) {
        let span = self.n_parts * self.tile_len;
        (
            &self.ids[row * span..(row + 1) * span],
            &self.values[row * span..(row + 1) * span],
            &self.md[row * self.n_parts..(row + 1) * self.n_parts],
        )
    }

    /// Raw storage for the first `rows` rows: ids, values and one `Md` per tile.
    pub(crate) fn rows_mut(&mut self, rows: usize) -> (&mut [u32], &mut [f32], &mut [Md]) {
        let tiles = rows * self.n_parts;
        (
            &mut self.ids[..tiles * self.tile_len],
            &mut self.values[..tiles * self.tile_len],
            &mut self.md[..tiles],
        )
    }
}

/// Buffers for one beam search run on the CPU backend.
#[derive(Debug, Clone)]
pub struct CpuWorkspace {
    pub(crate) tiles: TileBuffer,
    pub(crate) candidate_ids: Vec<u32>,
    pub(crate) candidate_values: Vec<f32>,
    beam_width: usize,
    /// Rows covered by the last `top_k_softmax` call.
    pub(crate) rows: usize,
}

impl CpuWorkspace {
    /// Allocate buffers for up to `config.max_batch_size * config.beam_width`
    /// rows split into `config.launch.n_vocab_parts` parts.
    ///
    /// # Errors
    /// Returns an error if `config` fails validation.
    pub fn new(config: &BeamSearchConfig) -> Result<Self> {
        config.validate()?;
        let rows = config.max_batch_size * config.beam_width;
        let k2 = config.candidates_per_beam();
        Ok(Self {
            tiles: TileBuffer::new(rows, config.launch.n_vocab_parts, k2),
            candidate_ids: vec![INVALID_ID; rows * k2],
            candidate_values: vec![f32::NEG_INFINITY; rows * k2],
            beam_width: config.beam_width,
            rows: 0,
        })
    }

    #[must_use]
    pub fn tiles(&self) -> &TileBuffer {
        &self.tiles
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    /// Rows the last Stage 2 run produced candidates for.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Stage 2 token ids for `row`, best first.
    #[must_use]
    pub fn candidate_ids(&self, row: usize) -> &[u32] {
        let k2 = 2 * self.beam_width;
        &self.candidate_ids[row * k2..(row + 1) * k2]
    }

    /// Stage 2 total scores for `row`, best first.
    #[must_use]
    pub fn candidate_values(&self, row: usize) -> &[f32] {
        let k2 = 2 * self.beam_width;
        &self.candidate_values[row * k2..(row + 1) * k2]
    }

    /// Check the workspace can hold a step of `rows` rows.
    ///
    /// # Errors
    /// Returns [`Error::WorkspaceTooSmall`] if the row count, beam width or
    /// part count exceeds what the buffers were sized for.
    pub fn check(&self, rows: usize, beam_width: usize, n_parts: usize) -> Result<()> {
        if beam_width != self.beam_width {
            return Err(Error::WorkspaceTooSmall(format!(
                "sized for beam width {}, got {beam_width}",
                self.beam_width
            )));
        }
        if n_parts != self.tiles.n_parts {
            return Err(Error::WorkspaceTooSmall(format!(
                "sized for {} vocab parts, got {n_parts}",
                self.tiles.n_parts
            )));
        }
        if rows > self.tiles.max_rows() {
            return Err(Error::WorkspaceTooSmall(format!(
                "sized for {} rows, got {rows}",
                self.tiles.max_rows()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamwise::LaunchConfig;

    fn config() -> BeamSearchConfig {
        let mut config = BeamSearchConfig::new(2, 3, 64, 16);
        config.launch = LaunchConfig::base(4);
        config
    }

    #[test]
    fn test_sizes() {
        let ws = CpuWorkspace::new(&config()).unwrap();
        assert_eq!(ws.tiles().tile_len(), 6);
        assert_eq!(ws.tiles().n_parts(), 4);
        assert_eq!(ws.tiles().max_rows(), 6);
        assert_eq!(ws.candidate_ids(5).len(), 6);
        let (ids, values, md) = ws.tiles().row(5);
        assert_eq!((ids.len(), values.len(), md.len()), (24, 24, 4));
    }

    #[test]
    fn test_fresh_tiles_are_empty() {
        let ws = CpuWorkspace::new(&config()).unwrap();
        let tile = ws.tiles().tile(1, 2);
        assert!(tile.ids.iter().all(|&id| id == INVALID_ID));
        assert_eq!(tile.md, Md::EMPTY);
    }

    #[test]
    fn test_check() {
        let ws = CpuWorkspace::new(&config()).unwrap();
        ws.check(6, 3, 4).unwrap();
        ws.check(3, 3, 4).unwrap();
        assert!(matches!(ws.check(7, 3, 4), Err(Error::WorkspaceTooSmall(_))));
        assert!(ws.check(6, 2, 4).is_err());
        assert!(ws.check(6, 3, 8).is_err());
    }
}
