//! # Galactic Region Lookup
//!
//! Run-length-encoded 2D raster over the galactic plane: 2048×2048 cells,
//! each row stored as `(run_length, region_id)` u16 pairs, with a 2049-entry
//! u32 row index giving each row's offset into the pair stream. The packed
//! resource ships in both byte orders; the host order picks the default
//! variant. The map is loaded once at startup and immutable afterwards;
//! every lookup before readiness (or outside the raster) answers the null
//! region rather than erroring.

use std::path::Path;
use std::sync::OnceLock;

use thiserror::Error;

use super::names::region_name;

pub const MAP_SIZE: usize = 2048;
pub const X0: f64 = -49985.0;
pub const Y0: f64 = -40985.0;
pub const Z0: f64 = -24105.0;
pub const MAP_SCALE: f64 = 83.0 / 4096.0;

const ROW_INDEX_BYTES: usize = (MAP_SIZE + 1) * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Byte order of the running host, used to pick the packed variant.
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

/// File name of the packed resource matching `endian`.
pub fn resource_name(endian: Endian) -> &'static str {
    match endian {
        Endian::Little => "RegionMapData.bin",
        Endian::Big => "RegionMapData_BE.bin",
    }
}

#[derive(Debug, Error)]
pub enum RegionMapError {
    #[error("region map resource truncated: {0} bytes")]
    Truncated(usize),
    #[error("region map length mismatch: row index expects {expected} pairs-words, body holds {actual}")]
    LengthMismatch { expected: u32, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct MapData {
    row_index: Vec<u32>,
    rle_data: Vec<u16>,
}

/// Result of a region lookup. Id 0 with no name means unknown / void.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionHit {
    pub id: u16,
    pub name: Option<&'static str>,
}

/// The process-wide spatial lookup. Constructed unloaded; `find` is total
/// and answers the null region until a load succeeds.
pub struct RegionMap {
    data: OnceLock<MapData>,
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionMap {
    pub fn new() -> Self {
        Self {
            data: OnceLock::new(),
        }
    }

    /// Builds a loaded map directly from its two arrays. Mostly a test seam,
    /// but also the target of both byte-order loaders.
    pub fn from_parts(row_index: Vec<u32>, rle_data: Vec<u16>) -> Result<Self, RegionMapError> {
        validate(&row_index, &rle_data)?;
        let map = Self::new();
        let _ = map.data.set(MapData {
            row_index,
            rle_data,
        });
        Ok(map)
    }

    /// Parses the packed resource: 2049 u32 row offsets followed by the RLE
    /// body as u16 `(run_length, region_id)` pairs. On any validation
    /// failure the map stays unloaded.
    pub fn load_bytes(&self, bytes: &[u8], endian: Endian) -> Result<(), RegionMapError> {
        if bytes.len() < ROW_INDEX_BYTES || (bytes.len() - ROW_INDEX_BYTES) % 2 != 0 {
            return Err(RegionMapError::Truncated(bytes.len()));
        }

        let row_index: Vec<u32> = bytes[..ROW_INDEX_BYTES]
            .chunks_exact(4)
            .map(|c| {
                let word = [c[0], c[1], c[2], c[3]];
                match endian {
                    Endian::Little => u32::from_le_bytes(word),
                    Endian::Big => u32::from_be_bytes(word),
                }
            })
            .collect();

        let rle_data: Vec<u16> = bytes[ROW_INDEX_BYTES..]
            .chunks_exact(2)
            .map(|c| {
                let word = [c[0], c[1]];
                match endian {
                    Endian::Little => u16::from_le_bytes(word),
                    Endian::Big => u16::from_be_bytes(word),
                }
            })
            .collect();

        validate(&row_index, &rle_data)?;
        let _ = self.data.set(MapData {
            row_index,
            rle_data,
        });
        Ok(())
    }

    /// Reads the packed resource from disk and loads it.
    pub async fn load_path(
        &self,
        path: impl AsRef<Path>,
        endian: Endian,
    ) -> Result<(), RegionMapError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        self.load_bytes(&bytes, endian)
    }

    pub fn is_ready(&self) -> bool {
        self.data.get().is_some()
    }

    /// Region for a galactic coordinate. The raster is 2D: only x and z
    /// participate, y is accepted for interface parity with the star
    /// position triple.
    pub fn find(&self, x: f64, _y: f64, z: f64) -> RegionHit {
        let Some(data) = self.data.get() else {
            return RegionHit::default();
        };

        let px = ((x - X0) * MAP_SCALE).floor();
        let pz = ((z - Z0) * MAP_SCALE).floor();
        if px < 0.0 || pz < 0.0 || px >= MAP_SIZE as f64 || pz >= MAP_SIZE as f64 {
            return RegionHit::default();
        }
        let px = px as usize;
        let pz = pz as usize;

        let start = data.row_index[pz] as usize;
        let end = data.row_index[pz + 1] as usize;

        let mut remaining = px;
        let mut i = start;
        while i + 1 < end {
            let run = data.rle_data[i] as usize;
            let id = data.rle_data[i + 1];
            if remaining < run {
                return RegionHit {
                    id,
                    name: region_name(id),
                };
            }
            remaining -= run;
            i += 2;
        }
        RegionHit::default()
    }
}

fn validate(row_index: &[u32], rle_data: &[u16]) -> Result<(), RegionMapError> {
    if row_index.len() != MAP_SIZE + 1 {
        return Err(RegionMapError::Truncated(row_index.len() * 4));
    }
    let expected = row_index[MAP_SIZE];
    if rle_data.len() != expected as usize {
        return Err(RegionMapError::LengthMismatch {
            expected,
            actual: rle_data.len(),
        });
    }
    // Offsets must be monotone pair boundaries inside the body.
    let mut prev = 0u32;
    for &offset in row_index {
        if offset < prev || offset % 2 != 0 || offset as usize > rle_data.len() {
            return Err(RegionMapError::LengthMismatch {
                expected,
                actual: rle_data.len(),
            });
        }
        prev = offset;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A map whose rows are all empty except the ones listed as
    /// `(row, pairs)`; pairs are `(run_length, region_id)`.
    fn synthetic_map(rows: &[(usize, Vec<(u16, u16)>)]) -> RegionMap {
        let mut row_index = vec![0u32; MAP_SIZE + 1];
        let mut rle_data = Vec::new();
        let mut cursor = 0u32;
        let mut next = 0usize;
        let mut sorted: Vec<_> = rows.to_vec();
        sorted.sort_by_key(|(row, _)| *row);

        for (row, pairs) in &sorted {
            while next <= *row {
                row_index[next] = cursor;
                next += 1;
            }
            for &(run, id) in pairs {
                rle_data.push(run);
                rle_data.push(id);
                cursor += 2;
            }
        }
        while next <= MAP_SIZE {
            row_index[next] = cursor;
            next += 1;
        }
        RegionMap::from_parts(row_index, rle_data).expect("valid synthetic map")
    }

    /// Centre of cell `(px, pz)` in galactic coordinates.
    fn cell_centre(px: usize, pz: usize) -> (f64, f64) {
        (
            X0 + (px as f64 + 0.5) / MAP_SCALE,
            Z0 + (pz as f64 + 0.5) / MAP_SCALE,
        )
    }

    #[test]
    fn unloaded_map_answers_null() {
        let map = RegionMap::new();
        assert!(!map.is_ready());
        assert_eq!(map.find(0.0, 0.0, 0.0), RegionHit::default());
    }

    #[test]
    fn sol_resolves_to_inner_orion_spur() {
        // Sol at (0,0,0) lands in cell (1012, 488).
        let map = synthetic_map(&[(488, vec![(1012, 0), (1, 18)])]);
        let hit = map.find(0.0, 0.0, 0.0);
        assert_eq!(hit.id, 18);
        assert_eq!(hit.name, Some("Inner Orion Spur"));
    }

    #[test]
    fn rle_rows_decode_cell_by_cell() {
        // Row 100: 3 cells of void, 4 of region 5, 2 of region 42.
        let map = synthetic_map(&[(100, vec![(3, 0), (4, 5), (2, 42)])]);
        let expected: [(u16, Option<&str>); 10] = [
            (0, None),
            (0, None),
            (0, None),
            (5, Some("Norma Arm")),
            (5, Some("Norma Arm")),
            (5, Some("Norma Arm")),
            (5, Some("Norma Arm")),
            (42, Some("The Void")),
            (42, Some("The Void")),
            (0, None), // past the encoded runs
        ];
        for (px, (id, name)) in expected.iter().enumerate() {
            let (x, z) = cell_centre(px, 100);
            let hit = map.find(x, -20.0, z);
            assert_eq!((hit.id, hit.name), (*id, *name), "cell {px}");
        }
    }

    #[test]
    fn out_of_bounds_is_null() {
        let map = synthetic_map(&[(0, vec![(MAP_SIZE as u16, 1)])]);
        assert_eq!(map.find(-100_000.0, 0.0, 0.0), RegionHit::default());
        assert_eq!(map.find(0.0, 0.0, 100_000.0), RegionHit::default());
    }

    #[test]
    fn byte_order_loaders_agree() {
        let source = synthetic_map(&[(7, vec![(10, 3), (5, 21)])]);
        let data = source.data.get().unwrap();

        let mut le = Vec::new();
        let mut be = Vec::new();
        for &w in &data.row_index {
            le.extend_from_slice(&w.to_le_bytes());
            be.extend_from_slice(&w.to_be_bytes());
        }
        for &w in &data.rle_data {
            le.extend_from_slice(&w.to_le_bytes());
            be.extend_from_slice(&w.to_be_bytes());
        }

        let (x, z) = cell_centre(12, 7);
        for (bytes, endian) in [(le, Endian::Little), (be, Endian::Big)] {
            let map = RegionMap::new();
            map.load_bytes(&bytes, endian).expect("load");
            assert!(map.is_ready());
            assert_eq!(map.find(x, 0.0, z).id, 21);
        }
    }

    #[tokio::test]
    async fn loads_the_packed_resource_from_disk() {
        let source = synthetic_map(&[(300, vec![(8, 12)])]);
        let data = source.data.get().unwrap();
        let mut bytes = Vec::new();
        for &w in &data.row_index {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        for &w in &data.rle_data {
            bytes.extend_from_slice(&w.to_le_bytes());
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(resource_name(Endian::Little));
        std::fs::write(&path, &bytes).expect("write resource");

        let map = RegionMap::new();
        map.load_path(&path, Endian::Little).await.expect("load");
        let (x, z) = cell_centre(3, 300);
        assert_eq!(map.find(x, 0.0, z).id, 12);
    }

    #[test]
    fn length_mismatch_keeps_map_unloaded() {
        let mut row_index = vec![0u32; MAP_SIZE + 1];
        row_index[MAP_SIZE] = 4; // body should hold 4 words
        let mut bytes = Vec::new();
        for &w in &row_index {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes.extend_from_slice(&1u16.to_le_bytes()); // only one word

        let map = RegionMap::new();
        let err = map.load_bytes(&bytes, Endian::Little);
        assert!(err.is_err());
        assert!(!map.is_ready());
    }
}
