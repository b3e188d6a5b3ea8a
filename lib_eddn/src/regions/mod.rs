pub mod names;
pub mod region_map;

pub use region_map::{RegionHit, RegionMap};
