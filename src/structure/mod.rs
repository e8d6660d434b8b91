pub mod detector;
pub mod segment;
pub mod signals;
pub mod zones;

pub use detector::StructureDetector;
pub use segment::PrimarySegment;
pub use signals::*;
pub use zones::{aggregate_zones, AggregateZone, RawZone, SrStructure};
