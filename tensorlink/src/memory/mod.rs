pub mod region;
pub mod registry;

pub use region::{AccessKey, BufferSet, MemoryRegion, REGION_DESCRIPTOR_SIZE};
pub use registry::{RegionRegistry, Registration};
