mod volume;

pub use volume::{VolumeBatch, VolumeBatcher, VolumeItem};
