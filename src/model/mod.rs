mod blocks;
mod highres3dnet;

pub use blocks::{ChannelPadding, ResBlock3d, ResBlock3dConfig};

pub use highres3dnet::{HighRes3DNet, HighRes3DNetConfig, Predictions};
