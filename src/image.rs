//! Images
//!
//! Only what copy encoding needs: extents, pixel size and the backing
//! allocation.

use std::sync::Arc;

use crate::error::{DriverError, Result};
use crate::memory::{AllocationType, GraphicsAllocation, MemoryManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bytes_per_pixel: u32,
}

/// A region of an image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageRegion {
    pub origin_x: u32,
    pub origin_y: u32,
    pub origin_z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl ImageRegion {
    pub fn full(desc: &ImageDesc) -> Self {
        Self {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
            ..Default::default()
        }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }
}

#[derive(Debug)]
pub struct Image {
    desc: ImageDesc,
    allocation: Arc<GraphicsAllocation>,
}

impl Image {
    pub fn create(memory: &MemoryManager, desc: ImageDesc, image_supported: bool) -> Result<Self> {
        if !image_supported {
            return Err(DriverError::UnsupportedFeature("images are not supported on this device".to_string()));
        }
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.bytes_per_pixel == 0 {
            return Err(DriverError::InvalidSize(format!("invalid image extent {:?}", desc)));
        }
        let size = desc.width as usize * desc.height as usize * desc.depth as usize * desc.bytes_per_pixel as usize;
        let allocation = memory.allocate(size, AllocationType::Image)?;
        Ok(Self { desc, allocation })
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn row_pitch(&self) -> u64 {
        self.desc.width as u64 * self.desc.bytes_per_pixel as u64
    }

    pub fn slice_pitch(&self) -> u64 {
        self.row_pitch() * self.desc.height as u64
    }

    /// Reject regions that fall outside the image.
    pub fn check_region(&self, region: &ImageRegion) -> Result<()> {
        let fits = |origin: u32, extent: u32, limit: u32| {
            extent > 0 && (origin as u64 + extent as u64) <= limit as u64
        };
        if fits(region.origin_x, region.width, self.desc.width)
            && fits(region.origin_y, region.height, self.desc.height)
            && fits(region.origin_z, region.depth, self.desc.depth)
        {
            Ok(())
        } else {
            Err(DriverError::InvalidArgument(format!("region {:?} exceeds image", region)))
        }
    }
}
