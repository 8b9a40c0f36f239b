use crate::{Generation, HandleError};

/// Upper bound on collector heaps (and therefore tables per bucket).
pub const MAX_HEAPS: usize = 256;

/// Oldest generation the age map can represent. Ages are packed four to a
/// word when testing a block, so they must stay below the byte's high bit.
pub const MAX_GENERATION: Generation = 0x3f;

#[derive(Debug, Default, Clone)]
pub struct MapCreateInfo {
    /// Number of collector heaps; every bucket holds one table per heap.
    pub heap_count: Option<usize>,
    /// Oldest generation the collector uses.
    pub max_generation: Option<Generation>,
}

#[derive(Debug, Clone)]
pub struct MapSettings {
    pub heap_count: usize,
    pub max_generation: Generation,
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            heap_count: 1,
            max_generation: 2,
        }
    }
}

impl MapSettings {
    pub fn from_info(info: &MapCreateInfo) -> Result<Self, HandleError> {
        let mut settings = Self::default();
        info.heap_count.inspect(|&val| settings.heap_count = val);
        info.max_generation
            .inspect(|&val| settings.max_generation = val);
        settings
            .validate()
            .map_err(HandleError::InvalidSettings)?;
        Ok(settings)
    }

    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_count == 0 {
            return Err("heap_count must be > 0");
        }
        if self.heap_count > MAX_HEAPS {
            return Err("heap_count exceeds MAX_HEAPS");
        }
        if self.max_generation > MAX_GENERATION {
            return Err("max_generation exceeds MAX_GENERATION");
        }
        Ok(())
    }
}
