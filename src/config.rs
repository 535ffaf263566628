// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Runtime knobs that can vary across open/load of the same volume, as
//! opposed to `Geometry`, which is baked into the on-disk format.

/// How the controller should come up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// Discard any prior state; start chapters at 0.
    Create,
    /// Attempt to load saved state; fall back to rebuild on any error
    /// other than out-of-memory.
    #[default]
    Load,
    /// Load only; return an error on failure rather than rebuilding.
    NoRebuild,
}

/// Mutable/runtime configuration of an `Index`, as distinct from
/// `Geometry` (the on-disk shape, fixed for the life of the volume).
#[derive(Clone, Debug)]
pub struct IndexConfig {
    pub create_mode: CreateMode,
    /// When `true`, `save` is refused (the volume is mounted read-only).
    pub read_only: bool,
    /// Volume identity persisted in every save header; a load whose
    /// header carries a different nonce is `CORRUPT_DATA`.
    pub volume_nonce: u64,
}

impl IndexConfig {
    #[must_use]
    pub fn new(create_mode: CreateMode, volume_nonce: u64) -> Self {
        Self {
            create_mode,
            read_only: false,
            volume_nonce,
        }
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_create_mode_is_load() {
        assert_eq!(CreateMode::default(), CreateMode::Load);
    }

    #[test]
    fn read_only_builder_sets_flag() {
        let cfg = IndexConfig::new(CreateMode::Create, 7).read_only();
        assert!(cfg.read_only);
        assert_eq!(cfg.volume_nonce, 7);
    }
}
