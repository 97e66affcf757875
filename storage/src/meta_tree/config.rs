// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Configuration of a [`MetaTree`](super::MetaTree) instance and the geometry
//! of the trees it operates on.

use super::MetaTreeError;
use super::layout::{LEAF_LEVEL, TREE_MAX_DEGREE, TREE_MAX_LEVEL};

/// Default number of concurrently processed requests.
pub const NR_OF_CHANNELS: usize = 4;

/// [`MetaTree`](super::MetaTree) instance configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaTreeConfig {
    channels: usize,
}

impl MetaTreeConfig {
    /// Create a new `MetaTreeConfig`.
    ///
    /// # Arguments:
    ///
    /// * `channels` - Maximum number of requests in flight at a time, must be
    ///   non-zero.
    pub fn new(channels: usize) -> Result<Self, MetaTreeError> {
        if channels == 0 {
            return Err(MetaTreeError::InvalidConfig);
        }
        Ok(Self { channels })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl Default for MetaTreeConfig {
    fn default() -> Self {
        Self {
            channels: NR_OF_CHANNELS,
        }
    }
}

/// Shape of a meta tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeGeometry {
    max_level: u32,
    edges: u32,
    leaves: u64,
}

impl TreeGeometry {
    /// Create a new `TreeGeometry`.
    ///
    /// # Arguments:
    ///
    /// * `max_level` - Level of the root node, `1` for a tree consisting of a
    ///   single leaf node. At most [`TREE_MAX_LEVEL`].
    /// * `edges` - Number of records in use per node, at most
    ///   [`TREE_MAX_DEGREE`].
    /// * `leaves` - Number of leaf entries, i.e. blocks managed by the tree.
    pub fn new(max_level: u32, edges: u32, leaves: u64) -> Result<Self, MetaTreeError> {
        if !(LEAF_LEVEL..=TREE_MAX_LEVEL).contains(&max_level) {
            return Err(MetaTreeError::InvalidGeometry);
        }
        if edges == 0 || edges as usize > TREE_MAX_DEGREE {
            return Err(MetaTreeError::InvalidGeometry);
        }
        // At most 64^6 = 2^36, no overflow.
        if leaves > u64::from(edges).pow(max_level) {
            return Err(MetaTreeError::InvalidGeometry);
        }
        Ok(Self {
            max_level,
            edges,
            leaves,
        })
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn edges(&self) -> u32 {
        self.edges
    }

    pub fn leaves(&self) -> u64 {
        self.leaves
    }
}

#[test]
fn test_meta_tree_config() {
    assert_eq!(MetaTreeConfig::default().channels(), NR_OF_CHANNELS);
    assert_eq!(MetaTreeConfig::new(1).unwrap().channels(), 1);
    assert_eq!(MetaTreeConfig::new(0), Err(MetaTreeError::InvalidConfig));
}

#[test]
fn test_tree_geometry() {
    let geometry = TreeGeometry::new(2, 4, 16).unwrap();
    assert_eq!(geometry.max_level(), 2);
    assert_eq!(geometry.edges(), 4);
    assert_eq!(geometry.leaves(), 16);

    assert!(TreeGeometry::new(1, TREE_MAX_DEGREE as u32, 0).is_ok());
    assert!(TreeGeometry::new(TREE_MAX_LEVEL, TREE_MAX_DEGREE as u32, 1u64 << 36).is_ok());
    assert_eq!(
        TreeGeometry::new(TREE_MAX_LEVEL, TREE_MAX_DEGREE as u32, (1u64 << 36) + 1),
        Err(MetaTreeError::InvalidGeometry)
    );
    assert_eq!(
        TreeGeometry::new(TREE_MAX_LEVEL, TREE_MAX_DEGREE as u32, u64::MAX),
        Err(MetaTreeError::InvalidGeometry)
    );
    assert_eq!(TreeGeometry::new(0, 4, 0), Err(MetaTreeError::InvalidGeometry));
    assert_eq!(TreeGeometry::new(TREE_MAX_LEVEL + 1, 4, 0), Err(MetaTreeError::InvalidGeometry));
    assert_eq!(TreeGeometry::new(2, 0, 0), Err(MetaTreeError::InvalidGeometry));
    assert_eq!(
        TreeGeometry::new(2, TREE_MAX_DEGREE as u32 + 1, 0),
        Err(MetaTreeError::InvalidGeometry)
    );
    assert_eq!(TreeGeometry::new(2, 4, 17), Err(MetaTreeError::InvalidGeometry));
}
