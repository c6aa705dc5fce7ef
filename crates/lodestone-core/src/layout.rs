//! Local repository path resolution
//!
//! The on-disk layout of the local repository is injected: callers hand
//! the session a [`LocalLayout`] and every connector resolves local
//! paths through it. [`HierarchicalLayout`] mirrors the remote
//! repository path convention and is the default.

use std::path::PathBuf;

use crate::coordinate::{Coordinate, MetadataRef};

/// Maps coordinates to paths relative to the local repository root.
pub trait LocalLayout: Send + Sync {
    fn artifact_path(&self, coordinate: &Coordinate) -> PathBuf;

    fn metadata_path(&self, metadata: &MetadataRef) -> PathBuf;
}

/// group/name/version directory tree, same shape as the remote side.
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalLayout;

impl LocalLayout for HierarchicalLayout {
    fn artifact_path(&self, coordinate: &Coordinate) -> PathBuf {
        PathBuf::from(coordinate.repository_path())
    }

    fn metadata_path(&self, metadata: &MetadataRef) -> PathBuf {
        PathBuf::from(metadata.repository_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchical_layout() {
        let layout = HierarchicalLayout;
        let coordinate = Coordinate::new("com.acme", "lib", "1.0").unwrap();
        assert_eq!(
            layout.artifact_path(&coordinate),
            PathBuf::from("com/acme/lib/1.0/lib-1.0.tgz")
        );

        let metadata = MetadataRef::for_name("com.acme", "lib", "versions.xml");
        assert_eq!(
            layout.metadata_path(&metadata),
            PathBuf::from("com/acme/lib/versions.xml")
        );
    }
}
