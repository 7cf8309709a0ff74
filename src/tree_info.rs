// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The tree-id registry: a runtime rendition of what a schema compiler
//! would otherwise fix at compile time, namely which grooves and trees
//! exist and how their ids are laid out.

use crate::error::{Error, Result};

/// What role a tree plays within its groove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// The groove's object tree.
    Objects,

    /// The groove's id→timestamp tree, if it has one.
    Ids,

    /// One of the groove's named secondary-index trees.
    Index(&'static str),
}

/// A compile-time-known descriptor for a single tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeInfo {
    /// Globally unique tree id, `tree_id ∈ [1, 2^16)`.
    pub tree_id: u16,

    /// The tree's name, e.g. `"accounts.objects"`.
    pub tree_name: &'static str,

    /// The name of the groove this tree belongs to.
    pub groove_name: &'static str,

    /// What role this tree plays within its groove.
    pub kind: TreeKind,
}

/// A dense, O(1)-lookup registry of every tree in the forest, indexed by
/// `tree_id - tree_id_min`.
pub struct TreeRegistry {
    infos: Vec<TreeInfo>,
    tree_id_min: u16,
    tree_id_max: u16,
}

impl TreeRegistry {
    /// Builds a registry from a caller-supplied set of tree descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if `infos` is empty, contains a
    /// duplicate `tree_id`, or the `tree_id`s are not contiguous (every
    /// integer in `[tree_id_min, tree_id_max]` must be assigned to exactly
    /// one tree).
    pub fn build(infos: Vec<TreeInfo>) -> Result<Self> {
        if infos.is_empty() {
            return Err(Error::InvariantViolation(
                "tree registry must contain at least one tree".to_owned(),
            ));
        }

        let tree_id_min = infos.iter().map(|t| t.tree_id).min().unwrap_or_default();
        let tree_id_max = infos.iter().map(|t| t.tree_id).max().unwrap_or_default();

        let span = usize::from(tree_id_max - tree_id_min) + 1;
        let mut dense: Vec<Option<TreeInfo>> = vec![None; span];

        for info in infos {
            let slot = usize::from(info.tree_id - tree_id_min);
            if dense[slot].is_some() {
                return Err(Error::InvariantViolation(format!(
                    "duplicate tree_id {}",
                    info.tree_id
                )));
            }
            dense[slot] = Some(info);
        }

        let infos = dense
            .into_iter()
            .enumerate()
            .map(|(slot, entry)| {
                entry.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "tree_id {} has no assigned tree (contiguity violated)",
                        tree_id_min as usize + slot
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            infos,
            tree_id_min,
            tree_id_max,
        })
    }

    /// Lowest assigned `tree_id`.
    #[must_use]
    pub fn tree_id_min(&self) -> u16 {
        self.tree_id_min
    }

    /// Highest assigned `tree_id`.
    #[must_use]
    pub fn tree_id_max(&self) -> u16 {
        self.tree_id_max
    }

    /// Number of trees in the registry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether the registry holds no trees. Always `false` for a
    /// successfully built registry; present for API completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// O(1) lookup of a tree's descriptor by id.
    ///
    /// Dispatching an unknown `tree_id` (e.g. during manifest replay) is a
    /// fatal invariant violation, not a recoverable error — callers
    /// resolving a `tree_id` from an external source are expected to treat
    /// `None` as a reason to abort.
    #[must_use]
    pub fn tree_for_id(&self, tree_id: u16) -> Option<&TreeInfo> {
        if tree_id < self.tree_id_min || tree_id > self.tree_id_max {
            return None;
        }
        let slot = usize::from(tree_id - self.tree_id_min);
        self.infos.get(slot)
    }

    /// Iterates all tree descriptors in ascending `tree_id` order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeInfo> {
        self.infos.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{TreeInfo, TreeKind, TreeRegistry};

    fn info(tree_id: u16, kind: TreeKind) -> TreeInfo {
        TreeInfo {
            tree_id,
            tree_name: "t",
            groove_name: "g",
            kind,
        }
    }

    #[test]
    fn contiguous_ids_build_successfully() {
        let registry = TreeRegistry::build(vec![
            info(5, TreeKind::Objects),
            info(6, TreeKind::Ids),
            info(7, TreeKind::Index("by_code")),
        ])
        .expect("contiguous ids should build");

        assert_eq!(registry.tree_id_min(), 5);
        assert_eq!(registry.tree_id_max(), 7);
        assert_eq!(registry.len(), 3);

        for id in 5..=7 {
            let found = registry.tree_for_id(id).expect("tree should exist");
            assert_eq!(found.tree_id, id);
        }

        assert!(registry.tree_for_id(4).is_none());
        assert!(registry.tree_for_id(8).is_none());
    }

    #[test]
    fn gap_in_ids_is_rejected() {
        let err = TreeRegistry::build(vec![info(5, TreeKind::Objects), info(7, TreeKind::Ids)])
            .expect_err("gap should be rejected");
        assert!(matches!(err, crate::Error::InvariantViolation(_)));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let err = TreeRegistry::build(vec![info(5, TreeKind::Objects), info(5, TreeKind::Ids)])
            .expect_err("duplicate should be rejected");
        assert!(matches!(err, crate::Error::InvariantViolation(_)));
    }

    #[test]
    fn empty_registry_is_rejected() {
        assert!(TreeRegistry::build(vec![]).is_err());
    }

    #[test]
    fn single_tree_registry() {
        let registry = TreeRegistry::build(vec![info(1, TreeKind::Objects)]).unwrap();
        assert_eq!(registry.tree_id_min(), 1);
        assert_eq!(registry.tree_id_max(), 1);
        assert_eq!(registry.iter().count(), 1);
    }
}
