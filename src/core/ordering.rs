//! Assignment of variables to column blocks of the linear system.

use std::collections::HashMap;

use crate::core::{
    CoreError, CoreResult,
    factor_graph::FactorGraph,
    key::Key,
    values::Values,
};

/// Maps every optimized key to a contiguous block of columns.
///
/// Blocks are laid out in the order the keys were given, without gaps. The ordering is
/// fixed for the lifetime of an optimizer because the symbolic structure depends on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ordering {
    keys: Vec<Key>,
    blocks: HashMap<Key, (usize, usize)>,
    total_dim: usize,
}

impl Ordering {
    /// Sorted order over every key the graph references, sized from `values`.
    pub fn natural(graph: &FactorGraph, values: &Values) -> CoreResult<Self> {
        Self::from_keys(&graph.keys(), values)
    }

    /// Custom order. Keys must be distinct and present in `values`.
    pub fn from_keys(keys: &[Key], values: &Values) -> CoreResult<Self> {
        let mut blocks = HashMap::with_capacity(keys.len());
        let mut offset = 0;

        for &key in keys {
            let dim = values.at(key)?.dim();
            if blocks.insert(key, (offset, dim)).is_some() {
                return Err(CoreError::DuplicateKey { key });
            }
            offset += dim;
        }

        Ok(Ordering {
            keys: keys.to_vec(),
            blocks,
            total_dim: offset,
        })
    }

    /// First column of `key`'s block.
    pub fn offset(&self, key: Key) -> Option<usize> {
        self.blocks.get(&key).map(|&(offset, _)| offset)
    }

    pub fn dim(&self, key: Key) -> Option<usize> {
        self.blocks.get(&key).map(|&(_, dim)| dim)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.blocks.contains_key(&key)
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// `(key, offset, dim)` in column order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, usize, usize)> + '_ {
        self.keys.iter().filter_map(|key| {
            self.blocks
                .get(key)
                .map(|&(offset, dim)| (*key, offset, dim))
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of columns of the linear system.
    pub fn total_dim(&self) -> usize {
        self.total_dim
    }
}
