/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An authenticated, persistent, content-addressed radix trie over the chain state.
//!
//! ## Structure
//!
//! Every state key is placed on a path given by the 64 nibbles of the SHA256 digest of the key. The
//! trie has two kinds of [nodes](TrieNode):
//! - A **leaf** stores one key-value pair.
//! - A **branch** has up to 16 children, one per nibble value.
//!
//! A subtree that holds exactly one key is always a leaf, and a subtree that holds two or more keys is
//! always a branch. The shape of the trie, and therefore the hash of its root, is thus a function of
//! the set of key-value pairs only, and not of the order in which they were inserted or deleted.
//!
//! ## Persistence
//!
//! Nodes are stored under their hash and never modified. An update creates new nodes along the paths
//! it touches and shares every other node with the previous version, so the roots of old versions stay
//! readable for as long as their nodes are kept. Every node carries a reference count: the number of
//! branches that point to it, plus the number of blocks whose trie root it is. Releasing a root
//! decrements counts top-down and deletes the nodes whose counts drop to zero.

use std::collections::{BTreeMap, HashMap};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{data_types::CryptoHash, update_sets::StateMutations};

use super::kv_store::{KVGet, KVGetError};

/// Root of the trie that holds no keys.
pub const EMPTY_TRIE_ROOT: CryptoHash = CryptoHash::new([0u8; 32]);

const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum TrieNode {
    Leaf { key: Vec<u8>, value: Vec<u8> },
    Branch { children: [Option<CryptoHash>; 16] },
}

impl TrieNode {
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::of(&[&self.try_to_vec().unwrap()])
    }

    fn children(&self) -> impl Iterator<Item = CryptoHash> + '_ {
        let children: &[Option<CryptoHash>] = match self {
            TrieNode::Leaf { .. } => &[],
            TrieNode::Branch { children } => children,
        };
        children.iter().flatten().copied()
    }
}

fn key_path(key: &[u8]) -> [u8; 32] {
    CryptoHash::of(&[key]).bytes()
}

fn nibble(path: &[u8; 32], depth: usize) -> usize {
    let byte = path[depth / 2];
    if depth % 2 == 0 {
        (byte >> 4) as usize
    } else {
        (byte & 0x0f) as usize
    }
}

fn root_option(root: &CryptoHash) -> Option<CryptoHash> {
    if *root == EMPTY_TRIE_ROOT {
        None
    } else {
        Some(*root)
    }
}

/// Read the value of `key` in the trie rooted at `root`.
pub fn get<G: KVGet>(kv: &G, root: &CryptoHash, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
    let path = key_path(key);
    let mut cursor = root_option(root);
    let mut depth = 0;
    while let Some(hash) = cursor {
        match kv.trie_node(&hash)?.ok_or(TrieError::NodeMissing(hash))? {
            TrieNode::Leaf { key: leaf_key, value } => {
                return Ok(if leaf_key == key { Some(value) } else { None })
            }
            TrieNode::Branch { children } => {
                if depth >= MAX_DEPTH {
                    return Err(TrieError::PathCollision);
                }
                cursor = children[nibble(&path, depth)];
                depth += 1;
            }
        }
    }
    Ok(None)
}

/// An in-memory update on top of a persisted trie. Nodes created by the update are staged until
/// [`into_writes`](TrieUpdate::into_writes) collects the ones reachable from the final root.
pub(crate) struct TrieUpdate<'a, G: KVGet> {
    kv: &'a G,
    staged: HashMap<CryptoHash, TrieNode>,
    root: Option<CryptoHash>,
}

impl<'a, G: KVGet> TrieUpdate<'a, G> {
    pub(crate) fn new(kv: &'a G, root: &CryptoHash) -> Self {
        Self {
            kv,
            staged: HashMap::new(),
            root: root_option(root),
        }
    }

    pub(crate) fn root(&self) -> CryptoHash {
        self.root.unwrap_or(EMPTY_TRIE_ROOT)
    }

    pub(crate) fn apply(&mut self, mutations: &StateMutations) -> Result<(), TrieError> {
        for (key, value) in mutations.inserts() {
            let path = key_path(key);
            self.root = Some(self.insert(self.root, key, &path, value, 0)?);
        }
        for key in mutations.deletes() {
            let path = key_path(key);
            self.root = self.remove(self.root, key, &path, 0)?;
        }
        Ok(())
    }

    fn load(&self, hash: &CryptoHash) -> Result<TrieNode, TrieError> {
        if let Some(node) = self.staged.get(hash) {
            return Ok(node.clone());
        }
        self.kv.trie_node(hash)?.ok_or(TrieError::NodeMissing(*hash))
    }

    fn stage(&mut self, node: TrieNode) -> CryptoHash {
        let hash = node.hash();
        self.staged.insert(hash, node);
        hash
    }

    fn insert(
        &mut self,
        node: Option<CryptoHash>,
        key: &[u8],
        path: &[u8; 32],
        value: &[u8],
        depth: usize,
    ) -> Result<CryptoHash, TrieError> {
        let node = match node {
            None => {
                return Ok(self.stage(TrieNode::Leaf { key: key.to_vec(), value: value.to_vec() }))
            }
            Some(hash) => (hash, self.load(&hash)?),
        };
        if depth >= MAX_DEPTH {
            return Err(TrieError::PathCollision);
        }

        match node {
            (_, TrieNode::Leaf { key: leaf_key, .. }) if leaf_key == key => {
                Ok(self.stage(TrieNode::Leaf { key: key.to_vec(), value: value.to_vec() }))
            }
            (leaf_hash, TrieNode::Leaf { key: leaf_key, .. }) => {
                // Push the existing leaf one level down, then insert the new key beside it.
                let mut children = [None; 16];
                children[nibble(&key_path(&leaf_key), depth)] = Some(leaf_hash);
                let child = nibble(path, depth);
                children[child] = Some(self.insert(children[child], key, path, value, depth + 1)?);
                Ok(self.stage(TrieNode::Branch { children }))
            }
            (_, TrieNode::Branch { mut children }) => {
                let child = nibble(path, depth);
                children[child] = Some(self.insert(children[child], key, path, value, depth + 1)?);
                Ok(self.stage(TrieNode::Branch { children }))
            }
        }
    }

    fn remove(
        &mut self,
        node: Option<CryptoHash>,
        key: &[u8],
        path: &[u8; 32],
        depth: usize,
    ) -> Result<Option<CryptoHash>, TrieError> {
        let hash = match node {
            None => return Ok(None),
            Some(hash) => hash,
        };
        match self.load(&hash)? {
            TrieNode::Leaf { key: leaf_key, .. } => {
                Ok(if leaf_key == key { None } else { Some(hash) })
            }
            TrieNode::Branch { mut children } => {
                if depth >= MAX_DEPTH {
                    return Err(TrieError::PathCollision);
                }
                let child = nibble(path, depth);
                let new_child = self.remove(children[child], key, path, depth + 1)?;
                if new_child == children[child] {
                    return Ok(Some(hash));
                }
                children[child] = new_child;

                // A branch left with a single leaf collapses into that leaf.
                let remaining: Vec<CryptoHash> = children.iter().flatten().copied().collect();
                match remaining.as_slice() {
                    [] => Ok(None),
                    [only] => match self.load(only)? {
                        TrieNode::Leaf { .. } => Ok(Some(*only)),
                        TrieNode::Branch { .. } => Ok(Some(self.stage(TrieNode::Branch { children }))),
                    },
                    _ => Ok(Some(self.stage(TrieNode::Branch { children }))),
                }
            }
        }
    }

    /// Collect the staged nodes reachable from the final root that are not persisted yet, and the
    /// reference count increments that persisting them (and one more reference to the root) entails.
    pub(crate) fn into_writes(self) -> Result<TrieWrites, TrieError> {
        let mut writes = TrieWrites {
            root: self.root(),
            new_nodes: BTreeMap::new(),
            refcount_increments: BTreeMap::new(),
        };
        if let Some(root) = self.root {
            *writes.refcount_increments.entry(root).or_insert(0) += 1;
            self.collect(root, &mut writes)?;
        }
        Ok(writes)
    }

    fn collect(&self, hash: CryptoHash, writes: &mut TrieWrites) -> Result<(), TrieError> {
        if writes.new_nodes.contains_key(&hash) || self.kv.trie_node(&hash)?.is_some() {
            return Ok(());
        }
        let node = self.staged.get(&hash).ok_or(TrieError::NodeMissing(hash))?.clone();
        let children: Vec<CryptoHash> = node.children().collect();
        writes.new_nodes.insert(hash, node);
        for child in children {
            *writes.refcount_increments.entry(child).or_insert(0) += 1;
            self.collect(child, writes)?;
        }
        Ok(())
    }
}

/// Writes that persist one version of the trie.
pub(crate) struct TrieWrites {
    pub(crate) root: CryptoHash,
    pub(crate) new_nodes: BTreeMap<CryptoHash, TrieNode>,
    pub(crate) refcount_increments: BTreeMap<CryptoHash, u32>,
}

/// Writes that release one reference to a trie root.
pub(crate) struct TrieReleases {
    pub(crate) deleted_nodes: Vec<CryptoHash>,
    pub(crate) refcounts: BTreeMap<CryptoHash, u32>,
}

/// Compute the writes that release one reference to `root`, deleting every node that is no longer
/// referenced afterwards.
pub(crate) fn release<G: KVGet>(kv: &G, root: &CryptoHash) -> Result<TrieReleases, TrieError> {
    let mut releases = TrieReleases {
        deleted_nodes: Vec::new(),
        refcounts: BTreeMap::new(),
    };
    let mut stack: Vec<CryptoHash> = root_option(root).into_iter().collect();
    while let Some(hash) = stack.pop() {
        let refcount = match releases.refcounts.get(&hash) {
            Some(refcount) => *refcount,
            None => kv.trie_refcount(&hash)?,
        };
        if refcount == 0 {
            return Err(TrieError::RefcountUnderflow(hash));
        }
        releases.refcounts.insert(hash, refcount - 1);
        if refcount == 1 {
            let node = kv.trie_node(&hash)?.ok_or(TrieError::NodeMissing(hash))?;
            stack.extend(node.children());
            releases.deleted_nodes.push(hash);
        }
    }
    Ok(releases)
}

#[derive(Debug)]
pub enum TrieError {
    NodeMissing(CryptoHash),
    RefcountUnderflow(CryptoHash),
    /// Two distinct keys hash to the same path.
    PathCollision,
    KVGetError(KVGetError),
}

impl From<KVGetError> for TrieError {
    fn from(value: KVGetError) -> Self {
        TrieError::KVGetError(value)
    }
}
