//! Chain topology: which slots process one stream, and in what order.
//!
//! A topology is an ordered primary chain (head first, in data-flow order) plus
//! optional branch sub-chains hanging off a primary slot. It is validated once
//! when the instance opens and never changes afterwards.

use crate::error::{IspError, IspResult};
use crate::mask::{SlotId, SlotMask};
use serde::{Deserialize, Serialize};

/// What a branch is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchRole {
    /// Short-exposure path used while bracketing.
    ShortExposure,
    /// Any other secondary output.
    Auxiliary,
}

/// Declarative description of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSpec {
    /// Primary slot feeding this branch.
    pub parent: SlotId,
    /// Branch slots, head first.
    pub slots: Vec<SlotId>,
    /// Purpose.
    pub role: BranchRole,
}

/// Declarative description of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainSpec {
    /// Primary chain, head first.
    pub slots: Vec<SlotId>,
    /// Sub-chains.
    #[serde(default)]
    pub branches: Vec<BranchSpec>,
}

impl ChainSpec {
    /// Linear chain with no branches.
    pub fn linear(slots: impl IntoIterator<Item = SlotId>) -> Self {
        Self {
            slots: slots.into_iter().collect(),
            branches: Vec::new(),
        }
    }

    /// Builder: add a branch.
    pub fn with_branch(mut self, parent: SlotId, slots: impl IntoIterator<Item = SlotId>, role: BranchRole) -> Self {
        self.branches.push(BranchSpec {
            parent,
            slots: slots.into_iter().collect(),
            role,
        });
        self
    }
}

/// Ordered run of slots sharing one frame queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    slots: Vec<SlotId>,
    mask: SlotMask,
}

impl Chain {
    fn new(slots: Vec<SlotId>) -> Self {
        let mask = slots.iter().copied().collect();
        Self { slots, mask }
    }

    /// First slot in data-flow order; owns the chain's queue.
    pub fn head(&self) -> SlotId {
        self.slots[0]
    }

    /// Last slot in data-flow order.
    pub fn tail(&self) -> SlotId {
        self.slots[self.slots.len() - 1]
    }

    /// Slots head first.
    pub fn slots(&self) -> &[SlotId] {
        &self.slots
    }

    /// Slots in programming order: tail first, so consumers are armed before
    /// their producer.
    pub fn dispatch_order(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots.iter().rev().copied()
    }

    /// Members as a set.
    pub fn mask(&self) -> SlotMask {
        self.mask
    }

    /// Membership test.
    pub fn contains(&self, slot: SlotId) -> bool {
        self.mask.contains(slot)
    }
}

/// A branch attached to the primary chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Primary slot feeding the branch.
    pub parent: SlotId,
    /// Purpose.
    pub role: BranchRole,
    /// Branch slots.
    pub chain: Chain,
}

/// Which chain of a topology a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRef {
    /// The primary chain.
    Primary,
    /// Branch by index.
    Branch(usize),
}

/// Validated topology of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTopology {
    primary: Chain,
    branches: Vec<Branch>,
    hw_mask: SlotMask,
}

impl ChainTopology {
    /// Validate `spec` against the set of registered slots.
    pub fn build(spec: &ChainSpec, registered: SlotMask) -> IspResult<Self> {
        if spec.slots.is_empty() {
            return Err(IspError::InvalidChain("primary chain is empty".into()));
        }
        let mut seen = SlotMask::empty();
        let mut claim = |slot: SlotId| -> IspResult<()> {
            if !registered.contains(slot) {
                return Err(IspError::SlotNotRegistered(slot));
            }
            if !seen.insert(slot) {
                return Err(IspError::InvalidChain(format!("slot {} appears twice", slot)));
            }
            Ok(())
        };

        for slot in &spec.slots {
            claim(*slot)?;
        }
        let primary = Chain::new(spec.slots.clone());

        let mut branches = Vec::with_capacity(spec.branches.len());
        for branch in &spec.branches {
            if branch.slots.is_empty() {
                return Err(IspError::InvalidChain(format!(
                    "branch under slot {} is empty",
                    branch.parent
                )));
            }
            if !primary.contains(branch.parent) {
                return Err(IspError::InvalidChain(format!(
                    "branch parent {} is not in the primary chain",
                    branch.parent
                )));
            }
            if branch.role == BranchRole::ShortExposure
                && branches.iter().any(|b: &Branch| b.role == BranchRole::ShortExposure)
            {
                return Err(IspError::InvalidChain("more than one short-exposure branch".into()));
            }
            for slot in &branch.slots {
                claim(*slot)?;
            }
            branches.push(Branch {
                parent: branch.parent,
                role: branch.role,
                chain: Chain::new(branch.slots.clone()),
            });
        }

        Ok(Self {
            primary,
            branches,
            hw_mask: seen,
        })
    }

    /// Primary chain.
    pub fn primary(&self) -> &Chain {
        &self.primary
    }

    /// Branches in declaration order.
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Every slot of the topology.
    pub fn hw_mask(&self) -> SlotMask {
        self.hw_mask
    }

    /// Chain by reference.
    pub fn chain(&self, which: ChainRef) -> Option<&Chain> {
        match which {
            ChainRef::Primary => Some(&self.primary),
            ChainRef::Branch(i) => self.branches.get(i).map(|b| &b.chain),
        }
    }

    /// Every chain, primary first.
    pub fn chains(&self) -> impl Iterator<Item = (ChainRef, &Chain)> {
        std::iter::once((ChainRef::Primary, &self.primary)).chain(
            self.branches
                .iter()
                .enumerate()
                .map(|(i, b)| (ChainRef::Branch(i), &b.chain)),
        )
    }

    /// Chain a slot belongs to.
    pub fn locate(&self, slot: SlotId) -> Option<ChainRef> {
        self.chains().find(|(_, c)| c.contains(slot)).map(|(r, _)| r)
    }

    /// Chain whose queue is owned by `head`.
    pub fn chain_headed_by(&self, head: SlotId) -> Option<(ChainRef, &Chain)> {
        self.chains().find(|(_, c)| c.head() == head)
    }

    /// The short-exposure branch, if present.
    pub fn short_exposure(&self) -> Option<(ChainRef, &Chain)> {
        self.branches
            .iter()
            .enumerate()
            .find(|(_, b)| b.role == BranchRole::ShortExposure)
            .map(|(i, b)| (ChainRef::Branch(i), &b.chain))
    }
}
