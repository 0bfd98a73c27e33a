//! Oral-messages agreement over the replicated counter.
//!
//! Each member grows an information-gathering tree of depth `f + 1` out of
//! the OM messages it receives; a node's position is the sender `list`
//! prefix carried by the message, newest sender first. Once the tree holds
//! every expected report the member reconciles level by level and sends the
//! leader its verdict.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// Insertion-ordered vote counter; ties break toward the value seen first.
#[derive(Debug, Default, Clone)]
pub struct Tally {
    counts: Vec<(u64, usize)>,
}

impl Tally {
    pub fn add(&mut self, value: u64) {
        match self.counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((value, 1)),
        }
    }

    pub fn plurality(&self) -> Option<u64> {
        let mut best: Option<(u64, usize)> = None;
        for &(value, count) in &self.counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((value, count));
            }
        }
        best.map(|(value, _)| value)
    }
}

#[derive(Debug)]
struct OmNode {
    list: Vec<Uuid>,
    value: u64,
    children: Vec<OmNode>,
}

/// The exponential message tree of one OM(f) round at one member.
#[derive(Debug)]
pub struct OmTree {
    height: usize,
    expected: usize,
    root: Option<OmNode>,
    len: usize,
}

impl OmTree {
    /// `n` is the group size at round start; depth is `f + 1` with
    /// `f = ⌊(n − 1) / 3⌋`, and the expected node count is
    /// `1 + Σ_{i=1..f} Π_{j=1..i}(n − 1 − j)`.
    pub fn new(n: usize) -> Self {
        let height = (n.saturating_sub(1)) / 3 + 1;
        let mut expected = 1;
        let mut level = 1;
        for i in 1..height {
            level *= n - 1 - i;
            expected += level;
        }
        Self {
            height,
            expected,
            root: None,
            len: 0,
        }
    }

    /// Add one report. `list` is newest-sender-first; the root is the
    /// leader's opening message, and every other report hangs off the node
    /// matching its list tail.
    pub fn push(&mut self, list: Vec<Uuid>, value: u64) {
        self.len += 1;
        let Some(root) = self.root.as_mut() else {
            self.root = Some(OmNode {
                list,
                value,
                children: Vec::new(),
            });
            return;
        };
        let mut current = root;
        for index in (0..list.len().saturating_sub(1)).rev() {
            let node = current;
            let position = node
                .children
                .iter()
                .position(|child| child.list.first() == Some(&list[index]));
            current = match position {
                Some(position) => &mut node.children[position],
                None => node,
            };
        }
        current.children.push(OmNode {
            list,
            value,
            children: Vec::new(),
        });
    }

    pub fn is_full(&self) -> bool {
        self.len == self.expected
    }

    /// Reconcile: take the plurality at each level from the leaves upward,
    /// then the plurality of those per-level verdicts.
    pub fn decide(&self) -> Option<u64> {
        let root = self.root.as_ref()?;
        let mut overall = Tally::default();
        for level in (0..self.height).rev() {
            overall.add(level_plurality(root, level));
        }
        overall.plurality()
    }
}

fn level_plurality(node: &OmNode, level: usize) -> u64 {
    if level == 0 {
        return node.value;
    }
    let mut tally = Tally::default();
    tally.add(node.value);
    for child in &node.children {
        tally.add(level_plurality(child, level - 1));
    }
    tally.plurality().expect("tally never empty")
}

/// The leader's view of a round it initiated.
#[derive(Debug)]
pub struct LeaderRound {
    pub id: Uuid,
    pub responders: HashSet<Uuid>,
    pub tally: Tally,
}

impl LeaderRound {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            responders: HashSet::new(),
            tally: Tally::default(),
        }
    }
}

/// A member's view of the round it is currently gathering.
#[derive(Debug)]
pub struct MemberRound {
    pub id: Uuid,
    pub tree: OmTree,
}

impl MemberRound {
    pub fn new(id: Uuid, n: usize) -> Self {
        Self {
            id,
            tree: OmTree::new(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Started,
    Finished,
    Aborted,
}

pub type RoundHistory = HashMap<Uuid, RoundStatus>;
