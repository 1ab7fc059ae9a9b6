//! Result rollup across a node's immediate children.
//!
//! A parent's verdict is computed from the multiset of its children's
//! results once every child is `done`:
//!
//! - all `pass` ⇒ `pass`
//! - any `fail` ⇒ `fail`, unless a `setup` child failed ⇒ `incomplete`
//!   (the environment never came up, so the other failures say nothing)
//! - all `skip` ⇒ `skip`
//! - anything else (mixed pass/skip) ⇒ `pass`

use quern_core::{Node, NodeResult};

/// Name of the suite that prepares the test environment. A failure here
/// poisons sibling results.
pub const SETUP_NAME: &str = "setup";

/// Rolls up immediate-child results into the parent verdict.
#[must_use]
pub fn aggregate(children: &[Node]) -> NodeResult {
    let results: Vec<(&str, NodeResult)> = children
        .iter()
        .filter_map(|child| child.result.map(|r| (child.name.as_str(), r)))
        .collect();

    let any_fail = results.iter().any(|(_, r)| *r == NodeResult::Fail);
    if any_fail {
        let setup_failed = results
            .iter()
            .any(|(name, r)| *name == SETUP_NAME && *r == NodeResult::Fail);
        return if setup_failed {
            NodeResult::Incomplete
        } else {
            NodeResult::Fail
        };
    }

    if !results.is_empty() && results.iter().all(|(_, r)| *r == NodeResult::Skip) {
        return NodeResult::Skip;
    }

    NodeResult::Pass
}
