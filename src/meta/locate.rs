//! The subobject locator: given a type and a byte offset inside it, find the
//! subobject (member, array element, union arm) spanning that offset, and
//! drive that one step repeatedly to descend, walk, or search.
//!
//! Three operations build on one another:
//!
//! - [`first_subobject_spanning`]: one step down. Arrays divide; composites
//!   bisect the offset-sorted member list, then scan backward so that of all
//!   members sharing the winning offset (union arms) the *lowest-declared*
//!   one is chosen. That tie rule is deliberate and load-bearing: downstream
//!   consumers depend on lowest-wins determinism, even when two arms share
//!   offset and type identity.
//! - [`walk_subobjects_spanning`]: repeated descent that additionally visits
//!   every same-offset sibling at each level, recursing into each before
//!   moving on. The visitor can stop the walk with `ControlFlow::Break`.
//! - [`find_matching_subobject`]: depth-first search for a subobject of a
//!   specific type at exactly the target offset, trying same-offset union
//!   siblings in declaration order only after the earlier arm's whole
//!   subtree has failed.
//!
//! On top of those, [`locate_subobject_at_offset`] produces the residual path
//! a client usually wants, and [`check_subobject_type`] splits "nothing
//! there" from "something there, wrong type".

use std::ops::ControlFlow;

use crate::error::{Error, Result};
use crate::meta::{TypeId, TypeKind, TypeTable};

/// The outcome of one locator step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubobjectHit {
    /// The type we descended out of.
    pub container: TypeId,
    /// Index of the chosen entry: the member index for composites, the
    /// element index for arrays.
    pub entry_index: usize,
    /// The contained type chosen.
    pub child: TypeId,
    /// Byte offset of the chosen subobject within `container`.
    pub child_offset: usize,
    /// Offset still to resolve, now relative to `child`.
    pub residual: usize,
}

/// Find the first (lowest-declared) immediate subobject of `container`
/// spanning `target_offset`. `None` when the container has no contained
/// objects, when the offset is out of range, or when it falls before the
/// first member.
pub fn first_subobject_spanning(
    table: &TypeTable,
    container: TypeId,
    target_offset: usize,
) -> Option<SubobjectHit> {
    let d = table.get(container);
    match d.kind() {
        TypeKind::Array { len } => {
            let elem = d.related()[0].ty;
            let elem_size = table.max_offset(elem);
            if elem_size == 0 {
                return None;
            }
            let div = target_offset / elem_size;
            if div >= len {
                return None;
            }
            Some(SubobjectHit {
                container,
                entry_index: div,
                child: elem,
                child_offset: div * elem_size,
                residual: target_offset % elem_size,
            })
        }
        TypeKind::Struct | TypeKind::Union => {
            if target_offset >= d.max_offset() {
                return None;
            }
            let related = d.related();
            let n = related.len();
            let mut lower = 0usize;
            let mut upper = n;
            // Bisect for the greatest index whose offset <= target.
            while lower + 1 < upper {
                let mid = (lower + upper) / 2;
                if related[mid].offset > target_offset {
                    upper = mid;
                } else {
                    lower = mid;
                }
            }
            if lower + 1 != upper {
                // Only possible when there are no members at all.
                debug_assert_eq!(n, 0);
                return None;
            }
            if related[lower].offset > target_offset {
                // Offset falls before the first member (e.g. a frame layout
                // that does not use offset zero).
                return None;
            }
            // We may have landed mid-run of a union's equal offsets; scan
            // backward to the lowest index sharing the offset.
            let offset = related[lower].offset;
            while lower > 0 && related[lower - 1].offset == offset {
                lower -= 1;
            }
            Some(SubobjectHit {
                container,
                entry_index: lower,
                child: related[lower].ty,
                child_offset: offset,
                residual: target_offset - offset,
            })
        }
        _ => None,
    }
}

/// One visited level of [`walk_subobjects_spanning`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanStep {
    /// The subobject being visited.
    pub ty: TypeId,
    /// Its span start, as an absolute offset from the walk's root.
    pub span_start: usize,
    /// Depth below the root (the root itself is not visited).
    pub depth: u32,
    /// The immediately containing type.
    pub container: TypeId,
    /// Chosen entry within the container (member index / element index).
    pub entry_index: usize,
    /// The container's own span start, absolute from the root.
    pub container_span_start: usize,
}

/// Walk down from `root` through every subobject spanning `target_offset`,
/// visiting same-offset union siblings along the way. The walk descends
/// single-mindedly through arrays and unambiguous members, and fans out only
/// across members sharing an offset. `Break` from the visitor halts the whole
/// walk and is returned.
pub fn walk_subobjects_spanning<B, F>(
    table: &TypeTable,
    root: TypeId,
    target_offset: usize,
    visit: &mut F,
) -> Option<B>
where
    F: FnMut(&SpanStep) -> ControlFlow<B>,
{
    walk_rec(table, 0, 0, target_offset, root, visit)
}

fn walk_rec<B, F>(
    table: &TypeTable,
    accum_offset: usize,
    accum_depth: u32,
    target_offset: usize,
    u: TypeId,
    visit: &mut F,
) -> Option<B>
where
    F: FnMut(&SpanStep) -> ControlFlow<B>,
{
    let d = table.get(u);
    match d.kind() {
        TypeKind::Array { len } => {
            let elem = d.related()[0].ty;
            let elem_size = table.max_offset(elem);
            if elem_size == 0 || target_offset / elem_size >= len {
                return None;
            }
            let div = target_offset / elem_size;
            let skip = div * elem_size;
            let step = SpanStep {
                ty: elem,
                span_start: accum_offset + skip,
                depth: accum_depth + 1,
                container: u,
                entry_index: div,
                container_span_start: accum_offset,
            };
            if let ControlFlow::Break(b) = visit(&step) {
                return Some(b);
            }
            // Tail-descend into the element.
            walk_rec(
                table,
                accum_offset + skip,
                accum_depth + 1,
                target_offset % elem_size,
                elem,
                visit,
            )
        }
        TypeKind::Struct | TypeKind::Union => {
            let Some(hit) = first_subobject_spanning(table, u, target_offset) else {
                return None;
            };
            let related = d.related();
            let offset = hit.child_offset;
            // Visit every sibling sharing the winning offset, in declaration
            // order, recursing into each before moving to the next.
            let mut i = hit.entry_index;
            while i < related.len() && related[i].offset == offset {
                let step = SpanStep {
                    ty: related[i].ty,
                    span_start: accum_offset + offset,
                    depth: accum_depth + 1,
                    container: u,
                    entry_index: i,
                    container_span_start: accum_offset,
                };
                if let ControlFlow::Break(b) = visit(&step) {
                    return Some(b);
                }
                if let Some(b) = walk_rec(
                    table,
                    accum_offset + offset,
                    accum_depth + 1,
                    target_offset - offset,
                    related[i].ty,
                    visit,
                ) {
                    return Some(b);
                }
                i += 1;
            }
            None
        }
        _ => None,
    }
}

/// Diagnostic breadcrumbs left behind by [`find_matching_subobject`],
/// populated whether or not the search succeeds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchTrail {
    /// The most recently attempted candidate subobject type.
    pub last_attempted: Option<TypeId>,
    /// The residual offset at which it was attempted.
    pub last_attempted_offset: usize,
    /// Total offset consumed by descent so far.
    pub cumulative_offset: usize,
}

/// Does some subobject of `cur`, reached by descending toward
/// `target_offset`, match `desired` exactly at residual offset 0? With
/// `desired = None` any subobject starting exactly at the target offset
/// matches.
///
/// Union arms sharing the winning offset are tried lowest-declared first;
/// a later arm is attempted only after the earlier arm's entire subtree has
/// failed. Offsets that fall in padding or beyond the extent fail
/// structurally (they never reach the `residual == 0` base case).
pub fn find_matching_subobject(
    table: &TypeTable,
    target_offset: usize,
    cur: TypeId,
    desired: Option<TypeId>,
    trail: &mut SearchTrail,
) -> bool {
    if target_offset == 0 && desired.map_or(true, |d| d == cur) {
        return true;
    }
    let Some(hit) = first_subobject_spanning(table, cur, target_offset) else {
        return false;
    };
    // All same-offset siblings share this descent, so count it once.
    trail.cumulative_offset += hit.child_offset;

    let mut entry_index = hit.entry_index;
    let mut child = hit.child;
    loop {
        trail.last_attempted = Some(child);
        trail.last_attempted_offset = hit.residual;
        if find_matching_subobject(table, hit.residual, child, desired, trail) {
            return true;
        }
        // The candidate's subtree failed; a union may offer another arm at
        // the identical offset.
        let container = table.get(hit.container);
        if !container.kind().is_composite() {
            return false;
        }
        let related = container.related();
        let next = entry_index + 1;
        if next >= related.len() || related[next].offset != related[entry_index].offset {
            return false;
        }
        entry_index = next;
        child = related[next].ty;
    }
}

/// The residual path from a root type down to the innermost subobject
/// spanning an offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubobjectPath {
    /// Each descent step, outermost first.
    pub steps: Vec<SubobjectHit>,
    /// Offset remaining inside the innermost subobject (0 when the target
    /// offset is exactly a subobject boundary; nonzero means mid-primitive).
    pub residual: usize,
}

impl SubobjectPath {
    /// The innermost located subobject.
    pub fn innermost(&self) -> TypeId {
        self.steps.last().expect("paths always have at least one step").child
    }
}

/// Descend from `root` toward `offset`, greedily (lowest-declared arm first,
/// skipping same-offset arms the residual overshoots), and return the whole
/// path. Fails with [`Error::SubobjectNotFound`] exactly when the offset
/// falls in inter-member padding or beyond the object's extent -- a
/// structural failure, never a type mismatch.
pub fn locate_subobject_at_offset(
    table: &TypeTable,
    root: TypeId,
    offset: usize,
) -> Result<SubobjectPath> {
    let not_found = || Error::SubobjectNotFound { ty: root, offset };
    if offset >= table.max_offset(root) {
        return Err(not_found());
    }
    let mut steps = Vec::new();
    let mut cur = root;
    let mut off = offset;
    loop {
        let Some(mut hit) = first_subobject_spanning(table, cur, off) else {
            break;
        };
        // A zero-extent or overshot child means this arm cannot actually
        // contain the offset; a union may still have a wider arm here.
        loop {
            if hit.residual < table.max_offset(hit.child) {
                break;
            }
            let container = table.get(hit.container);
            if !container.kind().is_composite() {
                return Err(not_found());
            }
            let related = container.related();
            let next = hit.entry_index + 1;
            if next >= related.len() || related[next].offset != related[hit.entry_index].offset {
                return Err(not_found());
            }
            hit.entry_index = next;
            hit.child = related[next].ty;
        }
        steps.push(hit);
        cur = hit.child;
        off = hit.residual;
    }
    if steps.is_empty() {
        return Err(not_found());
    }
    Ok(SubobjectPath { steps, residual: off })
}

/// Check that the subobject at `offset` within `root` is `desired`,
/// distinguishing structural absence from a type mismatch.
pub fn check_subobject_type(
    table: &TypeTable,
    root: TypeId,
    offset: usize,
    desired: TypeId,
) -> Result<()> {
    let mut trail = SearchTrail::default();
    if find_matching_subobject(table, offset, root, Some(desired), &mut trail) {
        return Ok(());
    }
    if offset == 0 {
        // Offset 0 always names a structurally valid position: the object
        // itself. Failing to match there is a type disagreement.
        return Err(Error::TypeMismatch {
            expected: desired,
            found: trail.last_attempted.unwrap_or(root),
        });
    }
    match locate_subobject_at_offset(table, root, offset) {
        Ok(path) => Err(Error::TypeMismatch {
            expected: desired,
            found: path.innermost(),
        }),
        Err(_) => Err(Error::SubobjectNotFound { ty: root, offset }),
    }
}
