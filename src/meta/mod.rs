//! The type-layout model: an immutable, self-describing graph of layout
//! records, one per distinct program type.
//!
//! Descriptors live in an arena [`TypeTable`] and refer to each other by
//! stable [`TypeId`] handle, never by nesting, so self-referential and
//! mutually recursive types cost nothing: the graph of handles is acyclic in
//! the containment direction even when the pointer graph is not.
//!
//! Construction happens once, at load time, from offline-computed layout
//! facts; everything after that is read-only traversal. The builder methods
//! enforce the one invariant the locator's bisection depends on: composite
//! member offsets are sorted non-decreasing (equal offsets are legal and mean
//! union arms). Violating that, or indexing past `member_count`, is a
//! programming error and panics.

pub mod locate;

use serde::{Deserialize, Serialize};

/// Stable handle to one [`TypeDescriptor`] in a [`TypeTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeId(u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What flavour of layout a descriptor describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Base,
    Void,
    Pointer,
    FunctionSignature,
    Array { len: usize },
    Struct,
    Union,
}

impl TypeKind {
    pub fn is_composite(self) -> bool {
        matches!(self, TypeKind::Struct | TypeKind::Union)
    }
}

/// One contained (or referenced) type: a member of a composite, the element
/// of an array, or the pointee of a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelatedEntry {
    /// Byte offset of this member within its container. Always 0 for array
    /// elements and pointees.
    pub offset: usize,
    pub ty: TypeId,
}

#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    name: String,
    kind: TypeKind,
    /// Total bytes spanned by the type. 0 only for types with no extent
    /// (void, opaque, function signatures).
    max_offset: usize,
    related: Vec<RelatedEntry>,
}

impl TypeDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn max_offset(&self) -> usize {
        self.max_offset
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    pub(crate) fn related(&self) -> &[RelatedEntry] {
        &self.related
    }
}

/// The arena of descriptors. Built once at initialization, immutable and
/// shared by every query thereafter.
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<TypeDescriptor>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self { types: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Fetch a descriptor. A dangling handle is a programming error.
    pub fn get(&self, id: TypeId) -> &TypeDescriptor {
        &self.types[id.index()]
    }

    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.get(id).kind
    }

    pub fn max_offset(&self, id: TypeId) -> usize {
        self.get(id).max_offset
    }

    pub fn is_array(&self, id: TypeId) -> bool {
        self.get(id).is_array()
    }

    /// Number of contained subobjects: members for composites, elements for
    /// arrays, 0 for everything else.
    pub fn member_count(&self, id: TypeId) -> usize {
        let d = self.get(id);
        match d.kind {
            TypeKind::Struct | TypeKind::Union => d.related.len(),
            TypeKind::Array { len } => len,
            _ => 0,
        }
    }

    /// Byte offset of member `i`. Panics if `i >= member_count`.
    pub fn member_offset(&self, id: TypeId, i: usize) -> usize {
        let d = self.get(id);
        match d.kind {
            TypeKind::Struct | TypeKind::Union => d.related[i].offset,
            TypeKind::Array { len } => {
                assert!(i < len, "array index {i} out of bounds ({len} elements)");
                i * self.max_offset(d.related[0].ty)
            }
            _ => panic!("{:?} has no members", d.kind),
        }
    }

    /// Type of member `i`. Panics if `i >= member_count`.
    pub fn member_type(&self, id: TypeId, i: usize) -> TypeId {
        let d = self.get(id);
        match d.kind {
            TypeKind::Struct | TypeKind::Union => d.related[i].ty,
            TypeKind::Array { len } => {
                assert!(i < len, "array index {i} out of bounds ({len} elements)");
                d.related[0].ty
            }
            _ => panic!("{:?} has no members", d.kind),
        }
    }

    /// The element type, for arrays.
    pub fn element_type(&self, id: TypeId) -> Option<TypeId> {
        let d = self.get(id);
        match d.kind {
            TypeKind::Array { .. } => Some(d.related[0].ty),
            _ => None,
        }
    }

    /// The pointee, for pointers.
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        let d = self.get(id);
        match d.kind {
            TypeKind::Pointer => d.related.first().map(|r| r.ty),
            _ => None,
        }
    }

    /// Linear lookup by name, for symbol-driven registration paths.
    pub fn find_by_name(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|d| d.name == name)
            .map(|i| TypeId(i as u32))
    }

    fn push(&mut self, d: TypeDescriptor) -> TypeId {
        let id = TypeId(u32::try_from(self.types.len()).expect("type table overflow"));
        self.types.push(d);
        id
    }

    // -- builders: the load-time registration surface ------------------------

    pub fn base(&mut self, name: &str, size: usize) -> TypeId {
        self.push(TypeDescriptor {
            name: name.to_owned(),
            kind: TypeKind::Base,
            max_offset: size,
            related: Vec::new(),
        })
    }

    pub fn void(&mut self) -> TypeId {
        self.push(TypeDescriptor {
            name: "void".to_owned(),
            kind: TypeKind::Void,
            max_offset: 0,
            related: Vec::new(),
        })
    }

    pub fn pointer(&mut self, name: &str, pointee: TypeId) -> TypeId {
        self.push(TypeDescriptor {
            name: name.to_owned(),
            kind: TypeKind::Pointer,
            max_offset: std::mem::size_of::<usize>(),
            related: vec![RelatedEntry { offset: 0, ty: pointee }],
        })
    }

    pub fn function(&mut self, name: &str) -> TypeId {
        self.push(TypeDescriptor {
            name: name.to_owned(),
            kind: TypeKind::FunctionSignature,
            max_offset: 0,
            related: Vec::new(),
        })
    }

    pub fn array(&mut self, elem: TypeId, len: usize) -> TypeId {
        let elem_size = self.max_offset(elem);
        let name = format!("{}[{}]", self.get(elem).name, len);
        self.push(TypeDescriptor {
            name,
            kind: TypeKind::Array { len },
            max_offset: elem_size * len,
            related: vec![RelatedEntry { offset: 0, ty: elem }],
        })
    }

    /// Register a struct or union. `size` is the full laid-out size including
    /// trailing padding; `members` are `(byte_offset, type)` pairs in
    /// declaration order.
    ///
    /// # Panics
    ///
    /// If `kind` is not composite, if member offsets are not sorted
    /// non-decreasing, or if any offset is not below `size`.
    pub fn composite(
        &mut self,
        kind: TypeKind,
        name: &str,
        size: usize,
        members: &[(usize, TypeId)],
    ) -> TypeId {
        assert!(kind.is_composite(), "composite() requires Struct or Union");
        let mut related = Vec::with_capacity(members.len());
        let mut prev = 0usize;
        for &(offset, ty) in members {
            assert!(
                offset >= prev,
                "member offsets of {name:?} must be sorted non-decreasing"
            );
            assert!(offset < size || size == 0, "member offset {offset} not below size {size} in {name:?}");
            prev = offset;
            related.push(RelatedEntry { offset, ty });
        }
        self.push(TypeDescriptor {
            name: name.to_owned(),
            kind,
            max_offset: size,
            related,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (TypeTable, TypeId, TypeId, TypeId) {
        let mut t = TypeTable::new();
        let int = t.base("int", 4);
        let double = t.base("double", 8);
        let s = t.composite(TypeKind::Struct, "pair", 16, &[(0, int), (8, double)]);
        (t, int, double, s)
    }

    #[test]
    fn accessors_report_layout() {
        let (t, int, double, s) = sample();
        assert_eq!(t.kind(s), TypeKind::Struct);
        assert_eq!(t.max_offset(s), 16);
        assert_eq!(t.member_count(s), 2);
        assert_eq!(t.member_offset(s, 0), 0);
        assert_eq!(t.member_offset(s, 1), 8);
        assert_eq!(t.member_type(s, 0), int);
        assert_eq!(t.member_type(s, 1), double);
        assert!(!t.is_array(s));
        assert_eq!(t.element_type(s), None);
    }

    #[test]
    fn arrays_expose_elements_as_members() {
        let (mut t, int, _, _) = sample();
        let a = t.array(int, 5);
        assert!(t.is_array(a));
        assert_eq!(t.max_offset(a), 20);
        assert_eq!(t.member_count(a), 5);
        assert_eq!(t.member_offset(a, 3), 12);
        assert_eq!(t.member_type(a, 3), int);
        assert_eq!(t.element_type(a), Some(int));
    }

    #[test]
    fn sorted_offset_invariant_holds_for_all_composites() {
        let (t, ..) = sample();
        for i in 0..t.len() {
            let id = TypeId(i as u32);
            if t.kind(id).is_composite() {
                for w in t.get(id).related().windows(2) {
                    assert!(w[0].offset <= w[1].offset);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "sorted non-decreasing")]
    fn unsorted_members_are_rejected() {
        let (mut t, int, double, _) = sample();
        t.composite(TypeKind::Struct, "bad", 16, &[(8, double), (0, int)]);
    }

    #[test]
    #[should_panic]
    fn member_index_out_of_bounds_panics() {
        let (t, _, _, s) = sample();
        let _ = t.member_offset(s, 2);
    }

    #[test]
    fn unions_may_share_offsets() {
        let (mut t, int, double, _) = sample();
        let u = t.composite(TypeKind::Union, "iu", 8, &[(0, int), (0, double)]);
        assert_eq!(t.member_count(u), 2);
        assert_eq!(t.member_offset(u, 0), 0);
        assert_eq!(t.member_offset(u, 1), 0);
    }

    #[test]
    fn find_by_name_resolves_registered_types() {
        let (t, int, ..) = sample();
        assert_eq!(t.find_by_name("int"), Some(int));
        assert_eq!(t.find_by_name("missing"), None);
    }

    #[test]
    fn pointers_do_not_count_pointees_as_members() {
        let (mut t, int, ..) = sample();
        let p = t.pointer("int*", int);
        assert_eq!(t.member_count(p), 0);
        assert_eq!(t.pointee(p), Some(int));
        assert_eq!(t.max_offset(p), std::mem::size_of::<usize>());
    }
}
