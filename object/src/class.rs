//! Per-class layout metadata.
//!
//! The table is built once at startup and is read-only afterwards. The
//! collector needs three things from it: the byte size of an instance (or the
//! element shift of an array kind), the offsets of the reference fields of an
//! instance, and the static storage slots that hold references.

use std::{collections::HashMap, fmt};

use crate::{OBJECT_OVERHEAD, ObjectHeader, REFERENCE_SIZE};

/// Index of a class in the [`ClassTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClassId(u32);

impl ClassId {
    pub const OBJECT: Self = Self(0);
    pub const OBJECT_ARRAY: Self = Self(1);
    pub const INT_ARRAY: Self = Self(2);
    pub const FLOAT_ARRAY: Self = Self(3);
    pub const BOOLEAN_ARRAY: Self = Self(4);
    pub const BYTE_ARRAY: Self = Self(5);
    pub const CHAR_ARRAY: Self = Self(6);
    pub const SHORT_ARRAY: Self = Self(7);
    pub const LONG_ARRAY: Self = Self(8);
    pub const DOUBLE_ARRAY: Self = Self(9);

    pub const FIRST_ARRAY: Self = Self::OBJECT_ARRAY;
    pub const LAST_ARRAY: Self = Self::DOUBLE_ARRAY;

    /// Class of the filler objects the sweep writes over dead regions.
    pub const FILLER: Self = Self::BYTE_ARRAY;

    /// Number of classes every table starts with.
    pub const BUILTIN_COUNT: usize = Self::LAST_ARRAY.0 as usize + 1;

    #[inline(always)]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn is_array(self) -> bool {
        self.0 >= Self::FIRST_ARRAY.0 && self.0 <= Self::LAST_ARRAY.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The nine built-in array kinds. The discriminant is the class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArrayKind {
    Object = 1,
    Int,
    Float,
    Boolean,
    Byte,
    Char,
    Short,
    Long,
    Double,
}

impl ArrayKind {
    pub const ALL: [ArrayKind; 9] = [
        ArrayKind::Object,
        ArrayKind::Int,
        ArrayKind::Float,
        ArrayKind::Boolean,
        ArrayKind::Byte,
        ArrayKind::Char,
        ArrayKind::Short,
        ArrayKind::Long,
        ArrayKind::Double,
    ];

    #[inline(always)]
    pub const fn class_id(self) -> ClassId {
        ClassId(self as u32)
    }

    #[inline]
    pub const fn from_class_id(class: ClassId) -> Option<Self> {
        match class.0 {
            1 => Some(ArrayKind::Object),
            2 => Some(ArrayKind::Int),
            3 => Some(ArrayKind::Float),
            4 => Some(ArrayKind::Boolean),
            5 => Some(ArrayKind::Byte),
            6 => Some(ArrayKind::Char),
            7 => Some(ArrayKind::Short),
            8 => Some(ArrayKind::Long),
            9 => Some(ArrayKind::Double),
            _ => None,
        }
    }

    /// log2 of the element size.
    #[inline(always)]
    pub const fn element_shift(self) -> u32 {
        match self {
            ArrayKind::Boolean | ArrayKind::Byte => 0,
            ArrayKind::Char | ArrayKind::Short => 1,
            ArrayKind::Object | ArrayKind::Int | ArrayKind::Float => 2,
            ArrayKind::Long | ArrayKind::Double => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ArrayKind::Object => "Object[]",
            ArrayKind::Int => "int[]",
            ArrayKind::Float => "float[]",
            ArrayKind::Boolean => "boolean[]",
            ArrayKind::Byte => "byte[]",
            ArrayKind::Char => "char[]",
            ArrayKind::Short => "short[]",
            ArrayKind::Long => "long[]",
            ArrayKind::Double => "double[]",
        }
    }
}

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// A managed reference the collector traces.
    Reference,
    /// An address-sized value the collector must not trace.
    RawPointer,
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
}

impl FieldKind {
    pub const fn size(self) -> u32 {
        match self {
            FieldKind::Bool | FieldKind::Byte => 1,
            FieldKind::Char | FieldKind::Short => 2,
            FieldKind::Reference
            | FieldKind::RawPointer
            | FieldKind::Int
            | FieldKind::Float => 4,
            FieldKind::Long | FieldKind::Double => 8,
        }
    }

    #[inline(always)]
    pub const fn is_traced(self) -> bool {
        matches!(self, FieldKind::Reference)
    }
}

/// A laid out field. For static fields the offset is relative to the start
/// of the static area, for instance fields relative to the object address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    pub name: String,
    pub kind: FieldKind,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Instance,
    Abstract,
    Array(ArrayKind),
}

/// Layout metadata of one class.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub super_class: Option<ClassId>,
    pub kind: ClassKind,
    /// Unaligned byte size of the instance layout, header included.
    layout_size: u32,
    fields: Vec<FieldSlot>,
    statics: Vec<FieldSlot>,
    reference_offsets: Box<[u32]>,
    static_reference_offsets: Box<[u32]>,
}

impl ClassInfo {
    /// Instance size in bytes, `None` for arrays and abstract classes.
    #[inline]
    pub fn instance_size(&self) -> Option<u32> {
        match self.kind {
            ClassKind::Instance => Some(self.layout_size),
            _ => None,
        }
    }

    #[inline]
    pub fn array_kind(&self) -> Option<ArrayKind> {
        match self.kind {
            ClassKind::Array(kind) => Some(kind),
            _ => None,
        }
    }

    /// Offsets of every traced reference field, inherited ones first.
    #[inline(always)]
    pub fn reference_offsets(&self) -> &[u32] {
        &self.reference_offsets
    }

    /// Static-area offsets of the reference-typed static fields of this class.
    #[inline(always)]
    pub fn static_reference_offsets(&self) -> &[u32] {
        &self.static_reference_offsets
    }

    /// All instance fields, inherited ones first.
    pub fn fields(&self) -> &[FieldSlot] {
        &self.fields
    }

    pub fn statics(&self) -> &[FieldSlot] {
        &self.statics
    }

    pub fn field(&self, name: &str) -> Option<&FieldSlot> {
        // later declarations shadow inherited fields of the same name
        self.fields.iter().rev().find(|f| f.name == name)
    }

    pub fn static_field(&self, name: &str) -> Option<&FieldSlot> {
        self.statics.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    DuplicateClass(String),
    UnknownSuperClass { class: String, super_class: ClassId },
    ArraySuperClass { class: String, super_class: ClassId },
    TooManyClasses,
    InstanceTooLarge(String),
    StaticAreaTooLarge(String),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::DuplicateClass(name) => {
                write!(f, "class `{}` is already defined", name)
            }
            LayoutError::UnknownSuperClass { class, super_class } => {
                write!(f, "super class {} of `{}` is not defined", super_class, class)
            }
            LayoutError::ArraySuperClass { class, super_class } => {
                write!(f, "`{}` cannot extend array class {}", class, super_class)
            }
            LayoutError::TooManyClasses => {
                write!(f, "class id space exhausted ({} ids)", ObjectHeader::MAX_CLASS_ID)
            }
            LayoutError::InstanceTooLarge(name) => {
                write!(f, "instance layout of `{}` exceeds the address width", name)
            }
            LayoutError::StaticAreaTooLarge(name) => {
                write!(f, "static fields of `{}` exceed the address width", name)
            }
        }
    }
}

impl std::error::Error for LayoutError {}

/// Declaration of a user class, fed to [`ClassTableBuilder::define`].
#[derive(Debug, Clone)]
pub struct ClassDef {
    name: String,
    super_class: ClassId,
    is_abstract: bool,
    fields: Vec<(String, FieldKind)>,
    statics: Vec<(String, FieldKind)>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_class: ClassId::OBJECT,
            is_abstract: false,
            fields: Vec::new(),
            statics: Vec::new(),
        }
    }

    pub fn extends(mut self, super_class: ClassId) -> Self {
        self.super_class = super_class;
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    pub fn static_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.statics.push((name.into(), kind));
        self
    }
}

#[inline(always)]
const fn align_to(offset: u32, align: u32) -> u32 {
    (offset + (align - 1)) & !(align - 1)
}

fn checked_align_to(offset: u32, align: u32) -> Option<u32> {
    Some(offset.checked_add(align - 1)? & !(align - 1))
}

/// Builds a [`ClassTable`]; `Object` and the built-in array classes are
/// registered up front so user classes start at id 10.
#[derive(Debug)]
pub struct ClassTableBuilder {
    classes: Vec<ClassInfo>,
    by_name: HashMap<String, ClassId>,
    static_cursor: u32,
}

impl Default for ClassTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTableBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            classes: Vec::with_capacity(ClassId::BUILTIN_COUNT),
            by_name: HashMap::new(),
            static_cursor: 0,
        };

        builder.push(ClassInfo {
            name: "Object".into(),
            super_class: None,
            kind: ClassKind::Instance,
            layout_size: OBJECT_OVERHEAD,
            fields: Vec::new(),
            statics: Vec::new(),
            reference_offsets: Box::default(),
            static_reference_offsets: Box::default(),
        });

        for kind in ArrayKind::ALL {
            debug_assert_eq!(kind.class_id().index(), builder.classes.len());
            builder.push(ClassInfo {
                name: kind.name().into(),
                super_class: Some(ClassId::OBJECT),
                kind: ClassKind::Array(kind),
                layout_size: OBJECT_OVERHEAD,
                fields: Vec::new(),
                statics: Vec::new(),
                reference_offsets: Box::default(),
                static_reference_offsets: Box::default(),
            });
        }
        builder
    }

    fn push(&mut self, info: ClassInfo) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.by_name.insert(info.name.clone(), id);
        self.classes.push(info);
        id
    }

    /// Lays out `def` behind its super class and registers it.
    pub fn define(&mut self, def: ClassDef) -> Result<ClassId, LayoutError> {
        if self.by_name.contains_key(&def.name) {
            return Err(LayoutError::DuplicateClass(def.name));
        }
        if self.classes.len() > ObjectHeader::MAX_CLASS_ID as usize {
            return Err(LayoutError::TooManyClasses);
        }
        let Some(parent) = self.classes.get(def.super_class.index()) else {
            return Err(LayoutError::UnknownSuperClass {
                class: def.name,
                super_class: def.super_class,
            });
        };
        if parent.array_kind().is_some() {
            return Err(LayoutError::ArraySuperClass {
                class: def.name,
                super_class: def.super_class,
            });
        }

        let mut fields = parent.fields.clone();
        let mut references = parent.reference_offsets.to_vec();
        let mut cursor = parent.layout_size;

        for (name, kind) in def.fields {
            let size = kind.size();
            cursor = checked_align_to(cursor, size)
                .and_then(|offset| offset.checked_add(size))
                .ok_or_else(|| LayoutError::InstanceTooLarge(def.name.clone()))?;
            let offset = cursor - size;
            if kind.is_traced() {
                references.push(offset);
            }
            fields.push(FieldSlot { name, kind, offset });
        }

        let mut statics = Vec::with_capacity(def.statics.len());
        let mut static_references = Vec::new();
        let mut static_cursor = self.static_cursor;
        for (name, kind) in def.statics {
            let size = kind.size();
            static_cursor = checked_align_to(static_cursor, size)
                .and_then(|offset| offset.checked_add(size))
                .ok_or_else(|| LayoutError::StaticAreaTooLarge(def.name.clone()))?;
            let offset = static_cursor - size;
            if kind.is_traced() {
                static_references.push(offset);
            }
            statics.push(FieldSlot { name, kind, offset });
        }
        // the static area size is rounded up to a reference slot
        if checked_align_to(static_cursor, REFERENCE_SIZE).is_none() {
            return Err(LayoutError::StaticAreaTooLarge(def.name));
        }
        self.static_cursor = static_cursor;

        let kind = if def.is_abstract {
            ClassKind::Abstract
        } else {
            ClassKind::Instance
        };

        Ok(self.push(ClassInfo {
            name: def.name,
            super_class: Some(def.super_class),
            kind,
            layout_size: cursor,
            fields,
            statics,
            reference_offsets: references.into_boxed_slice(),
            static_reference_offsets: static_references.into_boxed_slice(),
        }))
    }

    pub fn build(self) -> ClassTable {
        let static_roots = self
            .classes
            .iter()
            .flat_map(|class| class.static_reference_offsets.iter().copied())
            .collect();
        ClassTable {
            classes: self.classes.into_boxed_slice(),
            by_name: self.by_name,
            static_area_size: align_to(self.static_cursor, REFERENCE_SIZE),
            static_roots,
        }
    }
}

/// Read-only class metadata, indexed by [`ClassId`].
#[derive(Debug)]
pub struct ClassTable {
    classes: Box<[ClassInfo]>,
    by_name: HashMap<String, ClassId>,
    static_area_size: u32,
    static_roots: Box<[u32]>,
}

impl ClassTable {
    /// A table with only `Object` and the built-in arrays.
    pub fn builtin() -> Self {
        ClassTableBuilder::new().build()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    #[inline(always)]
    pub fn contains(&self, class: ClassId) -> bool {
        class.index() < self.classes.len()
    }

    #[inline(always)]
    pub fn get(&self, class: ClassId) -> Option<&ClassInfo> {
        self.classes.get(class.index())
    }

    pub fn by_name(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &ClassInfo)> {
        self.classes
            .iter()
            .enumerate()
            .map(|(idx, info)| (ClassId(idx as u32), info))
    }

    /// Reference field offsets of `class`; empty for unknown ids.
    #[inline(always)]
    pub fn reference_offsets(&self, class: ClassId) -> &[u32] {
        match self.get(class) {
            Some(info) => info.reference_offsets(),
            None => &[],
        }
    }

    #[inline]
    pub fn instance_size(&self, class: ClassId) -> Option<u32> {
        self.get(class).and_then(ClassInfo::instance_size)
    }

    pub fn field_offset(&self, class: ClassId, name: &str) -> Option<u32> {
        self.get(class)?.field(name).map(|f| f.offset)
    }

    pub fn static_field_offset(&self, class: ClassId, name: &str) -> Option<u32> {
        self.get(class)?.static_field(name).map(|f| f.offset)
    }

    /// Bytes of static storage all classes together need.
    #[inline(always)]
    pub fn static_area_size(&self) -> u32 {
        self.static_area_size
    }

    /// Static-area offsets of every reference-typed static field.
    #[inline(always)]
    pub fn static_reference_offsets(&self) -> &[u32] {
        &self.static_roots
    }
}
