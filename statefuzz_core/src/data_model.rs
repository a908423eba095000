use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Index of an element inside a [`DataModel`]'s node table. The root block is always `0`.
pub type NodeId = u32;

/// Version tag written into every persisted [`SeedRecord`].
pub const SEED_FORMAT_VERSION: u32 = 1;

const ROOT: NodeId = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataModelError {
    #[error("Element '{path}' not found in data model '{model}'")]
    ElementNotFound { model: String, path: String },

    #[error("Element '{0}' is not a leaf and holds no value")]
    NotALeaf(String),

    #[error("Node id {0} is out of range")]
    InvalidNode(NodeId),

    #[error("Value for '{element}' cannot be applied: {reason}")]
    InvalidValue { element: String, reason: String },

    #[error("Malformed element tree: {0}")]
    MalformedTree(String),
}

/// A loosely-typed value exchanged with publishers, monitors and expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Variant {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Variant {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Byte view of the value. Only byte and string variants convert; integers and
    /// booleans have no canonical wire form.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Variant::Bytes(b) => Some(b.clone()),
            Variant::Str(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Null => write!(f, "null"),
            Variant::Bool(b) => write!(f, "{b}"),
            Variant::Int(i) => write!(f, "{i}"),
            Variant::Str(s) => write!(f, "\"{s}\""),
            Variant::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum ElementKind {
    Block {
        children: Vec<NodeId>,
    },
    Number {
        size: u8,
        big_endian: bool,
        value: u64,
    },
    Str {
        value: String,
        length: Option<u32>,
    },
    Blob {
        value: Vec<u8>,
        length: Option<u32>,
    },
}

impl ElementKind {
    pub fn is_leaf(&self) -> bool {
        !matches!(self, ElementKind::Block { .. })
    }

    /// Number of bytes this element occupies on the wire, when the shape fixes it.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ElementKind::Block { .. } => None,
            ElementKind::Number { size, .. } => Some(*size as usize),
            ElementKind::Str { length, .. } | ElementKind::Blob { length, .. } => {
                length.map(|l| l as usize)
            }
        }
    }

    fn write_value(&self, out: &mut Vec<u8>) {
        match self {
            ElementKind::Block { .. } => {}
            ElementKind::Number {
                size,
                big_endian,
                value,
            } => {
                let n = (*size as usize).min(8);
                if *big_endian {
                    out.extend_from_slice(&value.to_be_bytes()[8 - n..]);
                } else {
                    out.extend_from_slice(&value.to_le_bytes()[..n]);
                }
            }
            ElementKind::Str { value, .. } => out.extend_from_slice(value.as_bytes()),
            ElementKind::Blob { value, .. } => out.extend_from_slice(value),
        }
    }

    /// Overwrites the leaf value from raw bytes. Numbers keep at most `size` bytes,
    /// strings are decoded lossily.
    pub fn assign_bytes(&mut self, bytes: &[u8]) {
        match self {
            ElementKind::Block { .. } => {}
            ElementKind::Number {
                size,
                big_endian,
                value,
            } => {
                *value = decode_number(bytes, *size, *big_endian);
            }
            ElementKind::Str { value, .. } => {
                *value = String::from_utf8_lossy(bytes).into_owned();
            }
            ElementKind::Blob { value, .. } => {
                *value = bytes.to_vec();
            }
        }
    }
}

fn number_mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size as u32 * 8)) - 1
    }
}

pub(crate) fn decode_number(bytes: &[u8], size: u8, big_endian: bool) -> u64 {
    let folded = if big_endian {
        bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    } else {
        bytes.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    };
    folded & number_mask(size)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct DataElement {
    pub name: String,
    pub parent: Option<NodeId>,
    /// Tokens must match their current value when cracked.
    pub token: bool,
    pub kind: ElementKind,
}

/// A typed tree of data elements backed by a shared node arena.
///
/// Cloning is an `Arc` bump. Mutating a clone copies the node table spine and only the
/// touched node, so the source model never observes the change. The serialized value
/// is computed lazily and cached until the next mutation.
pub struct DataModel {
    name: String,
    nodes: Arc<Vec<Arc<DataElement>>>,
    p: Option<f64>,
    use_count: u32,
    action: Option<String>,
    value: OnceLock<Arc<[u8]>>,
}

impl Clone for DataModel {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            nodes: Arc::clone(&self.nodes),
            p: self.p,
            use_count: self.use_count,
            action: self.action.clone(),
            value: self.value.clone(),
        }
    }
}

impl PartialEq for DataModel {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && *self.nodes == *other.nodes
    }
}

impl fmt::Debug for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataModel")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("p", &self.p)
            .field("use_count", &self.use_count)
            .field("action", &self.action)
            .finish()
    }
}

impl DataModel {
    pub fn builder(name: impl Into<String>) -> DataModelBuilder {
        DataModelBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_ids().is_empty()
    }

    /// Mutation-probability weight assigned by the corpus scheduler.
    pub fn p(&self) -> Option<f64> {
        self.p
    }

    pub fn set_p(&mut self, p: f64) {
        self.p = Some(p);
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn set_use_count(&mut self, count: u32) {
        self.use_count = count;
    }

    /// Name of the action this model is bound to. Non-owning.
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn set_action(&mut self, action: impl Into<String>) {
        self.action = Some(action.into());
    }

    pub fn element(&self, id: NodeId) -> Option<&DataElement> {
        self.nodes.get(id as usize).map(|e| e.as_ref())
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.element(id).map(|e| &e.kind) {
            Some(ElementKind::Block { children }) => children,
            _ => &[],
        }
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.element(id).is_some_and(|e| e.kind.is_leaf())
    }

    /// Leaves in depth-first (wire) order.
    pub fn leaf_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_leaves(ROOT, &mut out);
        out
    }

    fn collect_leaves(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let Some(element) = self.element(id) else {
            return;
        };
        match &element.kind {
            ElementKind::Block { children } => {
                for child in children {
                    self.collect_leaves(*child, out);
                }
            }
            _ => out.push(id),
        }
    }

    /// Dotted name from the model root, e.g. `Request.header.length`.
    pub fn full_name(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.element(current) {
                Some(e) => {
                    parts.push(e.name.as_str());
                    cursor = e.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        parts.join(".")
    }

    /// Resolves a dotted path relative to the root (`header.length`). A leading
    /// model name is accepted and ignored.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut segments = path.split('.').peekable();
        if segments.peek() == Some(&self.name.as_str()) {
            segments.next();
        }
        let mut current = ROOT;
        for segment in segments {
            current = *self.children(current).iter().find(|child| {
                self.element(**child)
                    .is_some_and(|element| element.name == segment)
            })?;
        }
        Some(current)
    }

    pub fn leaf_bytes(&self, id: NodeId) -> Option<Vec<u8>> {
        let element = self.element(id)?;
        if !element.kind.is_leaf() {
            return None;
        }
        let mut out = Vec::new();
        element.kind.write_value(&mut out);
        Some(out)
    }

    /// Applies `f` to a single element, copying only what is shared.
    pub fn with_element_mut<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut DataElement) -> R,
    ) -> Result<R, DataModelError> {
        if id as usize >= self.nodes.len() {
            return Err(DataModelError::InvalidNode(id));
        }
        self.value = OnceLock::new();
        let table = Arc::make_mut(&mut self.nodes);
        let element = Arc::make_mut(&mut table[id as usize]);
        Ok(f(element))
    }

    pub fn set_leaf_bytes(&mut self, id: NodeId, bytes: &[u8]) -> Result<(), DataModelError> {
        if !self.is_leaf(id) {
            return Err(match self.element(id) {
                Some(_) => DataModelError::NotALeaf(self.full_name(id)),
                None => DataModelError::InvalidNode(id),
            });
        }
        self.with_element_mut(id, |e| e.kind.assign_bytes(bytes))
    }

    /// Sets a leaf from a [`Variant`]. Integers are accepted by numbers only.
    pub fn set_leaf_value(&mut self, id: NodeId, value: &Variant) -> Result<(), DataModelError> {
        if let Variant::Int(i) = value {
            let is_number = matches!(
                self.element(id).map(|e| &e.kind),
                Some(ElementKind::Number { .. })
            );
            if !is_number {
                return Err(DataModelError::InvalidValue {
                    element: self.full_name(id),
                    reason: "integer values only apply to number elements".into(),
                });
            }
            let raw = *i as u64;
            return self.with_element_mut(id, |e| {
                if let ElementKind::Number { size, value, .. } = &mut e.kind {
                    *value = raw & number_mask(*size);
                }
            });
        }
        let bytes = value
            .to_bytes()
            .or_else(|| value.as_bool().map(|b| vec![b as u8]))
            .ok_or_else(|| DataModelError::InvalidValue {
                element: self.full_name(id),
                reason: format!("{value} has no byte representation"),
            })?;
        self.set_leaf_bytes(id, &bytes)
    }

    /// Applies `(path, value)` overrides, as bound by a data set's field list.
    pub fn apply_fields(&mut self, fields: &[(String, Variant)]) -> Result<(), DataModelError> {
        for (path, value) in fields {
            let id = self
                .find(path)
                .ok_or_else(|| DataModelError::ElementNotFound {
                    model: self.name.clone(),
                    path: path.clone(),
                })?;
            self.set_leaf_value(id, value)?;
        }
        Ok(())
    }

    /// Serialized value of the whole tree.
    pub fn value(&self) -> &[u8] {
        self.value.get_or_init(|| {
            let mut out = Vec::new();
            for id in self.leaf_ids() {
                if let Some(element) = self.element(id) {
                    element.kind.write_value(&mut out);
                }
            }
            out.into()
        })
    }

    /// Whether the cached value is currently materialized.
    pub fn is_value_cached(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn to_record(&self) -> SeedRecord {
        SeedRecord {
            version: SEED_FORMAT_VERSION,
            name: self.name.clone(),
            elements: self.nodes.iter().map(|e| e.as_ref().clone()).collect(),
            p: self.p,
            use_count: self.use_count,
            action: self.action.clone(),
        }
    }

    /// Rebuilds a model from its durable form.
    ///
    /// # Errors
    /// Returns [`DataModelError::MalformedTree`] unless the elements form a single tree
    /// rooted at a block.
    pub fn from_record(record: SeedRecord) -> Result<Self, DataModelError> {
        record.check_tree()?;
        Ok(Self {
            name: record.name,
            nodes: Arc::new(record.elements.into_iter().map(Arc::new).collect()),
            p: record.p,
            use_count: record.use_count,
            action: record.action,
            value: OnceLock::new(),
        })
    }
}

/// Durable form of a [`DataModel`] written by seed stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SeedRecord {
    pub version: u32,
    pub name: String,
    pub elements: Vec<DataElement>,
    pub p: Option<f64>,
    pub use_count: u32,
    pub action: Option<String>,
}

impl SeedRecord {
    /// Every element except the root must be listed exactly once, by the block its
    /// `parent` names, and be reachable from the root.
    fn check_tree(&self) -> Result<(), DataModelError> {
        let malformed = |reason: String| Err(DataModelError::MalformedTree(reason));
        let count = self.elements.len();
        match self.elements.first() {
            Some(DataElement {
                parent: None,
                kind: ElementKind::Block { .. },
                ..
            }) => {}
            _ => return malformed("root must be a block without parent".into()),
        }

        let mut seen = vec![false; count];
        seen[ROOT as usize] = true;
        let mut pending = vec![ROOT];
        let mut reached = 1;
        while let Some(id) = pending.pop() {
            let ElementKind::Block { children } = &self.elements[id as usize].kind else {
                continue;
            };
            for &child in children {
                let Some(element) = self.elements.get(child as usize) else {
                    return malformed(format!("child {child} of node {id} is out of range"));
                };
                if seen[child as usize] {
                    return malformed(format!("node {child} is listed more than once"));
                }
                if element.parent != Some(id) {
                    return malformed(format!("node {child} does not name {id} as parent"));
                }
                seen[child as usize] = true;
                reached += 1;
                pending.push(child);
            }
        }
        if reached != count {
            return malformed(format!("{} nodes are unreachable", count - reached));
        }
        Ok(())
    }
}

/// Incremental builder for data model trees.
///
/// ```
/// use statefuzz_core::data_model::DataModel;
///
/// let model = DataModel::builder("Request")
///     .begin_block("header")
///     .number("length", 2, true, 5)
///     .end_block()
///     .string("body", "hello")
///     .build();
/// assert_eq!(model.value(), b"\x00\x05hello");
/// ```
pub struct DataModelBuilder {
    name: String,
    nodes: Vec<DataElement>,
    open: Vec<NodeId>,
}

impl DataModelBuilder {
    fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            nodes: vec![DataElement {
                name: name.clone(),
                parent: None,
                token: false,
                kind: ElementKind::Block {
                    children: Vec::new(),
                },
            }],
            name,
            open: vec![ROOT],
        }
    }

    fn push(mut self, name: impl Into<String>, kind: ElementKind) -> Self {
        let id = self.nodes.len() as NodeId;
        let parent = self.open.last().copied().unwrap_or(ROOT);
        self.nodes.push(DataElement {
            name: name.into(),
            parent: Some(parent),
            token: false,
            kind,
        });
        if let ElementKind::Block { children } = &mut self.nodes[parent as usize].kind {
            children.push(id);
        }
        self
    }

    pub fn begin_block(self, name: impl Into<String>) -> Self {
        let id = self.nodes.len() as NodeId;
        let mut builder = self.push(
            name,
            ElementKind::Block {
                children: Vec::new(),
            },
        );
        builder.open.push(id);
        builder
    }

    pub fn end_block(mut self) -> Self {
        if self.open.len() > 1 {
            self.open.pop();
        }
        self
    }

    pub fn number(self, name: impl Into<String>, size: u8, big_endian: bool, value: u64) -> Self {
        let size = size.clamp(1, 8);
        self.push(
            name,
            ElementKind::Number {
                size,
                big_endian,
                value: value & number_mask(size),
            },
        )
    }

    pub fn string(self, name: impl Into<String>, value: &str) -> Self {
        self.push(
            name,
            ElementKind::Str {
                value: value.to_string(),
                length: None,
            },
        )
    }

    pub fn fixed_string(self, name: impl Into<String>, value: &str, length: u32) -> Self {
        self.push(
            name,
            ElementKind::Str {
                value: value.to_string(),
                length: Some(length),
            },
        )
    }

    pub fn blob(self, name: impl Into<String>, value: Vec<u8>) -> Self {
        self.push(
            name,
            ElementKind::Blob {
                value,
                length: None,
            },
        )
    }

    pub fn fixed_blob(self, name: impl Into<String>, value: Vec<u8>, length: u32) -> Self {
        self.push(
            name,
            ElementKind::Blob {
                value,
                length: Some(length),
            },
        )
    }

    /// Marks the most recently added element as a token.
    pub fn token(mut self) -> Self {
        if let Some(last) = self.nodes.last_mut() {
            if last.parent.is_some() {
                last.token = true;
            }
        }
        self
    }

    pub fn build(self) -> DataModel {
        DataModel {
            name: self.name,
            nodes: Arc::new(self.nodes.into_iter().map(Arc::new).collect()),
            p: None,
            use_count: 0,
            action: None,
            value: OnceLock::new(),
        }
    }
}
