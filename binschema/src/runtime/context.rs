//! Encoding and decoding context objects threaded through generated code.
//!
//! Computed fields whose targets escape a single stack frame (ancestor
//! references like `../payload`, array selectors, back-references) resolve
//! through an [`EncodeContext`]: a value built at the top-level `encode`
//! boundary and extended, never shared, as nested encoders are entered. The
//! decode side only needs length-field values from upstream frames, carried
//! by the much smaller [`DecodeContext`].

use ahash::AHashMap;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

use super::error::{CodecError, CodecResult};

/// Snapshot value for one parent field.
///
/// A closed tagged union over the shapes that show up as computed-field
/// targets: integers, strings, raw byte vectors, and materialized item
/// collections. Nothing dynamic beyond this set.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Uint(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    /// Materialized array items, in encounter order.
    Items(Vec<ItemEntry>),
}

/// One materialized element of a typed array inside a parent snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEntry {
    /// Variant type name of the element.
    pub type_name: String,
    /// Encoded byte length of the element.
    pub encoded_size: usize,
    /// The element's own primitive fields, for correlated lookups.
    pub fields: AHashMap<String, FieldValue>,
}

impl FieldValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            FieldValue::Uint(v) => Some(*v),
            FieldValue::Int(v) if *v >= 0 => Some(*v as u64),
            FieldValue::Bool(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    /// Element count for collections, byte count for sequences, 0 otherwise.
    pub fn len(&self) -> usize {
        match self {
            FieldValue::Bytes(bytes) => bytes.len(),
            FieldValue::Str(s) => s.len(),
            FieldValue::Items(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The quantity a `length_of` computation extracts from this value:
    /// numeric values pass through, byte-valued shapes yield their byte
    /// count, item collections their element count.
    pub fn length_of_value(&self) -> usize {
        match self {
            FieldValue::Uint(v) => *v as usize,
            FieldValue::Int(v) => *v as usize,
            FieldValue::Float(v) => *v as usize,
            FieldValue::Bool(v) => usize::from(*v),
            FieldValue::Str(s) => s.len(),
            FieldValue::Bytes(bytes) => bytes.len(),
            FieldValue::Items(items) => items.len(),
        }
    }

    /// Sums the encoded sizes of items whose type matches `type_name`.
    pub fn sum_type_sizes(&self, type_name: &str) -> usize {
        match self {
            FieldValue::Items(items) => items
                .iter()
                .filter(|item| item.type_name == type_name)
                .map(|item| item.encoded_size)
                .sum(),
            _ => 0,
        }
    }

    /// Finds the `n`-th item (0-based) whose type matches `type_name`.
    pub fn nth_item_of_type(&self, type_name: &str, n: usize) -> Option<&ItemEntry> {
        match self {
            FieldValue::Items(items) => {
                items.iter().filter(|item| item.type_name == type_name).nth(n)
            }
            _ => None,
        }
    }

    /// Finds the last item whose type matches `type_name`.
    pub fn last_item_of_type(&self, type_name: &str) -> Option<&ItemEntry> {
        match self {
            FieldValue::Items(items) => {
                items.iter().rev().find(|item| item.type_name == type_name)
            }
            _ => None,
        }
    }

    /// Exact wire bytes for CRC computation. Only byte-valued shapes carry
    /// them: a snapshot numeric has lost its wire width and byte order, so
    /// it cannot reproduce the bytes the field occupies in the stream.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            FieldValue::Str(s) => Some(s.as_bytes().to_vec()),
            FieldValue::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }
}

/// Shared dictionary mapping encoded byte runs to their absolute offsets,
/// used by back-reference encoding.
pub type CompressionDict = Rc<RefCell<FxHashMap<Vec<u8>, usize>>>;

/// Field-name → value map used for parent snapshots and item field maps.
pub type FieldMap = AHashMap<String, FieldValue>;

/// Per-message encoding state threaded down through nested `encode` calls.
///
/// Created at the outermost `encode` boundary. Each composite that encodes a
/// context-needing child builds a snapshot of its own fields and calls
/// [`EncodeContext::extend_with_parent`]; children therefore never mutate a
/// parent's snapshot. The compression dictionary is the one logically shared
/// piece and rides in an `Rc<RefCell<..>>`.
#[derive(Debug, Clone, Default)]
pub struct EncodeContext {
    /// Stack of parent snapshots; the last element is the immediate parent.
    parents: Vec<AHashMap<String, FieldValue>>,
    /// Positions recorded by array pre-passes, keyed `"array__TypeName"`.
    positions: AHashMap<String, Vec<usize>>,
    /// Current index per array being iterated.
    array_iterations: AHashMap<String, usize>,
    /// Occurrence counters keyed `"array__TypeName"`, bumped just before
    /// each matching item encodes.
    type_indices: AHashMap<String, usize>,
    /// Most recently entered array, for cross-array correlation.
    current_array: Option<String>,
    compression_dict: Option<CompressionDict>,
    /// Byte offset of this frame's stream relative to the message start.
    base_offset: usize,
    /// Set on measurement clones: lookups that depend on pre-pass or
    /// iteration state may fall back to placeholder values instead of
    /// failing, since only encoded sizes matter.
    measuring: bool,
}

impl EncodeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a child context with `parent` pushed as the immediate parent.
    /// Position tracking, iteration state, and the dictionary carry forward.
    pub fn extend_with_parent(&self, parent: AHashMap<String, FieldValue>) -> Self {
        let mut child = self.clone();
        child.parents.push(parent);
        child
    }

    /// Fetches a field from the snapshot `levels_up` frames above the
    /// current one (1 = immediate parent).
    pub fn parent_field(&self, levels_up: usize, name: &str) -> Option<&FieldValue> {
        if levels_up == 0 || levels_up > self.parents.len() {
            return None;
        }
        self.parents[self.parents.len() - levels_up].get(name)
    }

    /// Searches every frame, outermost first.
    pub fn find_parent_field(&self, name: &str) -> Option<&FieldValue> {
        self.parents.iter().find_map(|frame| frame.get(name))
    }

    pub fn has_parents(&self) -> bool {
        !self.parents.is_empty()
    }

    pub fn track_position(&mut self, key: &str, position: usize) {
        self.positions.entry(key.to_string()).or_default().push(position);
    }

    pub fn first_position(&self, key: &str) -> Option<usize> {
        self.positions.get(key).and_then(|v| v.first().copied())
    }

    pub fn last_position(&self, key: &str) -> Option<usize> {
        self.positions.get(key).and_then(|v| v.last().copied())
    }

    pub fn nth_position(&self, key: &str, n: usize) -> Option<usize> {
        self.positions.get(key).and_then(|v| v.get(n).copied())
    }

    pub fn set_array_iteration(&mut self, array: &str, index: usize) {
        self.array_iterations.insert(array.to_string(), index);
        self.current_array = Some(array.to_string());
    }

    pub fn array_iteration(&self, array: &str) -> Option<usize> {
        self.array_iterations.get(array).copied()
    }

    /// True only when `array` is the array currently being iterated, not
    /// merely one that was entered earlier.
    pub fn is_current_array(&self, array: &str) -> bool {
        self.current_array.as_deref() == Some(array)
    }

    /// The most recently entered array and its index, for cross-array
    /// correlation.
    pub fn current_iteration(&self) -> Option<(&str, usize)> {
        let current = self.current_array.as_deref()?;
        let index = self.array_iterations.get(current)?;
        Some((current, *index))
    }

    /// Bumps the occurrence counter for `key` and returns the new count.
    pub fn bump_type_index(&mut self, key: &str) -> usize {
        let counter = self.type_indices.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn type_index(&self, key: &str) -> usize {
        self.type_indices.get(key).copied().unwrap_or(0)
    }

    pub fn ensure_compression_dict(&mut self) {
        if self.compression_dict.is_none() {
            self.compression_dict = Some(Rc::new(RefCell::new(FxHashMap::default())));
        }
    }

    pub fn compression_dict(&self) -> Option<&CompressionDict> {
        self.compression_dict.as_ref()
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Returns a context whose frame starts `offset` bytes into the message.
    /// The dictionary handle is shared, everything else carries over.
    pub fn with_base_offset(&self, offset: usize) -> Self {
        let mut rebased = self.clone();
        rebased.base_offset = offset;
        rebased
    }

    /// Clone for measurement passes (array pre-passes, two-pass length
    /// prefixes). The dictionary, when present, is deep-copied so probes
    /// resolve the same way without committing entries to the real message.
    pub fn for_measurement(&self) -> Self {
        let mut copy = self.clone();
        copy.measuring = true;
        if let Some(dict) = &self.compression_dict {
            copy.compression_dict = Some(Rc::new(RefCell::new(dict.borrow().clone())));
        }
        copy
    }

    /// Whether this context belongs to a measurement pass.
    pub fn is_measuring(&self) -> bool {
        self.measuring
    }
}

/// Length-field values conveyed from parent frames to nested decoders.
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    fields: AHashMap<String, u64>,
}

impl DecodeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: u64) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.fields.get(name).copied()
    }

    /// Like [`DecodeContext::get`] but raises [`CodecError::MissingContext`],
    /// which is what generated `field_referenced` reads call.
    pub fn require(&self, name: &str) -> CodecResult<u64> {
        self.get(name)
            .ok_or_else(|| CodecError::MissingContext(name.to_string()))
    }
}
