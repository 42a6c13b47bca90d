//! Tuple formats: the field tree derived from key definitions, field map
//! slot assignment, functional index handles and the format registry.

use crate::cord::MainCord;
use crate::env::TupleVtab;
use crate::func::{Func, FuncCache};
use crate::key_def::{FieldType, KeyDef, KeyPart, PathToken};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use tessera_common::{Result, TesseraError, STMT_HEADER_SIZE};
use tracing::debug;

/// Node of the format's field tree.
#[derive(Debug, Clone)]
pub struct TupleField {
    token: PathToken,
    field_type: FieldType,
    is_nullable: bool,
    is_key_part: bool,
    offset_slot: Option<u32>,
    children: Vec<TupleField>,
}

impl TupleField {
    fn new(token: PathToken) -> Self {
        Self {
            token,
            field_type: FieldType::Any,
            is_nullable: true,
            is_key_part: false,
            offset_slot: None,
            children: Vec::new(),
        }
    }

    pub fn token(&self) -> &PathToken {
        &self.token
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }

    pub fn is_key_part(&self) -> bool {
        self.is_key_part
    }

    /// Field map slot recording this field's offset, if any.
    pub fn offset_slot(&self) -> Option<u32> {
        self.offset_slot
    }

    pub fn children(&self) -> &[TupleField] {
        &self.children
    }

    /// Child matching `token` exactly.
    pub fn child(&self, token: &PathToken) -> Option<&TupleField> {
        self.children.iter().find(|c| c.token == *token)
    }

    /// Child describing array element `index`: a numbered child or `[*]`.
    pub fn child_for_index(&self, index: u32) -> Option<&TupleField> {
        self.children.iter().find(|c| match c.token {
            PathToken::Num(n) => n == index,
            PathToken::Any => true,
            PathToken::Str(_) => false,
        })
    }

    /// Child describing map entry `key`.
    pub fn child_for_key(&self, key: &str) -> Option<&TupleField> {
        self.children
            .iter()
            .find(|c| matches!(&c.token, PathToken::Str(s) if s == key))
    }

    /// True if the children describe every element of an array (`[*]`).
    pub fn is_multikey_array(&self) -> bool {
        self.children.iter().any(|c| c.token == PathToken::Any)
    }

    /// Number of leading array elements that have a child description.
    pub fn indexed_element_count(&self) -> u32 {
        self.children
            .iter()
            .filter_map(|c| match c.token {
                PathToken::Num(n) => Some(n + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn child_mut_or_insert(&mut self, token: &PathToken) -> Result<&mut TupleField> {
        let container = match token {
            PathToken::Num(_) | PathToken::Any => FieldType::Array,
            PathToken::Str(_) => FieldType::Map,
        };
        if self.field_type != FieldType::Any && self.field_type != container {
            return Err(TesseraError::InvalidKeyDef(format!(
                "field is declared {} but a path expects {}",
                self.field_type, container
            )));
        }
        self.field_type = container;
        let pos = match self.children.iter().position(|c| c.token == *token) {
            Some(pos) => pos,
            None => {
                self.children.push(TupleField::new(token.clone()));
                self.children.len() - 1
            }
        };
        Ok(&mut self.children[pos])
    }

    fn mark_key_part(&mut self, part: &KeyPart) -> Result<()> {
        if !self.children.is_empty() && !matches!(part.field_type, FieldType::Any | FieldType::Array | FieldType::Map) {
            return Err(TesseraError::InvalidKeyDef(format!(
                "field with nested indexed fields cannot be of type {}",
                part.field_type
            )));
        }
        if self.field_type == FieldType::Any {
            self.field_type = part.field_type;
        } else if part.field_type != FieldType::Any && part.field_type != self.field_type {
            return Err(TesseraError::InvalidKeyDef(format!(
                "conflicting field types {} and {}",
                self.field_type, part.field_type
            )));
        }
        self.is_nullable = if self.is_key_part {
            self.is_nullable && part.is_nullable
        } else {
            part.is_nullable
        };
        self.is_key_part = true;
        Ok(())
    }

    fn assign_slots(&mut self, is_first_field: bool, under_any: bool, next: &mut u32) {
        let wants_slot = self.is_key_part || self.is_multikey_array();
        if wants_slot && !under_any && !is_first_field {
            self.offset_slot = Some(*next);
            *next += 1;
        }
        for child in &mut self.children {
            let below_any = under_any || child.token == PathToken::Any;
            child.assign_slots(false, below_any, next);
        }
    }
}

/// Handle of one functional index attached to a format.
pub struct FunctionalHandle {
    fid: u32,
    key_def: Arc<KeyDef>,
    func: OnceLock<Arc<dyn Func>>,
}

impl FunctionalHandle {
    fn new(fid: u32, key_def: Arc<KeyDef>) -> Self {
        Self {
            fid,
            key_def,
            func: OnceLock::new(),
        }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn key_def(&self) -> &Arc<KeyDef> {
        &self.key_def
    }

    pub fn is_resolved(&self) -> bool {
        self.func.get().is_some()
    }

    /// Returns the extractor, looking it up and retaining it on first use.
    pub fn resolve(&self, funcs: &FuncCache) -> Result<Arc<dyn Func>> {
        if let Some(func) = self.func.get() {
            return Ok(func.clone());
        }
        let func = funcs
            .by_id(self.fid)
            .ok_or_else(|| TesseraError::NoSuchFunction(self.fid.to_string()))?;
        Ok(self.func.get_or_init(|| func).clone())
    }
}

impl fmt::Debug for FunctionalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionalHandle")
            .field("fid", &self.fid)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Field tree and counters derived from a set of key definitions.
pub(crate) struct FormatLayout {
    fields: Vec<TupleField>,
    slot_count: u32,
    index_field_count: u32,
    min_field_count: u32,
    functional: Vec<FunctionalHandle>,
}

impl FormatLayout {
    pub(crate) fn from_key_defs(keys: &[Arc<KeyDef>]) -> Result<Self> {
        let mut fields: Vec<TupleField> = Vec::new();
        let mut min_field_count = 0;
        let mut functional = Vec::new();

        for key_def in keys {
            if let Some(fid) = key_def.func_id() {
                functional.push(FunctionalHandle::new(fid, key_def.clone()));
                continue;
            }
            for part in key_def.parts() {
                while fields.len() <= part.fieldno as usize {
                    fields.push(TupleField::new(PathToken::Num(fields.len() as u32)));
                }
                let mut field = &mut fields[part.fieldno as usize];
                if let Some(path) = &part.path {
                    for token in path.tokens() {
                        field = field.child_mut_or_insert(token)?;
                    }
                }
                field.mark_key_part(part)?;
                if !part.is_nullable {
                    min_field_count = min_field_count.max(part.fieldno + 1);
                }
            }
        }

        let mut slot_count = 0;
        for (i, field) in fields.iter_mut().enumerate() {
            field.assign_slots(i == 0, false, &mut slot_count);
        }
        if STMT_HEADER_SIZE + slot_count as usize * 4 > u16::MAX as usize {
            return Err(TesseraError::InvalidKeyDef(format!(
                "too many indexed fields: {}",
                slot_count
            )));
        }

        Ok(Self {
            index_field_count: fields.len() as u32,
            fields,
            slot_count,
            min_field_count,
            functional,
        })
    }

    pub(crate) fn empty() -> Self {
        Self {
            fields: Vec::new(),
            slot_count: 0,
            index_field_count: 0,
            min_field_count: 0,
            functional: Vec::new(),
        }
    }
}

/// Shared description of how statements of one kind are laid out.
///
/// The format reference count is only mutated through a [`MainCord`]:
/// statements built on the main thread pin their format, worker-built
/// statements never touch it. A pinned statement dropped on a worker hands
/// its release back through a counter drained by [`TupleFormat::reclaim`].
pub struct TupleFormat {
    id: u16,
    fields: Vec<TupleField>,
    slot_count: u32,
    index_field_count: u32,
    min_field_count: u32,
    is_key: bool,
    functional: Vec<FunctionalHandle>,
    vtab: Arc<dyn TupleVtab>,
    funcs: Arc<FuncCache>,
    main_thread: ThreadId,
    refs: AtomicU32,
    deferred_releases: AtomicU32,
}

impl TupleFormat {
    pub(crate) fn new(
        id: u16,
        layout: FormatLayout,
        is_key: bool,
        vtab: Arc<dyn TupleVtab>,
        funcs: Arc<FuncCache>,
        main: &MainCord,
    ) -> Self {
        Self {
            id,
            fields: layout.fields,
            slot_count: layout.slot_count,
            index_field_count: layout.index_field_count,
            min_field_count: layout.min_field_count,
            is_key,
            functional: layout.functional,
            vtab,
            funcs,
            main_thread: main.thread(),
            refs: AtomicU32::new(0),
            deferred_releases: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Top-level fields described by the format.
    pub fn fields(&self) -> &[TupleField] {
        &self.fields
    }

    pub fn field(&self, fieldno: u32) -> Option<&TupleField> {
        self.fields.get(fieldno as usize)
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Size of the field map of every statement in this format.
    pub fn field_map_size(&self) -> u32 {
        self.slot_count * 4
    }

    /// Number of leading top-level fields that any index covers.
    pub fn index_field_count(&self) -> u32 {
        self.index_field_count
    }

    pub fn min_field_count(&self) -> u32 {
        self.min_field_count
    }

    /// True for the format of bare keys.
    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn functional_handles(&self) -> &[FunctionalHandle] {
        &self.functional
    }

    pub fn functional_handle(&self, fid: u32) -> Option<&FunctionalHandle> {
        self.functional.iter().find(|h| h.fid == fid)
    }

    pub fn vtab(&self) -> &Arc<dyn TupleVtab> {
        &self.vtab
    }

    pub fn funcs(&self) -> &Arc<FuncCache> {
        &self.funcs
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    /// Finds the deepest node along `fieldno` + `path` owning a slot.
    ///
    /// Returns the slot and the number of path tokens consumed to reach it.
    pub(crate) fn deepest_slot(&self, fieldno: u32, path: &[PathToken]) -> Option<(u32, usize)> {
        let mut field = self.field(fieldno)?;
        let mut found = field.offset_slot.map(|slot| (slot, 0));
        for (depth, token) in path.iter().enumerate() {
            field = match field.child(token) {
                Some(child) => child,
                None => break,
            };
            if let Some(slot) = field.offset_slot {
                found = Some((slot, depth + 1));
            }
        }
        found
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Releases queued by workers and not yet drained.
    pub fn pending_releases(&self) -> u32 {
        self.deferred_releases.load(Ordering::Acquire)
    }

    fn check_cord(&self, cord: &MainCord) {
        assert_eq!(
            cord.thread(),
            self.main_thread,
            "format {} belongs to another main thread",
            self.id
        );
    }

    /// Takes a reference.
    pub fn retain(&self, cord: &MainCord) {
        self.check_cord(cord);
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference taken with [`TupleFormat::retain`].
    pub fn release(&self, cord: &MainCord) {
        self.check_cord(cord);
        self.release_owned();
    }

    /// Applies releases handed over by worker threads.
    pub fn reclaim(&self, cord: &MainCord) -> u32 {
        self.check_cord(cord);
        let pending = self.deferred_releases.swap(0, Ordering::AcqRel);
        for _ in 0..pending {
            self.release_owned();
        }
        pending
    }

    /// Release path for statements dropped without a token at hand.
    pub(crate) fn release_from_drop(&self) {
        if thread::current().id() == self.main_thread {
            self.release_owned();
        } else {
            let pending = self.deferred_releases.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(format_id = self.id, pending, "format release deferred to main thread");
        }
    }

    fn release_owned(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "format {} released more times than retained", self.id);
        if prev == 1 {
            debug!(format_id = self.id, "format unpinned");
        }
    }
}

impl Drop for TupleFormat {
    fn drop(&mut self) {
        debug!(format_id = self.id, "format dropped");
    }
}

impl fmt::Debug for TupleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleFormat")
            .field("id", &self.id)
            .field("is_key", &self.is_key)
            .field("field_map_size", &self.field_map_size())
            .field("index_field_count", &self.index_field_count)
            .field("functional", &self.functional)
            .field("refs", &self.refs())
            .finish()
    }
}

/// Id-indexed registry of live formats.
///
/// Entries are weak: an id stays bound to its format for as long as any
/// handle to that format exists, and becomes reusable once the last one
/// is dropped.
#[derive(Debug, Default)]
pub struct FormatRegistry {
    formats: RwLock<Vec<Weak<TupleFormat>>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the format produced by `build` under a fresh or reused id.
    pub(crate) fn register(
        &self,
        build: impl FnOnce(u16) -> TupleFormat,
    ) -> Result<Arc<TupleFormat>> {
        let mut formats = self.formats.write();
        let slot = formats.iter().position(|w| w.strong_count() == 0);
        let id = match slot {
            Some(id) => id,
            None if formats.len() <= u16::MAX as usize => {
                formats.push(Weak::new());
                formats.len() - 1
            }
            None => {
                return Err(TesseraError::Internal(
                    "format registry is full".to_string(),
                ))
            }
        };
        let format = Arc::new(build(id as u16));
        formats[id] = Arc::downgrade(&format);
        debug!(format_id = id, "format registered");
        Ok(format)
    }

    /// Returns the live format with `id`.
    pub fn get(&self, id: u16) -> Option<Arc<TupleFormat>> {
        self.formats.read().get(id as usize)?.upgrade()
    }

    /// Number of registered formats.
    pub fn len(&self) -> usize {
        self.formats
            .read()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(keys: Vec<KeyDef>) -> Result<FormatLayout> {
        let keys: Vec<Arc<KeyDef>> = keys.into_iter().map(Arc::new).collect();
        FormatLayout::from_key_defs(&keys)
    }

    #[test]
    fn test_plain_fields_get_slots_except_first() {
        let pk = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).unwrap();
        let sk = KeyDef::new(vec![KeyPart::new(2, FieldType::String)]).unwrap();
        let layout = layout(vec![pk, sk]).unwrap();

        assert_eq!(layout.index_field_count, 3);
        assert_eq!(layout.min_field_count, 3);
        assert_eq!(layout.slot_count, 1);
        assert_eq!(layout.fields[0].offset_slot(), None);
        assert_eq!(layout.fields[1].offset_slot(), None);
        assert!(!layout.fields[1].is_key_part());
        assert_eq!(layout.fields[2].offset_slot(), Some(0));
    }

    #[test]
    fn test_nested_path_builds_tree() {
        let part = KeyPart::new(1, FieldType::String)
            .with_path(".name.first")
            .unwrap();
        let layout = layout(vec![KeyDef::new(vec![part]).unwrap()]).unwrap();

        let top = &layout.fields[1];
        assert_eq!(top.field_type(), FieldType::Map);
        assert_eq!(top.offset_slot(), None);
        let name = top.child_for_key("name").unwrap();
        let first = name.child_for_key("first").unwrap();
        assert!(first.is_key_part());
        assert_eq!(first.offset_slot(), Some(0));
        assert_eq!(layout.slot_count, 1);
    }

    #[test]
    fn test_multikey_slot_on_array() {
        let part = KeyPart::new(1, FieldType::Unsigned)
            .with_path("[*].id")
            .unwrap();
        let layout = layout(vec![KeyDef::new(vec![part]).unwrap()]).unwrap();

        let array = &layout.fields[1];
        assert!(array.is_multikey_array());
        assert_eq!(array.offset_slot(), Some(0));
        let leaf = array.child_for_index(5).unwrap().child_for_key("id").unwrap();
        assert_eq!(leaf.offset_slot(), None);
        assert_eq!(layout.slot_count, 1);
    }

    #[test]
    fn test_conflicting_container_types_rejected() {
        let a = KeyPart::new(1, FieldType::Unsigned).with_path("[1]").unwrap();
        let b = KeyPart::new(1, FieldType::Unsigned).with_path(".x").unwrap();
        let keys = vec![
            KeyDef::new(vec![a]).unwrap(),
            KeyDef::new(vec![b]).unwrap(),
        ];
        assert!(layout(keys).is_err());
    }

    #[test]
    fn test_nullable_parts_do_not_raise_min_field_count() {
        let pk = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).unwrap();
        let sk = KeyDef::new(vec![KeyPart::new(4, FieldType::String).nullable()]).unwrap();
        let layout = layout(vec![pk, sk]).unwrap();
        assert_eq!(layout.min_field_count, 1);
        assert_eq!(layout.index_field_count, 5);
    }

    #[test]
    fn test_functional_defs_become_handles() {
        let pk = KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]).unwrap();
        let fk = KeyDef::functional(42, vec![KeyPart::new(0, FieldType::String)], false).unwrap();
        let layout = layout(vec![pk, fk]).unwrap();
        assert_eq!(layout.functional.len(), 1);
        assert_eq!(layout.functional[0].fid(), 42);
        assert!(!layout.functional[0].is_resolved());
        assert_eq!(layout.index_field_count, 1);
    }
}
