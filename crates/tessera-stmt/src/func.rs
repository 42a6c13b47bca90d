//! Stored function registry and call contract used by functional indexes.

use crate::stmt::Stmt;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tessera_common::{Result, TesseraError};

/// Static description of a stored function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDef {
    pub fid: u32,
    pub name: String,
}

impl FuncDef {
    pub fn new(fid: u32, name: impl Into<String>) -> Self {
        Self {
            fid,
            name: name.into(),
        }
    }
}

/// Argument or result list of a function call.
#[derive(Debug, Clone)]
pub enum Port {
    /// Statements passed by reference.
    Tuples(Vec<Stmt>),
    /// One encoded MessagePack value.
    MsgPack(Bytes),
}

impl Port {
    /// Extracts the port contents as a single MessagePack buffer.
    ///
    /// A tuple list is encoded as an array of the tuples' payloads.
    pub fn get_msgpack(&self) -> Result<Bytes> {
        match self {
            Port::MsgPack(buf) => Ok(buf.clone()),
            Port::Tuples(stmts) => {
                let mut buf = Vec::new();
                rmp::encode::write_array_len(&mut buf, stmts.len() as u32)?;
                for stmt in stmts {
                    buf.extend_from_slice(stmt.view().upsert_data());
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// A callable stored function.
pub trait Func: Send + Sync {
    fn def(&self) -> &FuncDef;

    /// Invokes the function. Errors carry the function's own diagnostic.
    fn call(&self, args: &Port) -> Result<Port>;
}

/// Function implemented by a Rust closure.
pub struct NativeFunc<F> {
    def: FuncDef,
    body: F,
}

impl<F> NativeFunc<F>
where
    F: Fn(&Port) -> Result<Port> + Send + Sync,
{
    pub fn new(def: FuncDef, body: F) -> Self {
        Self { def, body }
    }
}

impl<F> Func for NativeFunc<F>
where
    F: Fn(&Port) -> Result<Port> + Send + Sync,
{
    fn def(&self) -> &FuncDef {
        &self.def
    }

    fn call(&self, args: &Port) -> Result<Port> {
        (self.body)(args)
    }
}

impl<F> fmt::Debug for NativeFunc<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunc").field("def", &self.def).finish()
    }
}

#[derive(Default)]
struct FuncCacheInner {
    by_id: HashMap<u32, Arc<dyn Func>>,
    by_name: HashMap<String, Arc<dyn Func>>,
}

/// Registry of stored functions, looked up by id or by name.
#[derive(Default)]
pub struct FuncCache {
    inner: RwLock<FuncCacheInner>,
}

impl FuncCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func`; its id and name must both be unused.
    pub fn insert(&self, func: Arc<dyn Func>) -> Result<()> {
        let mut inner = self.inner.write();
        let def = func.def();
        if inner.by_id.contains_key(&def.fid) || inner.by_name.contains_key(&def.name) {
            return Err(TesseraError::FunctionExists(def.name.clone()));
        }
        let (fid, name) = (def.fid, def.name.clone());
        inner.by_id.insert(fid, func.clone());
        inner.by_name.insert(name, func);
        Ok(())
    }

    /// Removes the function with `fid`, returning it.
    pub fn delete(&self, fid: u32) -> Option<Arc<dyn Func>> {
        let mut inner = self.inner.write();
        let func = inner.by_id.remove(&fid)?;
        inner.by_name.remove(&func.def().name);
        Some(func)
    }

    pub fn by_id(&self, fid: u32) -> Option<Arc<dyn Func>> {
        self.inner.read().by_id.get(&fid).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Func>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FuncCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncCache").field("len", &self.len()).finish()
    }
}
