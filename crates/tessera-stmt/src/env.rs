//! Statement environment: allocator capability, format registry, key format.

use crate::cord::{ExecContext, MainCord};
use crate::field_map;
use crate::format::{FormatLayout, FormatRegistry, TupleFormat};
use crate::func::FuncCache;
use crate::functional::FunctionalKeyCache;
use crate::key_def::KeyDef;
use crate::lsregion::LsRegion;
use crate::msgpack;
use crate::stmt::{Stmt, StmtHeader};
use std::fmt;
use std::sync::Arc;
use tessera_common::{Result, StmtEnvConfig, StmtType, TesseraError};
use tracing::{debug, error};

/// Allocation strategy of one storage engine.
///
/// Extra hooks manage auxiliary blocks (functional key caches) keyed by
/// function id. An engine without extra support keeps the defaults, which
/// attach nothing and find nothing.
pub trait TupleVtab: Send + Sync {
    /// Allocates a zeroed statement buffer of `size` bytes.
    fn construct(&self, format: &TupleFormat, size: usize) -> Result<Box<[u8]>>;

    /// Called once when a heap statement is destroyed.
    fn destroy(&self, format: &TupleFormat, header: &StmtHeader);

    /// Attaches `extra` under `fid`, returning the entry it replaced.
    fn extra_attach(
        &self,
        _stmt: &Stmt,
        _fid: u32,
        _extra: Arc<FunctionalKeyCache>,
    ) -> Option<Arc<FunctionalKeyCache>> {
        None
    }

    /// Detaches the entry under `fid`.
    fn extra_detach(&self, _stmt: &Stmt, _fid: u32) -> Option<Arc<FunctionalKeyCache>> {
        None
    }

    fn extra_lookup(&self, _stmt: &Stmt, _fid: u32) -> Option<Arc<FunctionalKeyCache>> {
        None
    }
}

/// Heap allocator with a size cap and optional functional key caching.
#[derive(Debug, Clone)]
pub struct HeapVtab {
    max_tuple_size: usize,
    extras: bool,
}

impl HeapVtab {
    pub fn new(max_tuple_size: usize, extras: bool) -> Self {
        Self {
            max_tuple_size,
            extras,
        }
    }
}

impl TupleVtab for HeapVtab {
    fn construct(&self, format: &TupleFormat, size: usize) -> Result<Box<[u8]>> {
        if size > self.max_tuple_size {
            error!(
                size,
                max = self.max_tuple_size,
                format_id = format.id(),
                "statement exceeds max_tuple_size"
            );
            return Err(TesseraError::MaxTupleSize {
                size,
                max: self.max_tuple_size,
            });
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| TesseraError::OutOfMemory {
                size,
                allocator: "malloc",
                object: "struct stmt",
            })?;
        buf.resize(size, 0);
        Ok(buf.into_boxed_slice())
    }

    fn destroy(&self, format: &TupleFormat, header: &StmtHeader) {
        debug!(
            format_id = format.id(),
            size = header.size(),
            lsn = header.lsn,
            "stmt destroyed"
        );
    }

    fn extra_attach(
        &self,
        stmt: &Stmt,
        fid: u32,
        extra: Arc<FunctionalKeyCache>,
    ) -> Option<Arc<FunctionalKeyCache>> {
        if !self.extras {
            return None;
        }
        let mut extras = stmt.extras().lock();
        match extras.iter_mut().find(|(id, _)| *id == fid) {
            Some((_, slot)) => Some(std::mem::replace(slot, extra)),
            None => {
                extras.push((fid, extra));
                None
            }
        }
    }

    fn extra_detach(&self, stmt: &Stmt, fid: u32) -> Option<Arc<FunctionalKeyCache>> {
        let mut extras = stmt.extras().lock();
        let pos = extras.iter().position(|(id, _)| *id == fid)?;
        Some(extras.remove(pos).1)
    }

    fn extra_lookup(&self, stmt: &Stmt, fid: u32) -> Option<Arc<FunctionalKeyCache>> {
        let extras = stmt.extras().lock();
        extras
            .iter()
            .find(|(id, _)| *id == fid)
            .map(|(_, extra)| extra.clone())
    }
}

/// Engine-wide statement context.
pub struct StmtEnv {
    config: StmtEnvConfig,
    vtab: Arc<dyn TupleVtab>,
    registry: Arc<FormatRegistry>,
    funcs: Arc<FuncCache>,
    key_format: Arc<TupleFormat>,
}

impl StmtEnv {
    /// Creates an environment backed by [`HeapVtab`].
    pub fn new(config: StmtEnvConfig, funcs: Arc<FuncCache>, main: &MainCord) -> Result<Self> {
        let vtab = Arc::new(HeapVtab::new(
            config.max_tuple_size,
            config.functional_key_cache,
        ));
        Self::with_vtab(config, vtab, funcs, main)
    }

    /// Creates an environment with a custom allocation strategy.
    pub fn with_vtab(
        config: StmtEnvConfig,
        vtab: Arc<dyn TupleVtab>,
        funcs: Arc<FuncCache>,
        main: &MainCord,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(FormatRegistry::new());
        let key_format = registry.register(|id| {
            TupleFormat::new(
                id,
                FormatLayout::empty(),
                true,
                vtab.clone(),
                funcs.clone(),
                main,
            )
        })?;
        key_format.retain(main);
        debug!(
            max_tuple_size = config.max_tuple_size,
            key_format_id = key_format.id(),
            "stmt env created"
        );
        Ok(Self {
            config,
            vtab,
            registry,
            funcs,
            key_format,
        })
    }

    pub fn config(&self) -> &StmtEnvConfig {
        &self.config
    }

    pub fn vtab(&self) -> &Arc<dyn TupleVtab> {
        &self.vtab
    }

    pub fn registry(&self) -> &Arc<FormatRegistry> {
        &self.registry
    }

    pub fn funcs(&self) -> &Arc<FuncCache> {
        &self.funcs
    }

    /// Format of bare keys: no field map.
    pub fn key_format(&self) -> &Arc<TupleFormat> {
        &self.key_format
    }

    /// Builds a format for statements indexed by `keys`.
    ///
    /// Functional key definitions become functional handles; their
    /// functions are bound now if already registered, otherwise on first use.
    pub fn format_new(&self, main: &MainCord, keys: &[Arc<KeyDef>]) -> Result<Arc<TupleFormat>> {
        let layout = FormatLayout::from_key_defs(keys)?;
        let format = self.registry.register(|id| {
            TupleFormat::new(
                id,
                layout,
                false,
                self.vtab.clone(),
                self.funcs.clone(),
                main,
            )
        })?;
        for handle in format.functional_handles() {
            if handle.resolve(&self.funcs).is_err() {
                debug!(fid = handle.fid(), "functional index function not bound yet");
            }
        }
        debug!(
            format_id = format.id(),
            field_map_size = format.field_map_size(),
            functional = format.functional_handles().len(),
            "format created"
        );
        Ok(format)
    }

    /// Validates `data` against `format` and builds an INSERT statement.
    pub fn tuple_new(&self, ctx: &mut ExecContext<'_>, format: &Arc<TupleFormat>, data: &[u8]) -> Result<Stmt> {
        msgpack::check_array(data)?;
        let builder = field_map::field_map_create(format, data, true)?;
        Stmt::build(ctx.cord(), format, &builder, data, &[], StmtType::Insert)
    }

    /// Creates a generational region sized by the configuration.
    pub fn lsregion(&self) -> LsRegion {
        LsRegion::new(self.config.region_generation_size)
    }

    /// Drops the environment's reference to the key format.
    pub fn destroy(self, main: &MainCord) {
        self.key_format.release(main);
    }
}

impl fmt::Debug for StmtEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StmtEnv")
            .field("config", &self.config)
            .field("formats", &self.registry.len())
            .field("key_format", &self.key_format.id())
            .finish()
    }
}
