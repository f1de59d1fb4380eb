//! Blockwise caching operator.
//!
//! [`BlockwiseCache`] sits between a producer and its consumers and keeps the
//! producer's output as a grid of tiles. A read is served by:
//!
//! 1. classifying every tile the ROI touches as clean, in flight or dirty;
//! 2. starting one upstream fetch per dirty tile;
//! 3. waiting on every in-flight tile (its own fetches and other readers');
//! 4. repeating until all tiles are clean, then assembling the result.
//!
//! Invalidation is lazy. A dirty notification bumps a generation counter and
//! a tile is clean exactly when its stamp equals the current generation.
//!
//! A cache can be fixed (see [`Graph::set_fixed`](crate::graph::Graph::set_fixed)).
//! While fixed it serves whatever tiles it holds, stale or not, answers
//! never-filled tiles with zeros and never fetches. Dirty regions seen in
//! the meantime are collected and released as one region when thawed.

use crate::config::EngineConfig;
use crate::core::context::{DirtyContext, ExecutionContext, SetupContext};
use crate::core::error::{ExecutionError, ExecutionResult, GraphResult};
use crate::core::operator::{Operator, OperatorMetadata};
use crate::core::roi::{block_bounds, determine_block_shape, intersecting_blocks, Roi};
use crate::core::slot::SlotDefinition;
use crate::core::types::{ArrayBuffer, ArrayMeta};
use crate::execution::eviction::{EvictionPolicy, LruEviction};
use crate::execution::request::{Event, RequestHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a fresh eviction policy for each cache instance.
pub type EvictionFactory = Arc<dyn Fn() -> Box<dyn EvictionPolicy> + Send + Sync>;

// ============================================================================
// Options
// ============================================================================

/// How a dirty region invalidates cached tiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Every dirty notification invalidates every tile.
    #[default]
    Generation,
    /// Only tiles intersecting the dirty region are invalidated.
    Regional,
}

/// Cache configuration.
#[derive(Clone)]
pub struct CacheOptions {
    /// Explicit tile shape; derived from `target_block_volume` when absent.
    pub block_shape: Option<Vec<usize>>,
    /// Tile volume, in elements, used to derive a tile shape.
    pub target_block_volume: usize,
    /// Which tiles a dirty notification invalidates.
    pub invalidation: InvalidationMode,
    /// Resident byte budget; unlimited when absent.
    pub memory_limit: Option<usize>,
    /// Builds the policy choosing which tiles to drop over budget.
    pub eviction: EvictionFactory,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            block_shape: None,
            target_block_volume: 1_000_000,
            invalidation: InvalidationMode::Generation,
            memory_limit: None,
            eviction: Arc::new(|| Box::new(LruEviction::new())),
        }
    }
}

impl CacheOptions {
    /// Options taking their tile volume and memory limit from `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            target_block_volume: config.default_block_volume,
            memory_limit: config.cache_memory_limit,
            ..Self::default()
        }
    }

    /// Use tiles of `block_shape`, clamped to the array at setup.
    ///
    /// Setup fails if the rank differs from the input or an extent is zero.
    pub fn with_block_shape(mut self, block_shape: impl Into<Vec<usize>>) -> Self {
        self.block_shape = Some(block_shape.into());
        self
    }

    /// Derive tiles of about `volume` elements; ignored with an explicit
    /// block shape.
    pub fn with_target_block_volume(mut self, volume: usize) -> Self {
        self.target_block_volume = volume.max(1);
        self
    }

    /// Choose between invalidating every tile or only the dirty ones.
    pub fn with_invalidation(mut self, mode: InvalidationMode) -> Self {
        self.invalidation = mode;
        self
    }

    /// Cap the bytes held by tiles; `None` lifts the cap.
    ///
    /// The cap is soft: tiles being fetched or read are never dropped.
    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Use a custom eviction policy.
    pub fn with_eviction<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn EvictionPolicy> + Send + Sync + 'static,
    {
        self.eviction = Arc::new(factory);
        self
    }

    /// Tile shape for an array of `shape`.
    ///
    /// Explicit shapes are clamped to the array; axes of extent zero get
    /// tiles of extent one.
    fn block_shape_for(&self, shape: &[usize]) -> Result<Vec<usize>, String> {
        match &self.block_shape {
            Some(block_shape) => {
                if block_shape.len() != shape.len() {
                    return Err(format!(
                        "block shape {:?} does not match array rank {}",
                        block_shape,
                        shape.len()
                    ));
                }
                if block_shape.contains(&0) {
                    return Err(format!("block shape {:?} has a zero extent", block_shape));
                }
                Ok(block_shape
                    .iter()
                    .zip(shape)
                    .map(|(&b, &s)| b.min(s.max(1)))
                    .collect())
            }
            None => {
                let limits: Vec<usize> = shape.iter().map(|&s| s.max(1)).collect();
                determine_block_shape(&limits, self.target_block_volume).map_err(|e| e.to_string())
            }
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("block_shape", &self.block_shape)
            .field("target_block_volume", &self.target_block_volume)
            .field("invalidation", &self.invalidation)
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// State
// ============================================================================

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Tiles served without waiting on a fetch.
    pub hits: u64,
    /// Upstream fetches started.
    pub fetches: u64,
    /// Upstream fetches that failed.
    pub failures: u64,
    /// Tiles dropped to stay under the memory limit.
    pub evictions: u64,
    /// Bytes currently held by tiles.
    pub resident_bytes: usize,
}

impl CacheStats {
    /// Fraction of tile lookups served from cache.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.fetches;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Default)]
struct Tile {
    /// Generation the data is valid for; 0 means never filled.
    stamp: u64,
    /// Stamp the in-flight fetch will apply.
    pending: Option<u64>,
    /// Identifies the fetch allowed to fill this tile.
    ticket: u64,
    data: Option<Arc<ArrayBuffer>>,
    in_flight: Option<Event>,
}

impl Tile {
    fn clean_data(&self, generation: u64) -> Option<&Arc<ArrayBuffer>> {
        if self.stamp == generation {
            self.data.as_ref()
        } else {
            None
        }
    }
}

struct CacheState {
    meta: Option<ArrayMeta>,
    block_shape: Vec<usize>,
    generation: u64,
    next_ticket: u64,
    tiles: HashMap<Vec<usize>, Tile>,
    stats: CacheStats,
    policy: Box<dyn EvictionPolicy>,
    fixed: bool,
    /// Tile-aligned hull of what changed while fixed.
    held_dirty: Option<Roi>,
}

impl CacheState {
    fn new(policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            meta: None,
            block_shape: Vec::new(),
            generation: 1,
            next_ticket: 0,
            tiles: HashMap::new(),
            stats: CacheStats::default(),
            policy,
            fixed: false,
            held_dirty: None,
        }
    }

    /// Record `roi`, widened to tile boundaries, for release once thawed.
    ///
    /// `None` or a region of the wrong rank holds the whole array.
    fn hold_dirty(&mut self, roi: Option<&Roi>) {
        let Some(meta) = &self.meta else {
            return;
        };
        let whole = Roi::from_shape(&meta.shape);
        let aligned = roi
            .and_then(|roi| roi.block_range(&self.block_shape).ok())
            .and_then(|range| {
                let scale = |grid: &[usize]| -> Vec<usize> {
                    grid.iter().zip(&self.block_shape).map(|(i, b)| i * b).collect()
                };
                Roi::new(scale(range.start()), scale(range.stop())).ok()
            })
            .map(|roi| roi.clipped_to(&meta.shape))
            .unwrap_or_else(|| whole.clone());
        self.held_dirty = Some(match self.held_dirty.take() {
            Some(held) => held.hull(&aligned).unwrap_or(whole),
            None => aligned,
        });
    }

    /// Drop least valuable tiles until under `limit`.
    ///
    /// In-flight tiles, tiles a reader still holds and `keep` are skipped.
    fn enforce_limit(&mut self, limit: Option<usize>, keep: Option<&[usize]>) {
        let Some(limit) = limit else {
            return;
        };
        if self.stats.resident_bytes <= limit {
            return;
        }

        let mut evicted = 0u64;
        let mut freed = 0usize;
        for victim in self.policy.victims() {
            if self.stats.resident_bytes <= limit {
                break;
            }
            if keep == Some(victim.as_slice()) {
                continue;
            }
            let Some(tile) = self.tiles.get_mut(&victim) else {
                self.policy.forget(&victim);
                continue;
            };
            if tile.in_flight.is_some() {
                continue;
            }
            if tile.data.as_ref().is_some_and(|data| Arc::strong_count(data) > 1) {
                continue;
            }
            if let Some(data) = tile.data.take() {
                tile.stamp = 0;
                let nbytes = data.nbytes();
                self.stats.resident_bytes = self.stats.resident_bytes.saturating_sub(nbytes);
                freed += nbytes;
                evicted += 1;
            }
            self.policy.forget(&victim);
        }

        if evicted > 0 {
            self.stats.evictions += evicted;
            log::debug!(
                "evicted {} tiles ({} bytes), {} bytes resident",
                evicted,
                freed,
                self.stats.resident_bytes
            );
        }
        if self.stats.resident_bytes > limit {
            log::warn!(
                "cache holds {} bytes over its {} byte limit; remaining tiles are in use",
                self.stats.resident_bytes - limit,
                limit
            );
        }
    }
}

/// Fetch one tile from upstream and store it.
async fn fetch_tile(
    state: Arc<Mutex<CacheState>>,
    index: Vec<usize>,
    ticket: u64,
    request: RequestHandle<ArrayBuffer>,
    memory_limit: Option<usize>,
) -> ExecutionResult<()> {
    let outcome = request.await;

    let mut guard = state.lock();
    let state = &mut *guard;
    let Some(tile) = state.tiles.get_mut(&index) else {
        // reset by setup while fetching
        return outcome.map(drop);
    };
    if tile.ticket != ticket {
        return outcome.map(drop);
    }
    tile.in_flight = None;
    let stamp = tile.pending.take();

    match outcome {
        Ok(buffer) => {
            let nbytes = buffer.nbytes();
            if let Some(old) = tile.data.replace(Arc::new(buffer)) {
                state.stats.resident_bytes = state.stats.resident_bytes.saturating_sub(old.nbytes());
            }
            tile.stamp = stamp.unwrap_or(0);
            state.stats.resident_bytes += nbytes;
            state.policy.touch(&index, nbytes);
            state.enforce_limit(memory_limit, Some(&index));
            Ok(())
        }
        Err(err) => {
            state.stats.failures += 1;
            if err.is_transient() {
                log::warn!("fetching tile {:?} failed, next read retries: {}", index, err);
            } else {
                log::error!("fetching tile {:?} failed: {}", index, err);
            }
            Err(err)
        }
    }
}

// ============================================================================
// Operator
// ============================================================================

/// Caches its input blockwise and serves reads from the cached tiles.
///
/// Concurrent readers of the same tile share one upstream fetch. A failed
/// fetch is reported to every reader waiting on it and retried by the next
/// read.
///
/// Tiles can also be filled directly with [`BlockwiseCache::store_block`].
pub struct BlockwiseCache {
    options: CacheOptions,
    state: Arc<Mutex<CacheState>>,
}

impl BlockwiseCache {
    /// An empty cache; tiles are laid out once the input is ready.
    pub fn new(options: CacheOptions) -> Self {
        let policy = (options.eviction)();
        Self {
            options,
            state: Arc::new(Mutex::new(CacheState::new(policy))),
        }
    }

    /// A cache with a fixed tile shape and default options otherwise.
    pub fn with_block_shape(block_shape: impl Into<Vec<usize>>) -> Self {
        Self::new(CacheOptions::default().with_block_shape(block_shape))
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Counters since the cache was created.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Whether the cache is currently fixed.
    pub fn is_fixed(&self) -> bool {
        self.state.lock().fixed
    }

    /// Fill the tile at grid position `index` with `data`.
    ///
    /// The tile becomes clean for the current generation. A fetch still in
    /// flight for it is superseded and its result dropped when it lands.
    /// `data` must have the tile's exact shape and the input dtype.
    pub fn store_block(&self, index: &[usize], data: ArrayBuffer) -> ExecutionResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(meta) = &state.meta else {
            return Err(ExecutionError::operator(
                "BlockwiseCache",
                "Output",
                "cache input is not configured",
            ));
        };
        let (shape, dtype) = (meta.shape.clone(), meta.dtype);

        let grid = Roi::from_shape(&shape).block_range(&state.block_shape)?;
        let inside = index.len() == grid.ndim() && index.iter().zip(grid.stop()).all(|(i, n)| i < n);
        if !inside {
            return Err(ExecutionError::operator(
                "BlockwiseCache",
                "Output",
                format!("block {:?} is outside the tile grid {:?}", index, grid.stop()),
            ));
        }
        let bounds = block_bounds(&shape, &state.block_shape, index);
        if data.shape() != bounds.shape().as_slice() {
            return Err(ExecutionError::ShapeMismatch {
                expected: bounds.shape(),
                got: data.shape().to_vec(),
            });
        }
        if data.dtype() != dtype {
            return Err(ExecutionError::DTypeMismatch {
                expected: dtype,
                got: data.dtype(),
            });
        }

        let nbytes = data.nbytes();
        let tile = state.tiles.entry(index.to_vec()).or_default();
        if tile.in_flight.take().is_some() {
            state.next_ticket += 1;
            tile.ticket = state.next_ticket;
            tile.pending = None;
            log::debug!("stored block {:?} supersedes its pending fetch", index);
        }
        if let Some(old) = tile.data.replace(Arc::new(data)) {
            state.stats.resident_bytes = state.stats.resident_bytes.saturating_sub(old.nbytes());
        }
        tile.stamp = state.generation;
        state.stats.resident_bytes += nbytes;
        state.policy.touch(index, nbytes);
        state.enforce_limit(self.options.memory_limit, Some(index));
        Ok(())
    }

    /// The tile shape in use; empty before the input is ready.
    pub fn block_shape(&self) -> Vec<usize> {
        self.state.lock().block_shape.clone()
    }

    /// Bounds of every tile that is currently clean.
    pub fn clean_blocks(&self) -> Vec<Roi> {
        let state = self.state.lock();
        let Some(meta) = &state.meta else {
            return Vec::new();
        };
        let mut blocks: Vec<(&Vec<usize>, Roi)> = state
            .tiles
            .iter()
            .filter(|(_, tile)| tile.clean_data(state.generation).is_some())
            .map(|(index, _)| (index, block_bounds(&meta.shape, &state.block_shape, index)))
            .collect();
        blocks.sort_by(|a, b| a.0.cmp(b.0));
        blocks.into_iter().map(|(_, roi)| roi).collect()
    }
}

impl Default for BlockwiseCache {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl fmt::Debug for BlockwiseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockwiseCache")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl Operator for BlockwiseCache {
    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata::builder("BlockwiseCache")
            .description("Caches its input as a grid of tiles")
            .input(SlotDefinition::input("Input").with_description("Array to cache"))
            .output(SlotDefinition::output("Output").with_description("Cached copy of the input"))
            .build()
    }

    fn setup_outputs(&self, ctx: &mut SetupContext) -> GraphResult<()> {
        let meta = ctx.input_meta("Input")?.clone();
        let block_shape = self
            .options
            .block_shape_for(&meta.shape)
            .map_err(|reason| ctx.error(reason))?;

        {
            let mut state = self.state.lock();
            if state.meta.as_ref() != Some(&meta) || state.block_shape != block_shape {
                log::debug!(
                    "'{}' caching {:?} {} in tiles of {:?}",
                    ctx.operator(),
                    meta.shape,
                    meta.dtype,
                    block_shape
                );
                state.tiles.clear();
                state.policy.clear();
                state.held_dirty = None;
                state.stats.resident_bytes = 0;
                state.generation += 1;
                state.meta = Some(meta.clone());
                state.block_shape = block_shape;
            }
        }

        ctx.set_output_meta("Output", meta)
    }

    async fn execute(&self, ctx: &ExecutionContext, result: &mut ArrayBuffer) -> ExecutionResult<()> {
        let roi = ctx.roi().clone();
        let upstream = ctx.read_input("Input", roi.clone())?;
        let memory_limit = self.options.memory_limit;

        // Tiles already collected; holding them keeps them from eviction.
        let mut ready: HashMap<Vec<usize>, Arc<ArrayBuffer>> = HashMap::new();
        // Never-filled tiles answered with zeros while fixed.
        let mut blank: Vec<Vec<usize>> = Vec::new();
        let mut first_pass = true;

        let (shape, block_shape) = loop {
            let waits: Vec<Event> = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let Some(meta) = &state.meta else {
                    return Err(ctx.fail("cache input is not configured"));
                };
                let shape = meta.shape.clone();
                let block_shape = state.block_shape.clone();
                let generation = state.generation;
                let fixed = state.fixed;

                let mut waits = Vec::new();
                let mut unfilled = Vec::new();
                for index in intersecting_blocks(&block_shape, &roi)? {
                    if ready.contains_key(&index) || blank.contains(&index) {
                        continue;
                    }
                    let tile = state.tiles.entry(index.clone()).or_default();

                    if let Some(data) = tile.clean_data(generation) {
                        if first_pass {
                            state.stats.hits += 1;
                        }
                        ready.insert(index, Arc::clone(data));
                        continue;
                    }

                    if fixed {
                        match &tile.data {
                            Some(data) => {
                                if first_pass {
                                    state.stats.hits += 1;
                                }
                                ready.insert(index, Arc::clone(data));
                            }
                            None => unfilled.push(index),
                        }
                        continue;
                    }

                    if let Some(event) = &tile.in_flight {
                        if !event.is_set() {
                            waits.push(event.clone());
                            continue;
                        }
                        // finished without reporting back, e.g. cancelled
                        tile.in_flight = None;
                    }

                    // submitted right away so the queued fetch holds no graph
                    let request = upstream
                        .retarget(block_bounds(&shape, &block_shape, &index))?
                        .submit();
                    state.next_ticket += 1;
                    tile.ticket = state.next_ticket;
                    tile.pending = Some(generation);
                    let event = ctx
                        .graph()
                        .put_task(fetch_tile(
                            Arc::clone(&self.state),
                            index,
                            tile.ticket,
                            request,
                            memory_limit,
                        ))
                        .into_event();
                    tile.in_flight = Some(event.clone());
                    state.stats.fetches += 1;
                    waits.push(event);
                }

                for index in unfilled {
                    state.hold_dirty(Some(&block_bounds(&shape, &block_shape, &index)));
                    blank.push(index);
                }

                if waits.is_empty() {
                    for (index, data) in &ready {
                        state.policy.touch(index, data.nbytes());
                    }
                    break (shape, block_shape);
                }
                waits
            };

            first_pass = false;
            for event in waits {
                event.await?;
            }
        };

        for (index, data) in &ready {
            let bounds = block_bounds(&shape, &block_shape, index);
            if let Some(overlap) = bounds.intersection(&roi) {
                let piece = data.region(&overlap.relative_to(bounds.start()))?;
                result.write_region(&overlap.relative_to(roi.start()), &piece)?;
            }
        }
        if !blank.is_empty() {
            log::debug!("answered {} unfilled tiles with zeros while fixed", blank.len());
        }
        for index in &blank {
            let bounds = block_bounds(&shape, &block_shape, index);
            if let Some(overlap) = bounds.intersection(&roi) {
                let zeros = ArrayBuffer::zeros(result.dtype(), &overlap.shape());
                result.write_region(&overlap.relative_to(roi.start()), &zeros)?;
            }
        }

        drop(ready);
        self.state.lock().enforce_limit(memory_limit, None);
        Ok(())
    }

    fn propagate_dirty(&self, ctx: &mut DirtyContext) {
        let roi = ctx.roi().cloned();
        let held = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let previous = state.generation;
            state.generation += 1;
            let current = state.generation;

            if let (InvalidationMode::Regional, Some(dirty), Some(meta)) =
                (self.options.invalidation, &roi, &state.meta)
            {
                if dirty.ndim() == meta.ndim() {
                    for (index, tile) in state.tiles.iter_mut() {
                        let bounds = block_bounds(&meta.shape, &state.block_shape, index);
                        if bounds.intersects(dirty) {
                            continue;
                        }
                        if tile.stamp == previous {
                            tile.stamp = current;
                        }
                        if tile.pending == Some(previous) {
                            tile.pending = Some(current);
                        }
                    }
                }
            }

            if state.fixed {
                state.hold_dirty(roi.as_ref());
            }
            state.fixed
        };
        if held {
            log::trace!("holding back dirty region on '{}' while fixed", ctx.input());
        } else {
            ctx.mark_output_dirty("Output", roi);
        }
    }

    fn set_fixed(&self, fixed: bool, ctx: &mut DirtyContext) {
        let released = {
            let mut state = self.state.lock();
            if state.fixed == fixed {
                return;
            }
            state.fixed = fixed;
            if fixed {
                None
            } else {
                state.held_dirty.take()
            }
        };
        if let Some(roi) = released {
            log::debug!("releasing dirty region {} held while fixed", roi);
            ctx.mark_output_dirty("Output", Some(roi));
        }
    }

    fn clone_box(&self) -> Box<dyn Operator> {
        Box::new(BlockwiseCache::new(self.options.clone()))
    }
}
