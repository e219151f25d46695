//! Kernel schedule construction
//!
//! Rewrites the schedule of a [`KernelRegion`] into the per-statement layout
//!
//! ```text
//! [host dims | block ids | tile loops | thread ids | point loops | post-band dims]
//!  tile_first   n_grid      tile_len     n_block      tile_len
//! ```
//!
//! The band coordinates are first tiled (`outer = floor(b/T)`, `inner = b mod T`),
//! the outer coordinates are then distributed over the grid and the inner
//! coordinates over the threads of a block, either contiguously
//! ([`Mapping::Tile`]) or interleaved ([`Mapping::Wrap`]). Block and thread
//! coordinates are finally equated to fresh kernel parameters `b<k>` and
//! `t<k>` so that later stages can treat them symbolically.
//!
//! All floor divisions are expressed as divs of the statement's
//! [`LocalSpace`], so every schedule coordinate stays a quasi-affine function
//! of the statement iterators.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::{GpuOptions, Mapping};
use crate::error::{EngineError, GpuError, Result};
use crate::poly::{ceil_div, Aff, AffConstraint, LocalSpace, Optimum, System};
use crate::scop::{KernelRegion, Scop};

/// Role of one schedule coordinate of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LevelKind {
    /// Executed on the host, outside the kernel
    Host,
    /// Fixed per block (`blockIdx`)
    BlockId,
    /// Sequential loop over the tiles assigned to a block
    TileLoop,
    /// Fixed per thread (`threadIdx`)
    ThreadId,
    /// Sequential loop over the points of a tile assigned to a thread
    PointLoop,
    /// Schedule coordinate below the band
    Inner,
}

impl LevelKind {
    /// Levels that are not loops inside the kernel
    pub fn is_mapped(self) -> bool {
        matches!(self, LevelKind::BlockId | LevelKind::ThreadId)
    }
}

/// Progress of a kernel schedule through the transformation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScheduleStage {
    Untiled,
    Tiled,
    Parametrized,
    Scaled,
    BodyScheduled,
    UnrollInterchanged,
}

impl ScheduleStage {
    /// Moves on to `next`; stages only ever move forward.
    pub fn advance(&mut self, next: ScheduleStage) {
        debug_assert!(next > *self, "schedule stage {:?} after {:?}", next, self);
        trace!("schedule stage {:?} -> {:?}", self, next);
        *self = next;
    }
}

/// Schedule of one statement in the space `[kernel params | iterators | divs]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementSchedule {
    /// Index into [`Scop::statements`]
    pub stmt: usize,
    /// Number of parameters of the original program
    pub n_program_param: usize,
    pub space: LocalSpace,
    /// Iteration domain and parametrization equalities
    pub constraints: Vec<AffConstraint>,
    /// Schedule coordinates
    pub dims: Vec<Aff>,
}

impl StatementSchedule {
    /// The statement in its original space, without schedule coordinates
    pub fn untiled(scop: &Scop, stmt: usize) -> Self {
        let s = &scop.statements[stmt];
        Self {
            stmt,
            n_program_param: scop.n_param(),
            space: LocalSpace::new(scop.n_param(), s.iterators.len()),
            constraints: s.domain.clone(),
            dims: Vec::new(),
        }
    }

    /// Moves an expression over `[program params | iterators]` into this space
    pub fn lift(&self, aff: &Aff) -> Aff {
        let extra = self.space.n_param - self.n_program_param;
        if extra == 0 {
            return aff.clone();
        }
        let map: Vec<usize> = (0..aff.coeffs.len())
            .map(|k| if k < self.n_program_param { k } else { k + extra })
            .collect();
        aff.remapped(&map)
    }

    pub fn lift_constraint(&self, c: &AffConstraint) -> AffConstraint {
        AffConstraint {
            aff: self.lift(&c.aff),
            kind: c.kind,
        }
    }

    /// Domain, parametrization, div definitions and `context` as a system
    /// over the local space
    pub fn system(&self, context: &[AffConstraint]) -> Result<System, EngineError> {
        let n = self.space.dim();
        let identity: Vec<usize> = (0..n).collect();
        let mut sys = System::new(n);
        for c in self
            .constraints
            .iter()
            .chain(self.space.div_constraints()?.iter())
            .chain(context)
        {
            sys.add_aff(c, &identity);
        }
        Ok(sys)
    }
}

/// Per-statement intermediate results of tiling and mapping
struct Partial {
    sched: StatementSchedule,
    host: Vec<Aff>,
    post: Vec<Aff>,
    outer: Vec<Aff>,
    inner: Vec<Aff>,
    blocks: Vec<Aff>,
    loops: Vec<Aff>,
    threads: Vec<Aff>,
    points: Vec<Aff>,
}

/// Tiled, mapped and parametrized schedule of one kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSchedule {
    /// Program parameters followed by `b<k>` and `t<k>`
    pub param_names: Vec<String>,
    pub n_program_param: usize,
    /// Constraints on the kernel parameters
    pub context: Vec<AffConstraint>,
    pub tile_first: usize,
    pub tile_len: usize,
    pub n_grid: usize,
    pub n_block: usize,
    pub tile_sizes: Vec<i64>,
    /// Blocks per grid-mapped band member (outermost first)
    pub grid_sizes: Vec<i64>,
    /// Threads per thread-mapped band member (outermost first)
    pub block_sizes: Vec<i64>,
    pub grid_mapping: Mapping,
    pub thread_mapping: Mapping,
    pub levels: Vec<LevelKind>,
    /// Per band member: no dependence is carried by it
    pub coincident: Vec<bool>,
    pub statements: Vec<StatementSchedule>,
    pub stage: ScheduleStage,
}

impl KernelSchedule {
    /// Tiles, maps and parametrizes the band of `region`.
    ///
    /// # Errors
    /// Propagates algebra engine failures from the tile-count queries.
    pub fn build(scop: &Scop, region: &KernelRegion, options: &GpuOptions) -> Result<Self> {
        let first = region
            .statements
            .first()
            .and_then(|&s| scop.statements.get(s))
            .ok_or_else(|| GpuError::InvalidProgram("empty kernel region".to_string()))?;
        let sched_len = first.schedule.len();
        let tile_first = region.tile_first;
        let tile_len = region.tile_len;
        // only the leading members without carried dependences run in parallel
        let n_coincident = region
            .coincident
            .iter()
            .take(tile_len)
            .take_while(|c| **c)
            .count();
        let n_grid = n_coincident.min(options.grid_sizes.len());
        let n_block = n_coincident.min(options.block_sizes.len());
        let mut stage = ScheduleStage::Untiled;
        let p = scop.n_param();

        let tile_sizes: Vec<i64> = (0..tile_len).map(|k| options.tile_size(k)).collect();
        let mut grid_sizes: Vec<i64> = (0..n_grid)
            .map(|k| options.grid_sizes[n_grid - 1 - k])
            .collect();
        let mut block_sizes: Vec<i64> = (0..n_block)
            .map(|k| options.block_sizes[n_block - 1 - k].min(tile_sizes[k]))
            .collect();

        let mut param_names = scop.params.clone();
        param_names.extend((0..n_grid).map(|k| format!("b{}", k)));
        param_names.extend((0..n_block).map(|k| format!("t{}", k)));
        let n_param = param_names.len();
        let program_context: Vec<AffConstraint> = scop.context.clone();

        // Tiling
        let mut partials: Vec<Partial> = Vec::with_capacity(region.statements.len());
        for &s in &region.statements {
            let stmt = &scop.statements[s];
            let mut sched = StatementSchedule {
                stmt: s,
                n_program_param: p,
                space: LocalSpace::new(n_param, stmt.iterators.len()),
                constraints: Vec::new(),
                dims: Vec::new(),
            };
            sched.constraints = stmt
                .domain
                .iter()
                .map(|c| sched.lift_constraint(c))
                .collect();
            let lifted: Vec<Aff> = stmt.schedule.iter().map(|a| sched.lift(a)).collect();
            let mut outer = Vec::with_capacity(tile_len);
            let mut inner = Vec::with_capacity(tile_len);
            for k in 0..tile_len {
                let b = &lifted[tile_first + k];
                let o = sched.space.floor(b, tile_sizes[k]);
                inner.push(b.sub(&o.scale(tile_sizes[k])?)?);
                outer.push(o);
            }
            partials.push(Partial {
                host: lifted[..tile_first].to_vec(),
                post: lifted[tile_first + tile_len..].to_vec(),
                sched,
                outer,
                inner,
                blocks: Vec::new(),
                loops: Vec::new(),
                threads: Vec::new(),
                points: Vec::new(),
            });
        }
        debug!(
            "tiled band [{}, {}) of {} statements with sizes {:?}",
            tile_first,
            tile_first + tile_len,
            partials.len(),
            tile_sizes
        );
        stage.advance(ScheduleStage::Tiled);

        // Grid mapping
        let mut grid_mapping = options.grid_mapping;
        let mut chunks: Vec<(i64, i64)> = Vec::new();
        if grid_mapping == Mapping::Tile {
            for k in 0..n_grid {
                match tile_range(&partials, k, &program_context)? {
                    Some((lo, hi)) => {
                        let count = hi
                            .checked_sub(lo)
                            .and_then(|d| d.checked_add(1))
                            .ok_or(EngineError::Overflow)?;
                        chunks.push((lo, ceil_div(count, grid_sizes[k]).max(1)))
                    }
                    None => {
                        warn!(
                            "number of tiles of band member {} is unbounded, wrapping over the grid",
                            k
                        );
                        grid_mapping = Mapping::Wrap;
                        break;
                    }
                }
            }
        }
        for part in &mut partials {
            for k in 0..tile_len {
                let outer = part.outer[k].clone();
                if k >= n_grid {
                    part.loops.push(outer);
                    continue;
                }
                let g = grid_sizes[k];
                match grid_mapping {
                    Mapping::Wrap => {
                        part.blocks.push(part.sched.space.modulo(&outer, g)?);
                        part.loops.push(part.sched.space.floor(&outer, g));
                    }
                    Mapping::Tile => {
                        let (lo, chunk) = chunks[k];
                        let rel = outer.sub(&Aff::constant(lo))?;
                        let block = part.sched.space.floor(&rel, chunk);
                        part.loops.push(rel.sub(&block.scale(chunk)?)?);
                        part.blocks.push(block);
                    }
                }
            }
        }

        // Thread mapping
        for part in &mut partials {
            for k in 0..tile_len {
                let inner = part.inner[k].clone();
                if k >= n_block {
                    part.points.push(inner);
                    continue;
                }
                let b = block_sizes[k];
                match options.thread_mapping {
                    Mapping::Wrap => {
                        part.threads.push(part.sched.space.modulo(&inner, b)?);
                        part.points.push(part.sched.space.floor(&inner, b));
                    }
                    Mapping::Tile => {
                        let chunk = ceil_div(tile_sizes[k], b);
                        let thread = part.sched.space.floor(&inner, chunk);
                        part.points.push(inner.sub(&thread.scale(chunk)?)?);
                        part.threads.push(thread);
                    }
                }
            }
        }

        // Unused blocks and threads are not launched
        for k in 0..n_grid {
            if let Some(max) = max_over(&partials, |part| &part.blocks[k], &program_context)? {
                grid_sizes[k] = grid_sizes[k].min(max.saturating_add(1)).max(1);
            }
        }
        for k in 0..n_block {
            if let Some(max) = max_over(&partials, |part| &part.threads[k], &program_context)? {
                block_sizes[k] = block_sizes[k].min(max.saturating_add(1)).max(1);
            }
        }

        // Parametrization
        let mut statements = Vec::with_capacity(partials.len());
        for part in partials {
            let mut sched = part.sched;
            let mut dims = part.host;
            for (k, block) in part.blocks.iter().enumerate() {
                let param = Aff::var(p + k);
                sched
                    .constraints
                    .push(AffConstraint::equality(param.sub(block)?));
                dims.push(param);
            }
            dims.extend(part.loops);
            for (k, thread) in part.threads.iter().enumerate() {
                let param = Aff::var(p + n_grid + k);
                sched
                    .constraints
                    .push(AffConstraint::equality(param.sub(thread)?));
                dims.push(param);
            }
            dims.extend(part.points);
            dims.extend(part.post);
            sched.dims = dims;
            statements.push(sched);
        }
        stage.advance(ScheduleStage::Parametrized);

        let mut context = program_context;
        for (k, &g) in grid_sizes.iter().enumerate() {
            context.push(AffConstraint::inequality(Aff::var(p + k)));
            context.push(AffConstraint::inequality(
                Aff::term(p + k, -1).add_constant(g - 1)?,
            ));
        }
        for (k, &b) in block_sizes.iter().enumerate() {
            let v = p + n_grid + k;
            context.push(AffConstraint::inequality(Aff::var(v)));
            context.push(AffConstraint::inequality(Aff::term(v, -1).add_constant(b - 1)?));
        }

        let mut levels = vec![LevelKind::Host; tile_first];
        levels.extend(std::iter::repeat(LevelKind::BlockId).take(n_grid));
        levels.extend(std::iter::repeat(LevelKind::TileLoop).take(tile_len));
        levels.extend(std::iter::repeat(LevelKind::ThreadId).take(n_block));
        levels.extend(std::iter::repeat(LevelKind::PointLoop).take(tile_len));
        levels.extend(std::iter::repeat(LevelKind::Inner).take(sched_len - tile_first - tile_len));

        let mut schedule = KernelSchedule {
            param_names,
            n_program_param: p,
            context,
            tile_first,
            tile_len,
            n_grid,
            n_block,
            tile_sizes,
            grid_sizes,
            block_sizes,
            grid_mapping,
            thread_mapping: options.thread_mapping,
            levels,
            coincident: region.coincident.clone(),
            statements,
            stage,
        };
        if options.scale_tile_loops {
            schedule.scale_tile_loops()?;
        }
        debug!(
            "kernel schedule: grid {:?}, block {:?}, depth {}",
            schedule.grid_sizes,
            schedule.block_sizes,
            schedule.depth()
        );
        Ok(schedule)
    }

    /// Number of schedule coordinates per statement
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Prefix up to and including the tile loops
    pub fn shared_len(&self) -> usize {
        self.tile_first + self.n_grid + self.tile_len
    }

    /// Prefix up to and including the thread ids
    pub fn private_len(&self) -> usize {
        self.shared_len() + self.n_block
    }

    pub fn n_param(&self) -> usize {
        self.param_names.len()
    }

    /// Position of the tile loop of band member `k`
    pub fn tile_loop_pos(&self, k: usize) -> usize {
        self.tile_first + self.n_grid + k
    }

    /// Position of the point loop of band member `k`
    pub fn point_loop_pos(&self, k: usize) -> usize {
        self.private_len() + k
    }

    /// Band member of a point-loop position
    pub fn band_member_of_point(&self, pos: usize) -> Option<usize> {
        let start = self.private_len();
        (pos >= start && pos < start + self.tile_len).then(|| pos - start)
    }

    /// Is coordinate `pos` a constant in every statement?
    pub fn is_constant_dim(&self, pos: usize) -> bool {
        self.statements
            .iter()
            .all(|s| s.dims.get(pos).map_or(true, Aff::is_constant))
    }

    /// Multiplies tile loops by `T` (`T·G` when wrapped over the grid)
    fn scale_tile_loops(&mut self) -> Result<()> {
        for k in 0..self.tile_len {
            let mut factor = self.tile_sizes[k];
            if k < self.n_grid && self.grid_mapping == Mapping::Wrap {
                factor = factor
                    .checked_mul(self.grid_sizes[k])
                    .ok_or(EngineError::Overflow)?;
            }
            let pos = self.tile_loop_pos(k);
            for stmt in &mut self.statements {
                stmt.dims[pos] = stmt.dims[pos].scale(factor)?;
            }
        }
        self.stage.advance(ScheduleStage::Scaled);
        Ok(())
    }
}

/// Statement system with every div of a single value fixed
fn tightened_system(sched: &StatementSchedule, context: &[AffConstraint]) -> Result<System> {
    let mut sys = sched.system(context)?;
    sys.fix_determined(sched.space.div_offset()..sched.space.dim())?;
    Ok(sys)
}

/// Range of `outer[k]` over all statements, `None` if unbounded
fn tile_range(
    partials: &[Partial],
    k: usize,
    context: &[AffConstraint],
) -> Result<Option<(i64, i64)>> {
    let mut range: Option<(i64, i64)> = None;
    for part in partials {
        let sys = tightened_system(&part.sched, context)?;
        let lo = sys.minimize(&part.outer[k])?;
        let hi = sys.maximize(&part.outer[k])?;
        match (lo, hi) {
            (Optimum::Empty, _) | (_, Optimum::Empty) => continue,
            (Optimum::Value(l), Optimum::Value(h)) => {
                range = Some(range.map_or((l, h), |(a, b)| (a.min(l), b.max(h))));
            }
            _ => return Ok(None),
        }
    }
    Ok(range)
}

/// Maximum of a per-statement expression, `None` if unbounded
fn max_over<F>(partials: &[Partial], expr: F, context: &[AffConstraint]) -> Result<Option<i64>>
where
    F: Fn(&Partial) -> &Aff,
{
    let mut best: Option<i64> = None;
    for part in partials {
        match tightened_system(&part.sched, context)?.maximize(expr(part))? {
            Optimum::Value(v) => best = Some(best.map_or(v, |b| b.max(v))),
            Optimum::Unbounded => return Ok(None),
            Optimum::Empty => {}
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scop::ScopBuilder;

    fn vector_scop(n: &str) -> Scop {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context(n).unwrap();
        b.array("A", "float", 4, 1);
        let s = b.statement("S0", &["i"], "0 <= i < N", &["i"]).unwrap();
        b.write(s, "A", &["i"]).unwrap();
        b.region(&[s], 0, 1);
        b.build().unwrap()
    }

    #[test]
    fn test_layout_of_one_dimensional_band() {
        let scop = vector_scop("N >= 1");
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &GpuOptions::default()).unwrap();
        assert_eq!(sched.n_grid, 1);
        assert_eq!(sched.n_block, 1);
        assert_eq!(sched.shared_len(), 2);
        assert_eq!(sched.private_len(), 3);
        assert_eq!(sched.depth(), 4);
        assert_eq!(
            sched.levels,
            vec![
                LevelKind::BlockId,
                LevelKind::TileLoop,
                LevelKind::ThreadId,
                LevelKind::PointLoop
            ]
        );
        assert_eq!(sched.param_names, vec!["N", "b0", "t0"]);
        assert_eq!(sched.block_sizes, vec![32]);
        assert_eq!(sched.stage, ScheduleStage::Scaled);
    }

    #[test]
    fn test_wrapped_mapping_reconstructs_iterator() {
        let scop = vector_scop("N >= 1");
        let mut options = GpuOptions::default();
        options.scale_tile_loops = false;
        options.grid_sizes = vec![4];
        options.block_sizes = vec![8];
        options.tile_sizes = vec![16];
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &options).unwrap();
        let st = &sched.statements[0];
        for i in 0..200 {
            // exactly one choice of [b0, t0] satisfies the parametrization
            let mut hits = 0;
            for block in 0..4 {
                for thread in 0..8 {
                    let values = st.space.eval(&[1000, block, thread, i]).unwrap();
                    if !st.constraints.iter().all(|c| c.holds(&values).unwrap()) {
                        continue;
                    }
                    hits += 1;
                    let tile_loop = st.dims[1].eval(&values).unwrap();
                    let point = st.dims[3].eval(&values).unwrap();
                    assert_eq!(16 * (4 * tile_loop + block) + 8 * point + thread, i);
                }
            }
            assert_eq!(hits, 1);
        }
    }

    #[test]
    fn test_tile_mapping_clamps_grid() {
        let scop = vector_scop("N = 100");
        let mut options = GpuOptions::default();
        options.grid_mapping = Mapping::Tile;
        options.thread_mapping = Mapping::Tile;
        options.grid_sizes = vec![2];
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &options).unwrap();
        // 4 tiles of 32 over 2 blocks
        assert_eq!(sched.grid_mapping, Mapping::Tile);
        assert_eq!(sched.grid_sizes, vec![2]);
        assert_eq!(sched.block_sizes, vec![32]);
    }

    #[test]
    fn test_unbounded_tile_mapping_falls_back_to_wrap() {
        let scop = vector_scop("N >= 1");
        let mut options = GpuOptions::default();
        options.grid_mapping = Mapping::Tile;
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &options).unwrap();
        assert_eq!(sched.grid_mapping, Mapping::Wrap);
    }

    /// `C[i][j] += A[i][k] * B[k][j]` with the reduction over `k` in the band
    fn matmul_scop() -> Scop {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 2);
        b.array("B", "float", 4, 2);
        b.array("C", "float", 4, 2);
        let s = b
            .statement(
                "S",
                &["i", "j", "k"],
                "0 <= i < N and 0 <= j < N and 0 <= k < N",
                &["i", "j", "k"],
            )
            .unwrap();
        b.read(s, "C", &["i", "j"]).unwrap();
        b.read(s, "A", &["i", "k"]).unwrap();
        b.read(s, "B", &["k", "j"]).unwrap();
        b.write(s, "C", &["i", "j"]).unwrap();
        b.region(&[s], 0, 3);
        b.regions_mut()[0].coincident = vec![true, true, false];
        b.build().unwrap()
    }

    #[test]
    fn test_carried_member_stays_sequential() {
        let scop = matmul_scop();
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &GpuOptions::default()).unwrap();
        assert_eq!(sched.n_grid, 2);
        assert_eq!(sched.n_block, 2);
        assert_eq!(
            sched.levels,
            vec![
                LevelKind::BlockId,
                LevelKind::BlockId,
                LevelKind::TileLoop,
                LevelKind::TileLoop,
                LevelKind::TileLoop,
                LevelKind::ThreadId,
                LevelKind::ThreadId,
                LevelKind::PointLoop,
                LevelKind::PointLoop,
                LevelKind::PointLoop
            ]
        );
        assert_eq!(sched.block_sizes, vec![16, 32]);
        assert_eq!(sched.param_names, vec!["N", "b0", "b1", "t0", "t1"]);

        // k is covered by its tile and point loops alone
        let st = &sched.statements[0];
        let (tk, pk) = (sched.tile_loop_pos(2), sched.point_loop_pos(2));
        for k in 0..100 {
            let values = st.space.eval(&[1000, 0, 0, 0, 0, 0, 0, k]).unwrap();
            let (tile, point) = (st.dims[tk].eval(&values), st.dims[pk].eval(&values));
            assert_eq!(tile.unwrap() + point.unwrap(), k);
        }
    }

    #[test]
    fn test_leading_carried_member_maps_nothing() {
        let mut scop = matmul_scop();
        scop.regions[0].coincident = vec![false, true, true];
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &GpuOptions::default()).unwrap();
        assert_eq!(sched.n_grid, 0);
        assert_eq!(sched.n_block, 0);
        assert!(sched.levels.iter().all(|l| !l.is_mapped()));
        assert!(sched.grid_sizes.is_empty());
    }

    #[test]
    fn test_stages_move_forward() {
        let scop = vector_scop("N >= 1");
        let mut options = GpuOptions::default();
        options.scale_tile_loops = false;
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &options).unwrap();
        assert_eq!(sched.stage, ScheduleStage::Parametrized);

        let mut stage = ScheduleStage::Untiled;
        stage.advance(ScheduleStage::Tiled);
        assert_eq!(stage, ScheduleStage::Tiled);
        stage.advance(ScheduleStage::Scaled);
        assert!(stage > ScheduleStage::Parametrized);
    }

    #[test]
    fn test_small_loop_clamps_threads() {
        let scop = vector_scop("N = 8");
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &GpuOptions::default()).unwrap();
        assert_eq!(sched.grid_sizes, vec![1]);
        assert_eq!(sched.block_sizes, vec![8]);
    }
}
