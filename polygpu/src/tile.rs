//! Tiles and tiling maps
//!
//! A [`Tile`] is the rectangular box, one [`Bound`] per array dimension, that
//! covers every element a group of references touches for fixed values of
//! the outer schedule coordinates. Its [`TilingMap`] translates global array
//! indices into coordinates of the local copy:
//!
//! ```text
//! local_i = (index_i + shift_i(outer)) / stride_i - ceil(lower_i(outer) / denom_i)
//! ```

use log::debug;
use serde::{Deserialize, Serialize};

use crate::bound::{infer_bound, Bound, LowerBound};
use crate::error::EngineError;
use crate::poly::Aff;
use crate::relation::AccessMap;

/// Memory level a group is copied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Global,
    Shared,
    Private,
}

impl Placement {
    pub fn prefix(self) -> &'static str {
        match self {
            Placement::Global => "global",
            Placement::Shared => "shared",
            Placement::Private => "private",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub bounds: Vec<Bound>,
    pub n_param: usize,
    /// Number of outer schedule coordinates the bounds may depend on
    pub n_outer: usize,
}

impl Tile {
    pub fn sizes(&self) -> Vec<i64> {
        self.bounds.iter().map(|b| b.size).collect()
    }

    /// Number of elements; a scalar tile holds one element
    pub fn element_count(&self) -> i64 {
        self.bounds
            .iter()
            .fold(1i64, |n, b| n.saturating_mul(b.size))
    }

    /// Bytes occupied by the tile
    pub fn footprint(&self, element_size: usize) -> i64 {
        self.element_count()
            .saturating_mul(i64::try_from(element_size).unwrap_or(i64::MAX))
    }

    /// Deepest outer coordinate from `from` on, among those `counts` accepts,
    /// that any offset or shift depends on
    pub fn deepest_outer_dependence<F>(&self, from: usize, counts: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        (from..self.n_outer).rev().filter(|&j| counts(j)).find(|&j| {
            let v = self.n_param + j;
            self.bounds.iter().any(|b| {
                b.lower.aff.involves(v) || b.stride.as_ref().map_or(false, |s| s.shift.involves(v))
            })
        })
    }

    pub fn tiling_map(&self, name: &str) -> TilingMap {
        TilingMap {
            name: name.to_string(),
            dims: self
                .bounds
                .iter()
                .map(|b| TileDim {
                    stride: b.stride.as_ref().map(|s| (s.stride, s.shift.clone())),
                    lower: b.lower.clone(),
                })
                .collect(),
        }
    }
}

/// One dimension of a [`TilingMap`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileDim {
    /// `(stride, shift)` when the dimension is strided
    pub stride: Option<(i64, Aff)>,
    pub lower: LowerBound,
}

/// `[outer -> element] -> local`, named after the local variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingMap {
    pub name: String,
    pub dims: Vec<TileDim>,
}

impl TilingMap {
    /// Local coordinates of `element` for the outer values `[params | outer]`,
    /// `None` if the element is off the stride lattice
    pub fn apply(&self, outer: &[i64], element: &[i64]) -> Result<Option<Vec<i64>>, EngineError> {
        let mut local = Vec::with_capacity(self.dims.len());
        for (dim, &index) in self.dims.iter().zip(element) {
            let scaled = match &dim.stride {
                None => index,
                Some((stride, shift)) => {
                    let shifted = index
                        .checked_add(shift.eval(outer)?)
                        .ok_or(EngineError::Overflow)?;
                    if shifted % stride != 0 {
                        return Ok(None);
                    }
                    shifted / stride
                }
            };
            let offset = scaled
                .checked_sub(dim.lower.eval(outer)?)
                .ok_or(EngineError::Overflow)?;
            local.push(offset);
        }
        Ok(Some(local))
    }
}

/// Builds a tile for `map` if every output dimension has a finite bound.
pub fn can_tile(map: &AccessMap) -> Result<Option<Tile>, EngineError> {
    let mut bounds = Vec::with_capacity(map.n_out());
    for d in 0..map.n_out() {
        match infer_bound(&map.select_out(d))? {
            Some(bound) => bounds.push(bound),
            None => {
                debug!("dimension {} has no finite bound", d);
                return Ok(None);
            }
        }
    }
    Ok(Some(Tile {
        bounds,
        n_param: map.n_param(),
        n_outer: map.n_in(),
    }))
}

/// Name of the local copy of group `nr` of `array`
pub fn local_name(placement: Placement, array: &str, nr: usize, n_groups: usize) -> String {
    if n_groups > 1 {
        format!("{}_{}_{}", placement.prefix(), array, nr)
    } else {
        format!("{}_{}", placement.prefix(), array)
    }
}
