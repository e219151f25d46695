//! Polyhedral program model
//!
//! A [`Scop`] is the already-extracted input of the mapping pipeline:
//! statements with iteration domains and schedules, tagged array references,
//! array descriptors and the kernel regions selected by the upstream
//! scheduler. Every affine object of a statement lives in the space
//! `[params | iterators]` of that statement.
//!
//! Programs are either deserialized with serde or written by hand with
//! [`ScopBuilder`]:
//!
//! ```rust
//! use polygpu::scop::ScopBuilder;
//!
//! let mut b = ScopBuilder::new();
//! b.param("N");
//! b.context("N >= 1").unwrap();
//! b.array("A", "float", 4, 1);
//! let s = b.statement("S0", &["i"], "0 <= i < N", &["i"]).unwrap();
//! b.read(s, "A", &["i"]).unwrap();
//! b.write(s, "A", &["i"]).unwrap();
//! b.region(&[s], 0, 1);
//! let scop = b.build().unwrap();
//! assert_eq!(scop.statements.len(), 1);
//! ```

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::bound::{infer_extent, DimExtent};
use crate::error::{GpuError, Result};
use crate::poly::{parse_aff, parse_constraints, Aff, AffConstraint};
use crate::relation::AccessMap;
use crate::schedule::StatementSchedule;

/// Identity of a memory reference, unique within a program
pub type RefId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
}

/// One index expression of a reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessIndex {
    /// A single element per statement instance
    Affine(Aff),
    /// Every element in `[lower, upper]` (makes the relation many-to-many)
    Range { lower: Aff, upper: Aff },
}

/// A tagged access relation from statement instances to array elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub id: RefId,
    pub array: String,
    pub kind: AccessKind,
    /// Writes only: every element in the relation is actually written
    pub exact: bool,
    pub index: Vec<AccessIndex>,
}

impl Access {
    pub fn is_write(&self) -> bool {
        self.kind == AccessKind::Write
    }

    pub fn is_read(&self) -> bool {
        self.kind == AccessKind::Read
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub name: String,
    pub iterators: Vec<String>,
    /// Iteration domain over `[params | iterators]`
    pub domain: Vec<AffConstraint>,
    /// Logical time over `[params | iterators]`
    pub schedule: Vec<Aff>,
    pub accesses: Vec<Access>,
}

/// Recomputed bounds of the accessed part of an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayExtent {
    pub dims: Vec<DimExtent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayInfo {
    pub name: String,
    pub element_type: String,
    pub element_size: usize,
    pub n_index: usize,
    #[serde(default)]
    pub extent: Option<ArrayExtent>,
    #[serde(default)]
    pub scalar: bool,
    #[serde(default)]
    pub has_compound_element: bool,
    /// Only used inside the program (not live-in or live-out)
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub read_only: bool,
    /// Upstream live-range analysis requires per-thread storage
    #[serde(default)]
    pub force_private: bool,
}

impl ArrayInfo {
    pub fn new(name: &str, element_type: &str, element_size: usize, n_index: usize) -> Self {
        Self {
            name: name.to_string(),
            element_type: element_type.to_string(),
            element_size,
            n_index,
            extent: None,
            scalar: n_index == 0,
            has_compound_element: false,
            local: false,
            read_only: false,
            force_private: false,
        }
    }

    pub fn is_read_only_scalar(&self) -> bool {
        self.read_only && self.scalar
    }
}

/// An outermost parallel tilable band selected upstream, mapped to one kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRegion {
    /// Indices into [`Scop::statements`]
    pub statements: Vec<usize>,
    /// First schedule coordinate of the band
    pub tile_first: usize,
    /// Number of band coordinates
    pub tile_len: usize,
    /// Per band member: no dependence is carried by it
    pub coincident: Vec<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scop {
    pub params: Vec<String>,
    /// Constraints on the parameters
    #[serde(default)]
    pub context: Vec<AffConstraint>,
    pub arrays: Vec<ArrayInfo>,
    pub statements: Vec<Statement>,
    pub regions: Vec<KernelRegion>,
}

impl Scop {
    pub fn n_param(&self) -> usize {
        self.params.len()
    }

    pub fn array(&self, name: &str) -> Option<&ArrayInfo> {
        self.arrays.iter().find(|a| a.name == name)
    }

    pub fn array_index(&self, name: &str) -> Option<usize> {
        self.arrays.iter().position(|a| a.name == name)
    }

    /// Checks the structural consistency of the program
    pub fn validate(&self) -> Result<()> {
        let n_param = self.n_param();
        for c in &self.context {
            if c.aff.len() > n_param {
                return Err(GpuError::InvalidProgram(
                    "context refers to non-parameter variables".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for stmt in &self.statements {
            if !names.insert(stmt.name.as_str()) {
                return Err(GpuError::InvalidProgram(format!(
                    "duplicate statement '{}'",
                    stmt.name
                )));
            }
            let dim = n_param + stmt.iterators.len();
            let too_wide = |aff: &Aff| aff.len() > dim;
            if stmt.domain.iter().any(|c| too_wide(&c.aff)) || stmt.schedule.iter().any(too_wide) {
                return Err(GpuError::InvalidProgram(format!(
                    "statement '{}' refers to unknown variables",
                    stmt.name
                )));
            }
            for access in &stmt.accesses {
                if !ids.insert(access.id) {
                    return Err(GpuError::InvalidProgram(format!(
                        "duplicate reference id {}",
                        access.id
                    )));
                }
                let array = self.array(&access.array).ok_or_else(|| {
                    GpuError::InvalidProgram(format!("unknown array '{}'", access.array))
                })?;
                if access.index.len() != array.n_index {
                    return Err(GpuError::InvalidProgram(format!(
                        "reference {} to '{}' has {} indices, expected {}",
                        access.id,
                        array.name,
                        access.index.len(),
                        array.n_index
                    )));
                }
                let wide = access.index.iter().any(|idx| match idx {
                    AccessIndex::Affine(a) => too_wide(a),
                    AccessIndex::Range { lower, upper } => too_wide(lower) || too_wide(upper),
                });
                if wide {
                    return Err(GpuError::InvalidProgram(format!(
                        "reference {} refers to unknown variables",
                        access.id
                    )));
                }
            }
        }

        for (r, region) in self.regions.iter().enumerate() {
            if region.statements.is_empty() {
                return Err(GpuError::InvalidProgram(format!("region {} is empty", r)));
            }
            if region.coincident.len() != region.tile_len {
                return Err(GpuError::InvalidProgram(format!(
                    "region {}: {} coincidence flags for a band of {}",
                    r,
                    region.coincident.len(),
                    region.tile_len
                )));
            }
            let mut sched_len = None;
            for &s in &region.statements {
                let stmt = self.statements.get(s).ok_or_else(|| {
                    GpuError::InvalidProgram(format!("region {}: no statement {}", r, s))
                })?;
                match sched_len {
                    None => sched_len = Some(stmt.schedule.len()),
                    Some(len) if len != stmt.schedule.len() => {
                        return Err(GpuError::InvalidProgram(format!(
                            "region {}: schedules of different lengths",
                            r
                        )))
                    }
                    _ => {}
                }
            }
            if region.tile_first + region.tile_len > sched_len.unwrap_or(0) {
                return Err(GpuError::InvalidProgram(format!(
                    "region {}: band exceeds schedule",
                    r
                )));
            }
        }
        Ok(())
    }

    /// Recomputes the `read_only` and `scalar` flags from the references
    pub fn recompute_flags(&mut self) {
        let written: HashSet<String> = self
            .statements
            .iter()
            .flat_map(|s| s.accesses.iter())
            .filter(|a| a.is_write())
            .map(|a| a.array.clone())
            .collect();
        for array in &mut self.arrays {
            array.read_only = !written.contains(&array.name);
            array.scalar = array.n_index == 0;
        }
    }

    /// Recomputes the extent of every array from all its references
    pub fn recompute_extents(&mut self) -> Result<()> {
        let schedules: Vec<StatementSchedule> = (0..self.statements.len())
            .map(|s| StatementSchedule::untiled(self, s))
            .collect();
        let mut extents = Vec::with_capacity(self.arrays.len());
        for array in &self.arrays {
            let items: Vec<_> = self
                .statements
                .iter()
                .enumerate()
                .flat_map(|(s, stmt)| {
                    stmt.accesses
                        .iter()
                        .filter(|a| a.array == array.name)
                        .map(move |a| (s, a))
                })
                .map(|(s, a)| (&schedules[s], a))
                .collect();
            if items.is_empty() {
                extents.push(None);
                continue;
            }
            let map = AccessMap::build(self.n_param(), &self.context, &items, 0)?;
            let dims = infer_extent(&map)?;
            debug!("extent of {}: {:?}", array.name, dims);
            extents.push(Some(ArrayExtent { dims }));
        }
        for (array, extent) in self.arrays.iter_mut().zip(extents) {
            array.extent = extent;
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<Scop> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Incremental construction of a [`Scop`] from textual affine expressions
#[derive(Debug, Default)]
pub struct ScopBuilder {
    scop: Scop,
    next_ref: RefId,
}

impl ScopBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(&mut self, name: &str) -> &mut Self {
        self.scop.params.push(name.to_string());
        self
    }

    pub fn context(&mut self, text: &str) -> Result<&mut Self> {
        let names: Vec<&str> = self.scop.params.iter().map(String::as_str).collect();
        let constraints = parse_constraints(text, &names)?;
        self.scop.context.extend(constraints);
        Ok(self)
    }

    /// Declares an array and returns it so flags can be adjusted
    pub fn array(
        &mut self,
        name: &str,
        element_type: &str,
        element_size: usize,
        n_index: usize,
    ) -> &mut ArrayInfo {
        self.scop
            .arrays
            .push(ArrayInfo::new(name, element_type, element_size, n_index));
        let last = self.scop.arrays.len() - 1;
        &mut self.scop.arrays[last]
    }

    /// Adds a statement and returns its index
    pub fn statement(
        &mut self,
        name: &str,
        iterators: &[&str],
        domain: &str,
        schedule: &[&str],
    ) -> Result<usize> {
        let names = self.names(iterators);
        let domain = parse_constraints(domain, &names)?;
        let schedule = schedule
            .iter()
            .map(|s| parse_aff(s, &names))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.scop.statements.push(Statement {
            name: name.to_string(),
            iterators: iterators.iter().map(|s| s.to_string()).collect(),
            domain,
            schedule,
            accesses: Vec::new(),
        });
        Ok(self.scop.statements.len() - 1)
    }

    pub fn read(&mut self, stmt: usize, array: &str, index: &[&str]) -> Result<RefId> {
        self.access(stmt, array, AccessKind::Read, true, index)
    }

    /// Exact write
    pub fn write(&mut self, stmt: usize, array: &str, index: &[&str]) -> Result<RefId> {
        self.access(stmt, array, AccessKind::Write, true, index)
    }

    /// Write that may not touch every element of its relation
    pub fn may_write(&mut self, stmt: usize, array: &str, index: &[&str]) -> Result<RefId> {
        self.access(stmt, array, AccessKind::Write, false, index)
    }

    /// Adds a reference; an index of the form `lo..hi` is the inclusive range
    pub fn access(
        &mut self,
        stmt: usize,
        array: &str,
        kind: AccessKind,
        exact: bool,
        index: &[&str],
    ) -> Result<RefId> {
        let iterators: Vec<String> = self
            .scop
            .statements
            .get(stmt)
            .ok_or_else(|| GpuError::InvalidProgram(format!("no statement {}", stmt)))?
            .iterators
            .clone();
        let iter_refs: Vec<&str> = iterators.iter().map(String::as_str).collect();
        let names = self.names(&iter_refs);
        let mut parsed = Vec::with_capacity(index.len());
        for text in index {
            let idx = match text.split_once("..") {
                Some((lo, hi)) => AccessIndex::Range {
                    lower: parse_aff(lo, &names)?,
                    upper: parse_aff(hi, &names)?,
                },
                None => AccessIndex::Affine(parse_aff(text, &names)?),
            };
            parsed.push(idx);
        }
        let id = self.next_ref;
        self.next_ref += 1;
        self.scop.statements[stmt].accesses.push(Access {
            id,
            array: array.to_string(),
            kind,
            exact,
            index: parsed,
        });
        Ok(id)
    }

    /// Declares a kernel region whose band members are all coincident
    pub fn region(&mut self, statements: &[usize], tile_first: usize, tile_len: usize) -> &mut Self {
        self.scop.regions.push(KernelRegion {
            statements: statements.to_vec(),
            tile_first,
            tile_len,
            coincident: vec![true; tile_len],
        });
        self
    }

    /// Validates the program and recomputes flags and extents
    pub fn build(self) -> Result<Scop> {
        let mut scop = self.scop;
        scop.validate()?;
        scop.recompute_flags();
        scop.recompute_extents()?;
        Ok(scop)
    }

    /// Mutable access to the regions, e.g. to clear coincidence flags
    pub fn regions_mut(&mut self) -> &mut Vec<KernelRegion> {
        &mut self.scop.regions
    }

    fn names<'a>(&'a self, iterators: &[&'a str]) -> Vec<&'a str> {
        self.scop
            .params
            .iter()
            .map(String::as_str)
            .chain(iterators.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple() -> ScopBuilder {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 1);
        b.array("s", "float", 4, 0);
        b
    }

    #[test]
    fn test_builder_parses_statement() {
        let mut b = simple();
        let s = b.statement("S0", &["i"], "0 <= i < N", &["i"]).unwrap();
        b.read(s, "A", &["i + 1"]).unwrap();
        b.write(s, "A", &["i"]).unwrap();
        b.read(s, "s", &[]).unwrap();
        b.region(&[s], 0, 1);
        let scop = b.build().unwrap();

        let stmt = &scop.statements[0];
        assert_eq!(stmt.domain.len(), 2);
        assert_eq!(stmt.accesses.len(), 3);
        assert_eq!(stmt.accesses[0].id, 0);
        assert_eq!(
            stmt.accesses[0].index[0],
            AccessIndex::Affine(Aff::var(1).add_constant(1).unwrap())
        );
        assert!(!scop.array("A").unwrap().read_only);
        assert!(scop.array("s").unwrap().is_read_only_scalar());
    }

    #[test]
    fn test_extent_is_recomputed() {
        let mut b = simple();
        let s = b.statement("S0", &["i"], "0 <= i < N", &["i"]).unwrap();
        b.read(s, "A", &["i + 1"]).unwrap();
        b.region(&[s], 0, 1);
        let scop = b.build().unwrap();
        let extent = scop.array("A").unwrap().extent.clone().unwrap();
        // A[i + 1] for 0 <= i < N touches [1, N]
        assert_eq!(extent.dims[0].lower, Some(Aff::constant(1)));
        assert_eq!(extent.dims[0].upper, Some(Aff::var(0)));
    }

    #[test]
    fn test_validation_rejects_bad_arity() {
        let mut b = simple();
        let s = b.statement("S0", &["i"], "0 <= i < N", &["i"]).unwrap();
        b.read(s, "A", &["i", "i"]).unwrap();
        b.region(&[s], 0, 1);
        assert!(matches!(b.build(), Err(GpuError::InvalidProgram(_))));
    }

    #[test]
    fn test_range_index_and_unknown_name() {
        let mut b = simple();
        let s = b.statement("S0", &["i"], "0 <= i < N", &["i"]).unwrap();
        b.read(s, "A", &["i..i + 2"]).unwrap();
        assert!(matches!(b.read(s, "A", &["k"]), Err(GpuError::Parse(_))));
    }

    #[test]
    fn test_json_roundtrip_of_program() {
        let mut b = simple();
        let s = b.statement("S0", &["i"], "0 <= i < N", &["i"]).unwrap();
        b.write(s, "A", &["i"]).unwrap();
        b.region(&[s], 0, 1);
        let scop = b.build().unwrap();
        let text = scop.to_json().unwrap();
        assert_eq!(Scop::from_json_str(&text).unwrap(), scop);
    }
}
