//! Regions of interest over N-dimensional arrays.
//!
//! A [`Roi`] is a half-open `[start, stop)` box. Besides plain box
//! arithmetic this module maps ROIs onto a regular block grid, which is how
//! the blockwise cache decides which tiles a read touches:
//!
//! ```text
//! block index range = [floor(start / block), ceil(stop / block))
//! ```

use crate::core::error::{RoiError, RoiResult};
use ndarray::{Slice, SliceInfoElem};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// A half-open N-dimensional box `[start, stop)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    start: Vec<usize>,
    stop: Vec<usize>,
}

impl Roi {
    /// Create a ROI, checking rank agreement and `start <= stop` on every axis.
    pub fn new(start: impl Into<Vec<usize>>, stop: impl Into<Vec<usize>>) -> RoiResult<Self> {
        let start = start.into();
        let stop = stop.into();
        if start.len() != stop.len() {
            return Err(RoiError::RankMismatch {
                expected: start.len(),
                got: stop.len(),
            });
        }
        for (axis, (&a, &b)) in start.iter().zip(&stop).enumerate() {
            if a > b {
                return Err(RoiError::InvertedRange {
                    axis,
                    start: a,
                    stop: b,
                });
            }
        }
        Ok(Self { start, stop })
    }

    /// The ROI covering a whole array of the given shape.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    /// Convert python-style slicing into a ROI.
    ///
    /// Missing trailing axes select their full extent and an integer index
    /// selects the singleton range `[i, i + 1)`.
    pub fn from_slices(slicing: &[SliceInfoElem], shape: &[usize]) -> RoiResult<Self> {
        if slicing.len() > shape.len() {
            return Err(RoiError::RankMismatch {
                expected: shape.len(),
                got: slicing.len(),
            });
        }

        let mut start = Vec::with_capacity(shape.len());
        let mut stop = Vec::with_capacity(shape.len());
        for (axis, &extent) in shape.iter().enumerate() {
            let (a, b) = match slicing.get(axis) {
                None => (0, extent),
                Some(SliceInfoElem::Slice { start, end, step }) => {
                    if *step != 1 {
                        return Err(RoiError::UnsupportedStep { axis, step: *step });
                    }
                    let a = normalize_index(axis, *start, extent)?;
                    let b = match end {
                        Some(end) => normalize_index(axis, *end, extent)?,
                        None => extent,
                    };
                    (a, b)
                }
                Some(SliceInfoElem::Index(index)) => {
                    let a = normalize_index(axis, *index, extent)?;
                    if a >= extent {
                        return Err(RoiError::IndexOutOfRange {
                            axis,
                            index: *index,
                            extent,
                        });
                    }
                    (a, a + 1)
                }
                Some(SliceInfoElem::NewAxis) => return Err(RoiError::NewAxis { axis }),
            };
            start.push(a);
            stop.push(b);
        }
        Self::new(start, stop)
    }

    /// Unit-step slices selecting this ROI, one per axis.
    pub fn to_slices(&self) -> Vec<Slice> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(&a, &b)| Slice::from(a..b))
            .collect()
    }

    /// Per-axis index ranges.
    pub fn to_ranges(&self) -> Vec<Range<usize>> {
        self.start.iter().zip(&self.stop).map(|(&a, &b)| a..b).collect()
    }

    /// Inclusive start corner.
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    /// Exclusive stop corner.
    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Extent along each axis.
    pub fn shape(&self) -> Vec<usize> {
        self.start.iter().zip(&self.stop).map(|(&a, &b)| b - a).collect()
    }

    /// Number of elements covered.
    pub fn volume(&self) -> usize {
        self.shape().iter().product()
    }

    /// Whether any axis has zero extent.
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    /// Whether `other` lies entirely inside this ROI.
    pub fn contains(&self, other: &Roi) -> bool {
        self.ndim() == other.ndim()
            && self
                .start
                .iter()
                .zip(&other.start)
                .all(|(outer, inner)| outer <= inner)
            && self
                .stop
                .iter()
                .zip(&other.stop)
                .all(|(outer, inner)| inner <= outer)
    }

    /// The overlap of two ROIs, or `None` if they do not overlap.
    pub fn intersection(&self, other: &Roi) -> Option<Roi> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let start: Vec<usize> = self
            .start
            .iter()
            .zip(&other.start)
            .map(|(a, b)| *a.max(b))
            .collect();
        let stop: Vec<usize> = self
            .stop
            .iter()
            .zip(&other.stop)
            .map(|(a, b)| *a.min(b))
            .collect();
        if start.iter().zip(&stop).any(|(a, b)| a >= b) {
            return None;
        }
        Some(Roi { start, stop })
    }

    /// The smallest ROI containing both.
    pub fn hull(&self, other: &Roi) -> RoiResult<Roi> {
        if self.ndim() != other.ndim() {
            return Err(RoiError::RankMismatch {
                expected: self.ndim(),
                got: other.ndim(),
            });
        }
        Ok(Roi {
            start: self.start.iter().zip(&other.start).map(|(a, b)| *a.min(b)).collect(),
            stop: self.stop.iter().zip(&other.stop).map(|(a, b)| *a.max(b)).collect(),
        })
    }

    /// Whether the two ROIs share at least one element.
    pub fn intersects(&self, other: &Roi) -> bool {
        self.intersection(other).is_some()
    }

    /// Shift the ROI forward by `offset`.
    pub fn translate(&self, offset: &[usize]) -> Roi {
        Roi {
            start: self.start.iter().zip(offset).map(|(a, o)| a + o).collect(),
            stop: self.stop.iter().zip(offset).map(|(b, o)| b + o).collect(),
        }
    }

    /// Express this ROI in coordinates relative to `origin`.
    pub fn relative_to(&self, origin: &[usize]) -> Roi {
        Roi {
            start: self
                .start
                .iter()
                .zip(origin)
                .map(|(a, o)| a.saturating_sub(*o))
                .collect(),
            stop: self
                .stop
                .iter()
                .zip(origin)
                .map(|(b, o)| b.saturating_sub(*o))
                .collect(),
        }
    }

    /// Clip the ROI to an array shape.
    pub fn clipped_to(&self, shape: &[usize]) -> Roi {
        let stop: Vec<usize> = self.stop.iter().zip(shape).map(|(b, s)| *b.min(s)).collect();
        let start = self.start.iter().zip(&stop).map(|(a, b)| *a.min(b)).collect();
        Roi { start, stop }
    }

    /// Check that the ROI addresses a valid region of an array of `shape`.
    pub fn check_within(&self, shape: &[usize]) -> RoiResult<()> {
        if self.ndim() != shape.len() {
            return Err(RoiError::RankMismatch {
                expected: shape.len(),
                got: self.ndim(),
            });
        }
        for (axis, (&stop, &extent)) in self.stop.iter().zip(shape).enumerate() {
            if stop > extent {
                return Err(RoiError::OutOfBounds { axis, stop, extent });
            }
        }
        Ok(())
    }

    /// Range of block-grid indices whose blocks intersect this ROI.
    pub fn block_range(&self, block_shape: &[usize]) -> RoiResult<Roi> {
        check_block_shape(block_shape, self.ndim())?;
        if self.is_empty() {
            let origin: Vec<usize> = self
                .start
                .iter()
                .zip(block_shape)
                .map(|(a, b)| a / b)
                .collect();
            return Ok(Roi {
                start: origin.clone(),
                stop: origin,
            });
        }
        let start = self
            .start
            .iter()
            .zip(block_shape)
            .map(|(a, b)| a / b)
            .collect();
        let stop = self
            .stop
            .iter()
            .zip(block_shape)
            .map(|(a, b)| a.div_ceil(*b))
            .collect();
        Ok(Roi { start, stop })
    }

    /// Iterate the block-grid indices whose blocks intersect this ROI.
    pub fn blocks(&self, block_shape: &[usize]) -> RoiResult<BlockIter> {
        Ok(BlockIter::new(self.block_range(block_shape)?))
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.stop)
    }
}

fn normalize_index(axis: usize, index: isize, extent: usize) -> RoiResult<usize> {
    let resolved = if index < 0 {
        extent as isize + index
    } else {
        index
    };
    if resolved < 0 || resolved as usize > extent {
        return Err(RoiError::IndexOutOfRange {
            axis,
            index,
            extent,
        });
    }
    Ok(resolved as usize)
}

fn check_block_shape(block_shape: &[usize], ndim: usize) -> RoiResult<()> {
    if block_shape.len() != ndim {
        return Err(RoiError::RankMismatch {
            expected: ndim,
            got: block_shape.len(),
        });
    }
    if block_shape.iter().any(|&b| b == 0) {
        return Err(RoiError::InvalidBlockShape(block_shape.to_vec()));
    }
    Ok(())
}

/// Row-major iterator over every index in a block-grid range.
#[derive(Debug, Clone)]
pub struct BlockIter {
    range: Roi,
    current: Option<Vec<usize>>,
}

impl BlockIter {
    /// Iterate all indices in `range`.
    pub fn new(range: Roi) -> Self {
        let current = if range.is_empty() && range.ndim() > 0 {
            None
        } else {
            Some(range.start.clone())
        };
        Self { range, current }
    }

    /// Total number of indices visited.
    pub fn block_count(&self) -> usize {
        self.range.volume()
    }
}

impl Iterator for BlockIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.take()?;

        // Advance the last axis fastest, carrying into earlier axes.
        let mut next = current.clone();
        let mut axis = next.len();
        self.current = loop {
            if axis == 0 {
                break None;
            }
            axis -= 1;
            next[axis] += 1;
            if next[axis] < self.range.stop[axis] {
                break Some(next);
            }
            next[axis] = self.range.start[axis];
        };

        Some(current)
    }
}

/// The region covered by block `index`, clipped to the dataset.
pub fn block_bounds(dataset_shape: &[usize], block_shape: &[usize], index: &[usize]) -> Roi {
    let start: Vec<usize> = index.iter().zip(block_shape).map(|(i, b)| i * b).collect();
    let stop = start
        .iter()
        .zip(block_shape)
        .zip(dataset_shape)
        .map(|((a, b), s)| (a + b).min(*s))
        .collect();
    Roi { start, stop }
}

/// Indices of every block intersecting `roi`, in row-major order.
pub fn intersecting_blocks(block_shape: &[usize], roi: &Roi) -> RoiResult<Vec<Vec<usize>>> {
    Ok(roi.blocks(block_shape)?.collect())
}

/// Choose a block shape close to `target_volume` elements that never exceeds
/// `max_shape` on any axis.
///
/// The result is as isometric as the limits allow: small axes are filled
/// first and the larger axes pick up the remaining volume.
pub fn determine_block_shape(max_shape: &[usize], target_volume: usize) -> RoiResult<Vec<usize>> {
    if max_shape.iter().any(|&m| m == 0) {
        return Err(RoiError::InvalidBlockShape(max_shape.to_vec()));
    }

    let mut order: Vec<usize> = (0..max_shape.len()).collect();
    order.sort_by_key(|&axis| (max_shape[axis], axis));

    let mut block_shape = vec![0; max_shape.len()];
    let mut volume_so_far = 1usize;
    for (done, &axis) in order.iter().enumerate() {
        let remaining_axes = (max_shape.len() - done) as f64;
        let remaining = (target_volume / volume_so_far) as f64;
        let side = (remaining.powf(1.0 / remaining_axes) + 0.5) as usize;
        let side = side.clamp(1, max_shape[axis]);
        block_shape[axis] = side;
        volume_so_far *= side;
    }
    Ok(block_shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roi(start: &[usize], stop: &[usize]) -> Roi {
        Roi::new(start.to_vec(), stop.to_vec()).unwrap()
    }

    #[test]
    fn test_roi_rejects_inverted_range() {
        assert!(matches!(
            Roi::new(vec![0, 5], vec![3, 4]),
            Err(RoiError::InvertedRange { axis: 1, .. })
        ));
        assert!(matches!(
            Roi::new(vec![0], vec![3, 4]),
            Err(RoiError::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_from_slices_expands_and_normalizes() {
        let shape = [10, 20, 30];
        let slicing = [
            SliceInfoElem::from(2..5),
            SliceInfoElem::Index(-1),
        ];
        let r = Roi::from_slices(&slicing, &shape).unwrap();
        assert_eq!(r.start(), &[2, 19, 0]);
        assert_eq!(r.stop(), &[5, 20, 30]);

        let open = [SliceInfoElem::from(Slice::new(-4, None, 1))];
        let r = Roi::from_slices(&open, &[10]).unwrap();
        assert_eq!(r, roi(&[6], &[10]));
    }

    #[test]
    fn test_from_slices_rejects_steps_and_bad_indices() {
        let stepped = [SliceInfoElem::from(Slice::new(0, None, 2))];
        assert!(matches!(
            Roi::from_slices(&stepped, &[10]),
            Err(RoiError::UnsupportedStep { axis: 0, step: 2 })
        ));
        assert!(matches!(
            Roi::from_slices(&[SliceInfoElem::Index(10)], &[10]),
            Err(RoiError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            Roi::from_slices(&[SliceInfoElem::NewAxis], &[10]),
            Err(RoiError::NewAxis { axis: 0 })
        ));
    }

    #[test]
    fn test_to_slices_selects_same_region() {
        let r = roi(&[1, 2], &[3, 7]);
        let array = ndarray::Array2::<u8>::zeros((5, 10));
        let slices = r.to_slices();
        let view = array.slice_each_axis(|ax| slices[ax.axis.index()]);
        assert_eq!(view.shape(), &[2, 5]);
    }

    #[test]
    fn test_intersection() {
        let a = roi(&[0, 0], &[10, 10]);
        let b = roi(&[5, 8], &[20, 20]);
        assert_eq!(a.intersection(&b), Some(roi(&[5, 8], &[10, 10])));

        let c = roi(&[10, 0], &[12, 5]);
        assert_eq!(a.intersection(&c), None);
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_hull() {
        let a = roi(&[2, 6], &[4, 8]);
        let b = roi(&[0, 7], &[3, 12]);
        assert_eq!(a.hull(&b).unwrap(), roi(&[0, 6], &[4, 12]));
        assert!(a.hull(&roi(&[0], &[1])).is_err());
    }

    #[test]
    fn test_block_range_uses_floor_and_ceil() {
        let r = roi(&[0, 0], &[15, 15]);
        assert_eq!(r.block_range(&[10, 10]).unwrap(), roi(&[0, 0], &[2, 2]));

        let r = roi(&[5, 5], &[6, 6]);
        assert_eq!(r.block_range(&[10, 10]).unwrap(), roi(&[0, 0], &[1, 1]));

        let r = roi(&[10, 19], &[20, 21]);
        assert_eq!(r.block_range(&[10, 10]).unwrap(), roi(&[1, 1], &[2, 3]));
    }

    #[test]
    fn test_block_range_rejects_zero_block() {
        let r = roi(&[0], &[5]);
        assert!(matches!(
            r.block_range(&[0]),
            Err(RoiError::InvalidBlockShape(_))
        ));
    }

    #[test]
    fn test_block_iter_row_major() {
        let blocks: Vec<_> = BlockIter::new(roi(&[0, 1], &[2, 3])).collect();
        assert_eq!(
            blocks,
            vec![vec![0, 1], vec![0, 2], vec![1, 1], vec![1, 2]]
        );
        assert_eq!(BlockIter::new(roi(&[0, 0], &[0, 3])).count(), 0);
    }

    #[test]
    fn test_block_bounds_clipped_to_dataset() {
        let bounds = block_bounds(&[25, 20], &[10, 10], &[2, 1]);
        assert_eq!(bounds, roi(&[20, 10], &[25, 20]));
    }

    #[test]
    fn test_intersecting_blocks() {
        let blocks = intersecting_blocks(&[10, 10], &roi(&[0, 0], &[15, 15])).unwrap();
        assert_eq!(blocks.len(), 4);
        assert!(blocks.contains(&vec![1, 1]));
    }

    #[test]
    fn test_determine_block_shape() {
        assert_eq!(
            determine_block_shape(&[1000, 2000, 3000, 1], 1_000_000).unwrap(),
            vec![100, 100, 100, 1]
        );
        assert_eq!(
            determine_block_shape(&[1, 100, 5, 200, 3], 1000).unwrap(),
            vec![1, 8, 5, 8, 3]
        );
        assert!(determine_block_shape(&[0, 4], 16).is_err());
    }

    fn arb_roi_in(shape: Vec<usize>) -> impl Strategy<Value = Roi> {
        let axes: Vec<_> = shape
            .into_iter()
            .map(|extent| (0..=extent, 0..=extent))
            .collect();
        axes.prop_map(|pairs| {
            let (start, stop): (Vec<_>, Vec<_>) = pairs
                .into_iter()
                .map(|(a, b)| (a.min(b), a.max(b)))
                .unzip();
            Roi::new(start, stop).unwrap()
        })
    }

    proptest! {
        #[test]
        fn test_intersection_is_contained_in_both(
            a in arb_roi_in(vec![30, 30]),
            b in arb_roi_in(vec![30, 30]),
        ) {
            if let Some(i) = a.intersection(&b) {
                prop_assert!(a.contains(&i));
                prop_assert!(b.contains(&i));
                prop_assert_eq!(Some(i), b.intersection(&a));
            }
        }

        #[test]
        fn test_blocks_cover_roi(
            r in arb_roi_in(vec![40, 25]),
            bx in 1usize..12,
            by in 1usize..12,
        ) {
            let block_shape = [bx, by];
            let covered: usize = r
                .blocks(&block_shape)
                .unwrap()
                .map(|idx| block_bounds(&[40, 25], &block_shape, &idx))
                .filter_map(|b| b.intersection(&r))
                .map(|i| i.volume())
                .sum();
            prop_assert_eq!(covered, r.volume());
        }
    }
}
