//! Split planning for builtin copies and fills
//!
//! A copy or fill is cut into a left leftover, an aligned middle and a
//! right leftover, each encoded as its own builtin dispatch. The plan is
//! computed up front; [`SplitPlan::dispatches`] then yields one step per
//! dispatch with the split counters as plain values.

use tracing::debug;

use crate::builtins::Builtin;
use crate::hw_info::align_down;

/// Unit the middle of a byte copy or a 1-byte fill is aligned to.
const MIDDLE_ELEMENT_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    LeftLeftover,
    Middle,
    RightLeftover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSegment {
    pub kind: SegmentKind,
    /// Byte offset from the start of the operation.
    pub offset: u64,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Copy,
    Fill { pattern_size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    operation: Operation,
    segments: Vec<SplitSegment>,
}

/// One step of a split operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitDispatch {
    pub index: u32,
    pub total: u32,
    pub segment: SplitSegment,
    /// Dispatches already encoded when this one starts.
    pub executed_before: u32,
    pub builtin: Builtin,
}

impl SplitPlan {
    pub fn for_copy(dst: u64, src: u64, size: usize) -> Self {
        let mut left = ((4 - (dst % 4)) % 4) as usize;
        left = left.min(size);
        let mut middle = align_down(size - left, MIDDLE_ELEMENT_SIZE);
        // Source misaligned relative to destination: nothing can run wide.
        if (src + left as u64) % 4 != 0 {
            left = size;
            middle = 0;
        }
        let right = size - left - middle;
        let plan = Self::from_sizes(Operation::Copy, left, middle, right);
        debug!("Copy of {} bytes split into {} dispatches", size, plan.total());
        plan
    }

    pub fn for_fill(size: usize, pattern_size: usize) -> Self {
        let unit = if pattern_size <= 1 {
            MIDDLE_ELEMENT_SIZE
        } else {
            pattern_size.next_multiple_of(4)
        };
        let middle = size / unit * unit;
        let plan = Self::from_sizes(
            Operation::Fill {
                pattern_size: pattern_size.max(1),
            },
            0,
            middle,
            size - middle,
        );
        debug!(
            "Fill of {} bytes (pattern {}) split into {} dispatches",
            size,
            pattern_size,
            plan.total()
        );
        plan
    }

    fn from_sizes(operation: Operation, left: usize, middle: usize, right: usize) -> Self {
        let mut segments = Vec::with_capacity(3);
        let mut offset = 0u64;
        for (kind, size) in [
            (SegmentKind::LeftLeftover, left),
            (SegmentKind::Middle, middle),
            (SegmentKind::RightLeftover, right),
        ] {
            if size > 0 {
                segments.push(SplitSegment { kind, offset, size });
                offset += size as u64;
            }
        }
        Self { operation, segments }
    }

    /// Cut middle segments larger than `max_bytes` into several dispatches.
    pub fn limit_dispatch_size(mut self, max_bytes: usize) -> Self {
        let unit = match self.operation {
            Operation::Copy => MIDDLE_ELEMENT_SIZE,
            Operation::Fill { pattern_size } if pattern_size > 1 => pattern_size.next_multiple_of(4),
            Operation::Fill { .. } => MIDDLE_ELEMENT_SIZE,
        };
        let max_bytes = align_down(max_bytes, unit).max(unit);
        let mut segments = Vec::with_capacity(self.segments.len());
        for segment in self.segments {
            if segment.kind != SegmentKind::Middle || segment.size <= max_bytes {
                segments.push(segment);
                continue;
            }
            let mut done = 0;
            while done < segment.size {
                let size = (segment.size - done).min(max_bytes);
                segments.push(SplitSegment {
                    kind: SegmentKind::Middle,
                    offset: segment.offset + done as u64,
                    size,
                });
                done += size;
            }
        }
        self.segments = segments;
        self
    }

    pub fn segments(&self) -> &[SplitSegment] {
        &self.segments
    }

    pub fn total(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn is_split(&self) -> bool {
        self.segments.len() > 1
    }

    fn builtin_for(&self, kind: SegmentKind) -> Builtin {
        match (self.operation, kind) {
            (Operation::Copy, SegmentKind::LeftLeftover) => Builtin::CopyBufferToBufferBytes,
            (Operation::Copy, SegmentKind::Middle) => Builtin::CopyBufferToBufferMiddle,
            (Operation::Copy, SegmentKind::RightLeftover) => Builtin::CopyBufferToBufferSide,
            (Operation::Fill { pattern_size: 1 }, SegmentKind::RightLeftover) => {
                Builtin::FillBufferImmediateLeftOver
            }
            (Operation::Fill { pattern_size: 1 }, _) => Builtin::FillBufferImmediate,
            (Operation::Fill { .. }, SegmentKind::RightLeftover) => Builtin::FillBufferRightLeftover,
            (Operation::Fill { .. }, _) => Builtin::FillBufferMiddle,
        }
    }

    pub fn dispatches(&self) -> impl Iterator<Item = SplitDispatch> + '_ {
        let total = self.total();
        self.segments.iter().enumerate().map(move |(index, segment)| SplitDispatch {
            index: index as u32,
            total,
            segment: *segment,
            executed_before: index as u32,
            builtin: self.builtin_for(segment.kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_0x101_needs_two_dispatches() {
        let plan = SplitPlan::for_copy(0x1_0000_0000, 0x2_0000_0000, 0x101);
        assert_eq!(plan.total(), 2);
        assert_eq!(plan.segments()[0].kind, SegmentKind::Middle);
        assert_eq!(plan.segments()[0].size, 0x100);
        assert_eq!(plan.segments()[1].offset, 0x100);
        assert_eq!(plan.segments()[1].size, 1);
    }

    #[test]
    fn test_copy_with_unaligned_destination() {
        let plan = SplitPlan::for_copy(0x1001, 0x2001, 0x40);
        let kinds: Vec<_> = plan.segments().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![SegmentKind::LeftLeftover, SegmentKind::Middle, SegmentKind::RightLeftover]
        );
        assert_eq!(plan.segments()[0].size, 3);
        assert_eq!(plan.segments().iter().map(|s| s.size).sum::<usize>(), 0x40);
    }

    #[test]
    fn test_copy_with_mismatched_source_runs_bytewise() {
        let plan = SplitPlan::for_copy(0x1000, 0x2002, 0x40);
        assert_eq!(plan.total(), 1);
        assert_eq!(plan.segments()[0].kind, SegmentKind::LeftLeftover);
    }

    #[test]
    fn test_fill_split_boundaries() {
        assert_eq!(SplitPlan::for_fill(4095, 8).total(), 2);
        assert_eq!(SplitPlan::for_fill(4095, 1).total(), 2);
        assert!(!SplitPlan::for_fill(4096, 8).is_split());
        assert!(!SplitPlan::for_fill(4096, 1).is_split());
    }

    #[test]
    fn test_fill_builtins() {
        let plan = SplitPlan::for_fill(4095, 8);
        let builtins: Vec<_> = plan.dispatches().map(|d| d.builtin).collect();
        assert_eq!(builtins, vec![Builtin::FillBufferMiddle, Builtin::FillBufferRightLeftover]);

        let plan = SplitPlan::for_fill(4095, 1);
        let builtins: Vec<_> = plan.dispatches().map(|d| d.builtin).collect();
        assert_eq!(
            builtins,
            vec![Builtin::FillBufferImmediate, Builtin::FillBufferImmediateLeftOver]
        );
    }

    #[test]
    fn test_dispatch_counters() {
        let plan = SplitPlan::for_fill(4095, 8);
        for (k, dispatch) in plan.dispatches().enumerate() {
            assert_eq!(dispatch.executed_before, k as u32);
            assert_eq!(dispatch.total, 2);
        }
    }

    #[test]
    fn test_limit_dispatch_size() {
        let plan = SplitPlan::for_copy(0x1000, 0x2000, 0x1000).limit_dispatch_size(0x400);
        assert_eq!(plan.total(), 4);
        assert!(plan.segments().iter().all(|s| s.size == 0x400));
        assert_eq!(plan.segments()[3].offset, 0xC00);
    }
}
