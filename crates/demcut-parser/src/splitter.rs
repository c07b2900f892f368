// splitter.rs — gamestate boundary collection
//
// A demo recorded across several map loads carries one gamestate per
// segment. This plug-in records where each gamestate starts so the split
// operation can copy the byte ranges between them into standalone files.

use std::any::Any;

use crate::parser::Parser;
use crate::plug_in::{GamestateInfo, ParserPlugIn};

#[derive(Default)]
pub struct GamestateCollector {
    demos: Vec<Vec<u32>>,
}

impl GamestateCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn demo_count(&self) -> usize {
        self.demos.len()
    }

    pub fn gamestate_offsets(&self, demo_index: usize) -> &[u32] {
        self.demos
            .get(demo_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl ParserPlugIn for GamestateCollector {
    fn start_processing_demo(&mut self) {
        self.demos.push(Vec::new());
    }

    fn process_gamestate_message(&mut self, info: &GamestateInfo, _parser: &Parser) {
        if let Some(offsets) = self.demos.last_mut() {
            offsets.push(info.file_offset);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Byte ranges to copy when splitting on gamestate boundaries. Empty when
/// the file holds a single gamestate starting at offset zero (nothing to
/// split). The final range runs to `file_length`.
pub fn split_ranges(offsets: &[u32], file_length: u32) -> Vec<(u32, u32)> {
    if offsets.is_empty() || (offsets.len() == 1 && offsets[0] == 0) {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut start = 0u32;
    for &offset in offsets {
        if start != offset {
            ranges.push((start, offset));
        }
        start = offset;
    }
    if start < file_length {
        ranges.push((start, file_length));
    }
    ranges
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_gamestate_at_start_is_not_split() {
        assert!(split_ranges(&[0], 5000).is_empty());
        assert!(split_ranges(&[], 5000).is_empty());
    }

    #[test]
    fn test_two_gamestates() {
        // Segment per gamestate, last one running to end of file.
        assert_eq!(split_ranges(&[0, 2000], 5000), [(0, 2000), (2000, 5000)]);
    }

    #[test]
    fn test_three_gamestates_not_at_origin() {
        assert_eq!(
            split_ranges(&[100, 2000, 4000], 5000),
            [(0, 100), (100, 2000), (2000, 4000), (4000, 5000)]
        );
    }

    #[test]
    fn test_collector_tracks_per_demo() {
        let mut collector = GamestateCollector::new();
        collector.start_processing_demo();
        assert_eq!(collector.demo_count(), 1);
        assert!(collector.gamestate_offsets(0).is_empty());
        assert!(collector.gamestate_offsets(7).is_empty());
    }
}
