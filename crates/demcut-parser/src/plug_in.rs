// plug_in.rs — observer pipeline
//
// Plug-ins watch the three message kinds as the parser reconstructs them.
// They get read-only views: the parser context owns the plug-in
// instances and passes them into each parse call, so a plug-in can never
// mutate parser state.

use std::any::Any;

use demcut_common::qshared::{EntityState, Snapshot};

use crate::parser::Parser;

#[derive(Debug, Clone, Copy)]
pub struct GamestateInfo {
    pub server_command_sequence: i32,
    pub client_num: i32,
    pub checksum_feed: i32,
    /// Offset of the gamestate message within the input file.
    pub file_offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandInfo<'a> {
    pub command_sequence: i32,
    /// The full command text, with big-config-string pieces already
    /// assembled.
    pub string: &'a str,
    /// Valid when `is_config_string` is set.
    pub config_string_index: i32,
    pub is_config_string: bool,
}

/// An entity that was added or changed by the current snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ChangedEntity {
    pub state: EntityState,
    /// Set when the entity carries an event seen for the first time, as
    /// opposed to the repeat window of an already-delivered event.
    pub is_new_event: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotInfo<'a> {
    pub server_time: i32,
    pub snapshot_array_index: i32,
    pub snapshot: &'a Snapshot,
    pub old_snapshot: Option<&'a Snapshot>,
    /// Added or changed entities, this snapshot only.
    pub entities: &'a [ChangedEntity],
    /// Numbers of entities removed by this snapshot.
    pub removed_entities: &'a [i32],
}

pub trait ParserPlugIn: Send {
    /// A new demo is about to be parsed.
    fn start_processing_demo(&mut self) {}

    /// The demo finished (successfully or not).
    fn finish_processing_demo(&mut self) {}

    fn process_gamestate_message(&mut self, _info: &GamestateInfo, _parser: &Parser) {}

    fn process_command_message(&mut self, _info: &CommandInfo, _parser: &Parser) {}

    fn process_snapshot_message(&mut self, _info: &SnapshotInfo, _parser: &Parser) {}

    /// Downcast support for per-demo output queries.
    fn as_any(&self) -> &dyn Any;
}

pub type PlugInList = Vec<Box<dyn ParserPlugIn>>;
