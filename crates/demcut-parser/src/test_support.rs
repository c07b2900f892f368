// test_support.rs — shared fixtures: synthetic demo messages and a
// recording plug-in. Compiled for tests only.

use std::any::Any;
use std::io::Write;
use std::sync::{Arc, Mutex};

use demcut_common::msg::Message;
use demcut_common::qshared::{
    EntityState, PlayerState, Protocol, ENTITYNUM_NONE, GENTITYNUM_BITS, MAX_MSGLEN,
    SVC_BASELINE, SVC_CONFIGSTRING, SVC_EOF, SVC_GAMESTATE, SVC_SERVERCOMMAND, SVC_SNAPSHOT,
};

use crate::parser::{Parser, StreamCreator};
use crate::plug_in::{CommandInfo, GamestateInfo, ParserPlugIn, PlugInList, SnapshotInfo};

// ============================================================
// Message payload builders (the server side of the wire)
// ============================================================

pub fn out_msg_for(protocol: Protocol) -> Message {
    let mut m = Message::with_capacity(MAX_MSGLEN * 4);
    m.set_huffman(protocol.uses_huffman());
    m
}

pub fn finish(m: Message) -> Vec<u8> {
    m.data[..m.cursize].to_vec()
}

pub fn gamestate_payload(
    protocol: Protocol,
    command_sequence: i32,
    config_strings: &[(i32, &str)],
    baselines: &[EntityState],
    client_num: i32,
) -> Vec<u8> {
    let mut m = out_msg_for(protocol);
    m.write_long(0);
    m.write_byte(SVC_GAMESTATE);
    m.write_long(command_sequence);
    for (index, value) in config_strings {
        m.write_byte(SVC_CONFIGSTRING);
        m.write_short(*index);
        m.write_big_string(value);
    }
    let null_state = EntityState::default();
    for baseline in baselines {
        m.write_byte(SVC_BASELINE);
        m.write_delta_entity(protocol, &null_state, Some(baseline), true);
    }
    m.write_byte(SVC_EOF);
    if protocol >= Protocol::Dm66 {
        m.write_long(client_num);
        m.write_long(0x5eed);
    }
    m.write_byte(SVC_EOF);
    finish(m)
}

pub fn command_payload(protocol: Protocol, ack: i32, sequence: i32, text: &str) -> Vec<u8> {
    let mut m = out_msg_for(protocol);
    m.write_long(ack);
    m.write_byte(SVC_SERVERCOMMAND);
    m.write_long(sequence);
    m.write_string(text);
    m.write_byte(SVC_EOF);
    finish(m)
}

pub fn snapshot_payload(
    protocol: Protocol,
    ack: i32,
    server_time: i32,
    delta_offset: i32,
    old_ps: Option<&PlayerState>,
    ps: &PlayerState,
    entities: impl FnOnce(&mut Message),
) -> Vec<u8> {
    let mut m = out_msg_for(protocol);
    m.write_long(ack);
    m.write_byte(SVC_SNAPSHOT);
    m.write_long(server_time);
    m.write_byte(delta_offset);
    m.write_byte(0); // snapFlags
    m.write_byte(0); // empty areamask
    m.write_delta_player(protocol, old_ps, ps);
    entities(&mut m);
    m.write_bits(ENTITYNUM_NONE, GENTITYNUM_BITS);
    m.write_byte(SVC_EOF);
    finish(m)
}

// ============================================================
// Demo file assembly
// ============================================================

pub fn push_frame(demo: &mut Vec<u8>, sequence: i32, payload: &[u8]) {
    demo.extend_from_slice(&sequence.to_le_bytes());
    demo.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    demo.extend_from_slice(payload);
}

pub fn push_terminator(demo: &mut Vec<u8>) {
    demo.extend_from_slice(&(-1i32).to_le_bytes());
    demo.extend_from_slice(&(-1i32).to_le_bytes());
}

/// Split framed demo bytes into (sequence, payload) records; the bool
/// reports whether the double -1 terminator was present.
pub fn split_frames(bytes: &[u8]) -> (Vec<(i32, Vec<u8>)>, bool) {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 8 <= bytes.len() {
        let seq = i32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        let len = i32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
        pos += 8;
        if len == -1 {
            return (frames, seq == -1);
        }
        let len = len as usize;
        frames.push((seq, bytes[pos..pos + len].to_vec()));
        pos += len;
    }
    (frames, false)
}

// ============================================================
// Recording plug-in
// ============================================================

#[derive(Default)]
pub struct Recorder {
    pub gamestates: Vec<GamestateInfo>,
    pub commands: Vec<String>,
    pub command_indices: Vec<i32>,
    /// (server_time, changed entity numbers, removed entity numbers)
    pub snapshots: Vec<(i32, Vec<i32>, Vec<i32>)>,
    pub new_events: Vec<i32>,
    pub started: u32,
    pub finished: u32,
}

impl ParserPlugIn for Recorder {
    fn start_processing_demo(&mut self) {
        self.started += 1;
    }

    fn finish_processing_demo(&mut self) {
        self.finished += 1;
    }

    fn process_gamestate_message(&mut self, info: &GamestateInfo, _parser: &Parser) {
        self.gamestates.push(*info);
    }

    fn process_command_message(&mut self, info: &CommandInfo, _parser: &Parser) {
        self.commands.push(info.string.to_string());
        self.command_indices.push(info.config_string_index);
    }

    fn process_snapshot_message(&mut self, info: &SnapshotInfo, _parser: &Parser) {
        self.snapshots.push((
            info.server_time,
            info.entities.iter().map(|e| e.state.number).collect(),
            info.removed_entities.to_vec(),
        ));
        for entity in info.entities {
            if entity.is_new_event {
                self.new_events.push(entity.state.number);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn recorder(plug_ins: &PlugInList) -> &Recorder {
    plug_ins[0].as_any().downcast_ref::<Recorder>().unwrap()
}

// ============================================================
// In-memory output streams
// ============================================================

pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn memory_stream_creator(sink: Arc<Mutex<Vec<u8>>>) -> StreamCreator {
    Box::new(move |_arg| {
        Some((
            "cut_output.dm_68".to_string(),
            Box::new(SharedSink(sink.clone())) as Box<dyn Write + Send>,
        ))
    })
}
