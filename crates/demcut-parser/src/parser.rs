// parser.rs — the demo parser state machine and cut writer
//
// One Parser consumes one demo stream, one framed message at a time. It
// reconstructs commands, gamestates and snapshots (delta decoding against
// the snapshot and entity rings), feeds plug-ins, and mirrors the stream
// into an output message. When a cut window covers the current server
// time, the mirror is written out behind a synthesized opening gamestate.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use demcut_common::arena::{Arena, ArenaRange};
use demcut_common::convert::{get_protocol_converter, ProtocolConverter};
use demcut_common::msg::Message;
use demcut_common::qshared::{
    EntityState, PlayerState, Protocol, Snapshot, ENTITYNUM_NONE, ET_EVENTS, EVENT_VALID_MSEC,
    GENTITYNUM_BITS, MAX_CONFIGSTRINGS, MAX_GENTITIES, MAX_MAP_AREA_BYTES, MAX_MSGLEN,
    MAX_PARSE_ENTITIES, MAX_STRING_CHARS, PACKET_BACKUP, PACKET_MASK, SVC_BAD, SVC_BASELINE,
    SVC_CONFIGSTRING, SVC_DOWNLOAD, SVC_EOF, SVC_EXTENSION, SVC_GAMESTATE, SVC_NOP,
    SVC_SERVERCOMMAND, SVC_SNAPSHOT, SVC_STRINGS, SVC_VOIP,
};
use demcut_common::tokenizer::Tokenizer;

use crate::context::Context;
use crate::plug_in::{ChangedEntity, CommandInfo, GamestateInfo, ParserPlugIn, SnapshotInfo};

// ============================================================
// Cut windows
// ============================================================

pub struct StreamCreatorArg<'a> {
    pub start_time_ms: i32,
    pub end_time_ms: i32,
    pub game_state_index: i32,
    pub very_short_desc: &'a str,
    pub input_file_name: &'a str,
    pub input_protocol: Protocol,
    pub output_protocol: Protocol,
}

/// Opens the output stream for a cut. Returns the display name of the
/// output and the stream itself; the parser owns the stream thereafter.
/// Path policy stays entirely on the caller's side.
pub type StreamCreator =
    Box<dyn FnMut(&StreamCreatorArg) -> Option<(String, Box<dyn Write + Send>)> + Send>;

pub struct CutInfo {
    pub game_state_index: i32,
    pub start_time_ms: i32,
    pub end_time_ms: i32,
    very_short_desc: ArenaRange,
    stream_creator: StreamCreator,
    stream: Option<Box<dyn Write + Send>>,
}

/// Cross-message big-config-string assembly.
enum BigConfigString {
    Idle,
    Assembling { index: i32, data: String },
}

fn write_framed_message(
    stream: &mut (dyn Write + Send),
    sequence: i32,
    msg: &Message,
) -> std::io::Result<()> {
    stream.write_i32::<LittleEndian>(sequence)?;
    stream.write_i32::<LittleEndian>(msg.cursize as i32)?;
    stream.write_all(&msg.data[..msg.cursize])
}

// ============================================================
// Parser
// ============================================================

pub struct Parser {
    in_protocol: Protocol,
    out_protocol: Protocol,
    converter: Box<dyn ProtocolConverter + Send>,
    enable_plug_ins: bool,
    fatal_error: bool,

    in_msg: Message,
    in_file_name: String,
    in_file_offset: u32,

    in_server_message_sequence: i32,
    in_server_command_sequence: i32,
    in_reliable_sequence_acknowledge: i32,
    in_client_num: i32,
    in_checksum_feed: i32,
    in_parse_entities_num: i32,
    in_game_state_index: i32,
    in_server_time: i32,
    in_last_snapshot_message_number: i32,

    in_game_state_file_offsets: Vec<u32>,
    in_config_strings: Vec<Option<ArenaRange>>,
    in_baselines: Vec<EntityState>,
    in_snapshots: Vec<Snapshot>,
    in_snapshot: Snapshot,
    in_parse_entities: Vec<EntityState>,
    in_entity_event_times_ms: Vec<i32>,
    in_changed_entities: Vec<ChangedEntity>,
    in_removed_entities: Vec<i32>,

    big_config_string: BigConfigString,
    tokenizer: Tokenizer,

    persistent_allocator: Arena,
    config_string_allocator: Arena,
    temp_allocator: Arena,
    private_temp_allocator: Arena,

    cuts: Vec<CutInfo>,
    out_msg: Message,
    out_file_name: String,
    out_server_command_sequence: i32,
    out_snapshots_written: i32,
    out_write_message: bool,
    out_write_first_message: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            in_protocol: Protocol::Dm68,
            out_protocol: Protocol::Dm68,
            converter: get_protocol_converter(Protocol::Dm68, Protocol::Dm68),
            enable_plug_ins: true,
            fatal_error: false,

            in_msg: Message::with_capacity(MAX_MSGLEN),
            in_file_name: String::new(),
            in_file_offset: 0,

            in_server_message_sequence: -1,
            in_server_command_sequence: -1,
            in_reliable_sequence_acknowledge: -1,
            in_client_num: -1,
            in_checksum_feed: -1,
            in_parse_entities_num: 0,
            in_game_state_index: -1,
            in_server_time: i32::MIN,
            in_last_snapshot_message_number: i32::MIN,

            in_game_state_file_offsets: Vec::new(),
            in_config_strings: vec![None; MAX_CONFIGSTRINGS],
            in_baselines: vec![EntityState::default(); MAX_GENTITIES as usize],
            in_snapshots: vec![Snapshot::default(); PACKET_BACKUP as usize],
            in_snapshot: Snapshot::default(),
            in_parse_entities: vec![EntityState::default(); MAX_PARSE_ENTITIES as usize],
            in_entity_event_times_ms: vec![i32::MIN; MAX_GENTITIES as usize],
            in_changed_entities: Vec::new(),
            in_removed_entities: Vec::new(),

            big_config_string: BigConfigString::Idle,
            tokenizer: Tokenizer::new(),

            persistent_allocator: Arena::with_capacity(1 << 18, "parser persistent"),
            config_string_allocator: Arena::with_capacity(1 << 20, "parser config strings"),
            temp_allocator: Arena::with_capacity(1 << 18, "parser temp"),
            private_temp_allocator: Arena::with_capacity(1 << 16, "parser private temp"),

            cuts: Vec::new(),
            out_msg: Message::with_capacity(MAX_MSGLEN),
            out_file_name: String::new(),
            out_server_command_sequence: 0,
            out_snapshots_written: 0,
            out_write_message: false,
            out_write_first_message: false,
        }
    }

    /// Prepare for a new input stream. `game_state_index` is where counting
    /// starts when the caller seeks into the middle of a multi-gamestate
    /// file; every skipped index gets a zero entry in the offset table.
    pub fn init(
        &mut self,
        in_protocol: Protocol,
        out_protocol: Protocol,
        game_state_index: i32,
        enable_plug_ins: bool,
    ) -> bool {
        if game_state_index < 0 {
            return false;
        }

        self.in_protocol = in_protocol;
        self.out_protocol = out_protocol;
        self.converter = get_protocol_converter(out_protocol, in_protocol);
        self.enable_plug_ins = enable_plug_ins;
        self.fatal_error = false;

        self.in_file_name.clear();
        self.in_file_offset = 0;
        self.cuts.clear();
        self.persistent_allocator.clear();

        self.reset_for_gamestate();

        self.out_file_name.clear();
        self.out_server_command_sequence = 0;
        self.out_snapshots_written = 0;
        self.out_write_message = false;
        self.out_write_first_message = false;

        self.in_game_state_index = game_state_index - 1;
        self.in_game_state_file_offsets.clear();
        for _ in 0..game_state_index {
            self.in_game_state_file_offsets.push(0);
        }

        true
    }

    pub fn set_file_name(&mut self, name: &str) {
        self.in_file_name = name.to_string();
        self.in_msg.set_file_name(name);
    }

    pub fn add_cut(
        &mut self,
        game_state_index: i32,
        start_time_ms: i32,
        end_time_ms: i32,
        very_short_desc: &str,
        stream_creator: StreamCreator,
    ) {
        let very_short_desc = self.persistent_allocator.alloc_str(very_short_desc);
        self.cuts.push(CutInfo {
            game_state_index,
            start_time_ms,
            end_time_ms,
            very_short_desc,
            stream_creator,
            stream: None,
        });
    }

    pub fn cut_count(&self) -> usize {
        self.cuts.len()
    }

    pub fn had_fatal_error(&self) -> bool {
        self.fatal_error
    }

    pub fn plug_ins_enabled(&self) -> bool {
        self.enable_plug_ins
    }

    // ------------------------------------------------------------
    // Read-only views (plug-ins, analyzers, the API layer)
    // ------------------------------------------------------------

    pub fn protocol(&self) -> Protocol {
        self.in_protocol
    }

    pub fn output_protocol(&self) -> Protocol {
        self.out_protocol
    }

    pub fn game_state_index(&self) -> i32 {
        self.in_game_state_index
    }

    pub fn server_time(&self) -> i32 {
        self.in_server_time
    }

    pub fn client_num(&self) -> i32 {
        self.in_client_num
    }

    /// Write cursor of the entity parse ring; advances once per
    /// non-removal entity delta.
    pub fn parse_entities_num(&self) -> i32 {
        self.in_parse_entities_num
    }

    pub fn file_name(&self) -> &str {
        &self.in_file_name
    }

    /// File offset of each gamestate seen so far, for random access.
    pub fn game_state_file_offsets(&self) -> &[u32] {
        &self.in_game_state_file_offsets
    }

    pub fn config_string(&self, index: i32) -> Option<&str> {
        if index < 0 || index >= MAX_CONFIGSTRINGS as i32 {
            return None;
        }
        self.in_config_strings[index as usize]
            .map(|range| self.config_string_allocator.get_str(range))
    }

    // ------------------------------------------------------------
    // Per-gamestate reset
    // ------------------------------------------------------------

    fn reset_for_gamestate(&mut self) {
        self.in_server_message_sequence = -1;
        self.in_server_command_sequence = -1;
        self.in_reliable_sequence_acknowledge = -1;
        self.in_client_num = -1;
        self.in_checksum_feed = -1;
        self.in_parse_entities_num = 0;
        self.in_server_time = i32::MIN;
        self.in_last_snapshot_message_number = i32::MIN;

        for baseline in &mut self.in_baselines {
            *baseline = EntityState::default();
        }
        for snapshot in &mut self.in_snapshots {
            *snapshot = Snapshot::default();
        }
        self.in_snapshot = Snapshot::default();
        self.in_config_strings.fill(None);
        self.in_entity_event_times_ms.fill(i32::MIN);
        self.big_config_string = BigConfigString::Idle;

        self.config_string_allocator.clear();
        self.temp_allocator.clear();
        self.private_temp_allocator.clear();
    }

    // ------------------------------------------------------------
    // Message entry point
    // ------------------------------------------------------------

    /// Parse one framed message. Returns false when parsing should stop:
    /// either the stream desynchronized (see had_fatal_error) or the last
    /// cut window was finished.
    pub fn parse_next_message(
        &mut self,
        ctx: &mut Context,
        plug_ins: &mut [Box<dyn ParserPlugIn>],
        sequence: i32,
        file_offset: u32,
        payload: &[u8],
    ) -> bool {
        self.in_msg.init_read(payload);
        self.in_server_message_sequence = sequence;
        self.in_file_offset = file_offset;
        self.parse_server_message(ctx, plug_ins)
    }

    fn parse_server_message(
        &mut self,
        ctx: &mut Context,
        plug_ins: &mut [Box<dyn ParserPlugIn>],
    ) -> bool {
        self.out_msg.init_write();
        self.out_msg.set_huffman(self.out_protocol.uses_huffman());
        self.in_msg.set_huffman(self.in_protocol.uses_huffman());

        // The message sequence number doubles as the acknowledge number for
        // protocols that never carried one; that keeps converted legacy
        // demos from tripping the client's command overflow check.
        let mut reliable_ack = self.in_server_message_sequence;
        if self.in_protocol > Protocol::Dm3 {
            let ack = self.in_msg.read_long();
            if self.in_protocol >= Protocol::Dm68 {
                reliable_ack = ack;
            }
        }
        self.in_reliable_sequence_acknowledge = reliable_ack;
        self.out_msg.write_long(reliable_ack);

        loop {
            if !self.in_msg.valid_state() {
                ctx.log_error(&format!(
                    "parse_server_message: read past the end of the server message (in file: {})",
                    self.in_file_name
                ));
                self.fatal_error = true;
                return false;
            }
            if self.in_msg.at_end() {
                break;
            }

            let mut command = self.in_msg.read_byte();

            if self.in_protocol >= Protocol::Dm90
                && command == SVC_EOF
                && self.in_msg.peek_byte() == SVC_EXTENSION
            {
                // Extension data after the EOF that legacy clients ignore.
                self.in_msg.read_byte();
                command = self.in_msg.read_byte();
                // Dangling Huffman bits at the very end decode to junk.
                if !self.in_msg.valid_state() {
                    command = SVC_EOF;
                }
            }

            if command == SVC_EOF
                || (self.in_protocol <= Protocol::Dm48 && command == SVC_BAD)
            {
                break;
            }

            match command {
                SVC_NOP => {
                    self.out_msg.write_byte(SVC_NOP);
                }
                SVC_SERVERCOMMAND => {
                    if !self.parse_command_string(ctx, plug_ins) {
                        self.fatal_error = true;
                        return false;
                    }
                }
                SVC_GAMESTATE => {
                    if !self.parse_gamestate(ctx, plug_ins) {
                        self.fatal_error = true;
                        return false;
                    }
                }
                SVC_SNAPSHOT => {
                    if !self.parse_snapshot(ctx, plug_ins) {
                        self.fatal_error = true;
                        return false;
                    }
                }
                SVC_VOIP | SVC_DOWNLOAD => {
                    ctx.log_warning(&format!(
                        "parse_server_message: skipping {}",
                        SVC_STRINGS[command as usize]
                    ));
                    self.out_msg.write_byte(SVC_NOP);
                }
                _ => {
                    ctx.log_error(&format!(
                        "parse_server_message: unrecognized server message command byte: {} (in file: {})",
                        command, self.in_file_name
                    ));
                    self.fatal_error = true;
                    return false;
                }
            }

            if self.in_protocol.byte_aligned() {
                self.in_msg.go_to_next_byte();
            }
        }

        self.out_msg.write_byte(SVC_EOF);

        // The per-message temp region dies with the message.
        self.temp_allocator.clear();

        self.tick_cut_scheduler(ctx)
    }

    // ------------------------------------------------------------
    // Cut scheduler
    // ------------------------------------------------------------

    fn tick_cut_scheduler(&mut self, ctx: &mut Context) -> bool {
        if !self.cuts.is_empty() {
            let game_time = self.in_server_time;
            let (cut_gs, cut_start, cut_end) = {
                let cut = &self.cuts[0];
                (cut.game_state_index, cut.start_time_ms, cut.end_time_ms)
            };

            if self.in_game_state_index == cut_gs
                && !self.out_write_message
                && game_time >= cut_start
                && game_time <= cut_end
            {
                self.out_write_message = true;
                self.out_write_first_message = true;
            } else if (self.in_game_state_index == cut_gs
                && self.out_write_message
                && game_time > cut_end)
                || (self.in_game_state_index > cut_gs && self.out_write_message)
            {
                self.write_last_message();
                self.out_write_message = false;
                self.out_write_first_message = false;
                self.out_server_command_sequence = 0;
                self.out_snapshots_written = 0;
                self.cuts.remove(0);
                if self.cuts.is_empty() {
                    // That was the last cut; we are done with this file.
                    return false;
                }
            }
        }

        if self.out_write_first_message {
            if !self.open_cut_stream(ctx) {
                return true;
            }
            self.write_first_message(ctx);
            self.out_write_first_message = false;
        } else if self.out_write_message {
            self.write_next_message(ctx);
        }

        true
    }

    fn open_cut_stream(&mut self, ctx: &mut Context) -> bool {
        let created = {
            let cut = &mut self.cuts[0];
            let arg = StreamCreatorArg {
                start_time_ms: cut.start_time_ms,
                end_time_ms: cut.end_time_ms,
                game_state_index: cut.game_state_index,
                very_short_desc: self.persistent_allocator.get_str(cut.very_short_desc),
                input_file_name: &self.in_file_name,
                input_protocol: self.in_protocol,
                output_protocol: self.out_protocol,
            };
            (cut.stream_creator)(&arg)
        };

        match created {
            Some((name, stream)) => {
                self.cuts[0].stream = Some(stream);
                self.out_file_name = name;
                true
            }
            None => {
                // Soft failure: drop the window, keep parsing.
                ctx.log_warning("could not create the cut output stream, dropping the cut");
                self.cuts.remove(0);
                self.out_write_message = false;
                self.out_write_first_message = false;
                false
            }
        }
    }

    fn should_write_message(&self) -> bool {
        self.out_write_message && self.out_protocol.uses_huffman()
    }

    /// First record of every cut: a synthesized gamestate carrying the
    /// current config strings and non-empty baselines, followed by the
    /// message that opened the window.
    fn write_first_message(&mut self, ctx: &mut Context) {
        let gs_msg = self.build_game_state_message();
        if !gs_msg.valid_state() {
            ctx.log_error("write_first_message: synthesized gamestate overflowed");
        }

        let sequence = self.in_server_message_sequence;
        let result = {
            let cut = &mut self.cuts[0];
            match cut.stream.as_mut() {
                Some(stream) => write_framed_message(stream.as_mut(), sequence, &gs_msg)
                    .and_then(|_| write_framed_message(stream.as_mut(), sequence, &self.out_msg)),
                None => Ok(()),
            }
        };

        if let Err(err) = result {
            ctx.log_error(&format!(
                "write_first_message: {} (writing {})",
                err, self.out_file_name
            ));
            self.cuts.remove(0);
            self.out_write_message = false;
        }
    }

    fn write_next_message(&mut self, ctx: &mut Context) {
        let sequence = self.in_server_message_sequence;
        let result = {
            let cut = &mut self.cuts[0];
            match cut.stream.as_mut() {
                Some(stream) => write_framed_message(stream.as_mut(), sequence, &self.out_msg),
                None => Ok(()),
            }
        };

        if let Err(err) = result {
            ctx.log_error(&format!(
                "write_next_message: {} (writing {})",
                err, self.out_file_name
            ));
            self.cuts.remove(0);
            self.out_write_message = false;
        }
    }

    /// Two -1 length markers close the stream.
    fn write_last_message(&mut self) {
        if let Some(cut) = self.cuts.first_mut() {
            if let Some(stream) = cut.stream.as_mut() {
                let _ = stream.write_i32::<LittleEndian>(-1);
                let _ = stream.write_i32::<LittleEndian>(-1);
                let _ = stream.flush();
            }
            cut.stream = None;
        }
    }

    /// Close any stream still open at end of input. On a clean finish the
    /// end-of-stream markers are written; on abort the stream is dropped
    /// as-is and readers must tolerate the truncation.
    pub fn finish_parsing(
        &mut self,
        plug_ins: &mut [Box<dyn ParserPlugIn>],
        success: bool,
    ) {
        if !self.cuts.is_empty() && self.out_write_message {
            if success {
                self.write_last_message();
            }
            self.out_write_message = false;
            self.out_write_first_message = false;
            self.out_server_command_sequence = 0;
            self.out_snapshots_written = 0;
            self.cuts.clear();
        }

        if self.enable_plug_ins {
            for plug_in in plug_ins.iter_mut() {
                plug_in.finish_processing_demo();
            }
        }
    }

    fn build_game_state_message(&mut self) -> Message {
        let mut msg = Message::with_capacity(MAX_MSGLEN);
        msg.set_huffman(self.out_protocol.uses_huffman());

        msg.write_long(self.in_reliable_sequence_acknowledge);
        msg.write_byte(SVC_GAMESTATE);
        msg.write_long(self.out_server_command_sequence);
        self.out_server_command_sequence += 1;

        self.converter.start_game_state();

        for index in 0..MAX_CONFIGSTRINGS {
            let range = match self.in_config_strings[index] {
                Some(range) if !range.is_empty() => range,
                _ => continue,
            };
            let cs = self.config_string_allocator.get_str(range);

            if self.out_protocol == self.in_protocol {
                msg.write_byte(SVC_CONFIGSTRING);
                msg.write_short(index as i32);
                msg.write_big_string(cs);
                continue;
            }

            if let Some(conv) = self.converter.convert_config_string(index as i32, cs) {
                if conv.index >= 0 && !conv.string.is_empty() {
                    msg.write_byte(SVC_CONFIGSTRING);
                    msg.write_short(conv.index);
                    msg.write_big_string(&conv.string);
                }
            }
        }

        let null_state = EntityState::default();
        for index in 0..MAX_GENTITIES as usize {
            let baseline = self.in_baselines[index];
            if baseline.is_zeroed() {
                continue;
            }
            msg.write_byte(SVC_BASELINE);
            let converted = self.converter.convert_entity_state(&baseline);
            msg.write_delta_entity(self.out_protocol, &null_state, Some(&converted), true);
        }

        msg.write_byte(SVC_EOF);
        msg.write_long(self.in_client_num);
        msg.write_long(self.in_checksum_feed);
        msg.write_byte(SVC_EOF);

        msg
    }

    // ------------------------------------------------------------
    // svc_serverCommand
    // ------------------------------------------------------------

    fn parse_command_string(
        &mut self,
        ctx: &mut Context,
        plug_ins: &mut [Box<dyn ParserPlugIn>],
    ) -> bool {
        let command_sequence = self.in_msg.read_long();
        let command_text = self.in_msg.read_string();

        // Already seen this one.
        if self.in_server_command_sequence >= command_sequence {
            return true;
        }
        self.in_server_command_sequence = command_sequence;

        let mut command = command_text;
        let mut cs_index: i32 = -1;
        let mut is_config_string = false;
        let mut plug_in_skips_this_command = false;

        loop {
            self.tokenizer.tokenize(&command);
            let argc = self.tokenizer.argc();
            let name = self.tokenizer.argv(0).to_string();

            match name.as_str() {
                "cs" if argc == 3 => {
                    if let Ok(index) = self.tokenizer.argv(1).parse::<i32>() {
                        if index >= 0 && (index as usize) < MAX_CONFIGSTRINGS {
                            is_config_string = true;
                            cs_index = index;
                            let value = self.tokenizer.argv(2).to_string();

                            if let Some(conv) =
                                self.converter.convert_config_string(index, &value)
                            {
                                if conv.new_string || conv.index != index {
                                    let rebuilt = self.private_temp_allocator.alloc_str(
                                        &format!("cs {} \"{}\"", conv.index, conv.string),
                                    );
                                    command = self
                                        .private_temp_allocator
                                        .get_str(rebuilt)
                                        .to_string();
                                }
                            }

                            // Store the input-side string.
                            let range = self.config_string_allocator.alloc_str(&value);
                            self.in_config_strings[index as usize] = Some(range);
                        }
                    }
                }
                "bcs0" if argc == 3 => {
                    // Start a new big config string.
                    let index = self.tokenizer.argv(1).parse().unwrap_or(-1);
                    self.big_config_string = BigConfigString::Assembling {
                        index,
                        data: self.tokenizer.argv(2).to_string(),
                    };
                    plug_in_skips_this_command = true;
                }
                "bcs1" if argc == 3 => {
                    // Append to the current big config string.
                    if let BigConfigString::Assembling { data, .. } = &mut self.big_config_string
                    {
                        data.push_str(self.tokenizer.argv(2));
                    } else {
                        ctx.log_warning("bcs1 without a preceding bcs0, ignored");
                    }
                    plug_in_skips_this_command = true;
                }
                "bcs2" if argc == 3 => {
                    // Final piece: assemble and re-enter as a cs command.
                    let piece = self.tokenizer.argv(2).to_string();
                    match std::mem::replace(&mut self.big_config_string, BigConfigString::Idle) {
                        BigConfigString::Assembling { index, data } => {
                            command = format!("cs {} \"{}{}\"", index, data, piece);
                            continue;
                        }
                        BigConfigString::Idle => {
                            ctx.log_warning("bcs2 without a preceding bcs0, ignored");
                            plug_in_skips_this_command = true;
                        }
                    }
                }
                _ => {}
            }
            break;
        }

        // Plug-ins never see the raw assembly pieces, only the final cs.
        if self.enable_plug_ins && !plug_ins.is_empty() && !plug_in_skips_this_command {
            let info = CommandInfo {
                command_sequence,
                string: &command,
                config_string_index: cs_index,
                is_config_string,
            };
            for plug_in in plug_ins.iter_mut() {
                plug_in.process_command_message(&info, self);
            }
        }

        if self.should_write_message() && !plug_in_skips_this_command {
            if cs_index >= 0 && command.len() >= MAX_STRING_CHARS {
                let index_arg = self.tokenizer.argv(1).to_string();
                let value_arg = self.tokenizer.argv(2).to_string();
                self.write_big_config_string_command(&index_arg, &value_arg);
            } else if command.len() < MAX_STRING_CHARS {
                self.out_msg.write_byte(SVC_SERVERCOMMAND);
                self.out_msg.write_long(self.out_server_command_sequence);
                self.out_msg.write_string(&command);
                self.out_server_command_sequence += 1;
            } else {
                self.out_msg.write_byte(SVC_NOP);
            }
        }

        self.private_temp_allocator.clear();

        true
    }

    /// Split an oversized config-string command into the smallest chain of
    /// bcs0 / bcs1* / bcs2 pieces whose every command fits the wire limit.
    fn write_big_config_string_command(&mut self, cs_index: &str, cs_data: &str) {
        let max_length_per_cmd = MAX_STRING_CHARS - 2;
        let per_cmd_overhead = 8 + cs_index.len();
        let max_data_length = max_length_per_cmd - per_cmd_overhead;

        let mut chunks = 2;
        loop {
            let per_cmd_data = (cs_data.len() + chunks - 1) / chunks;
            if per_cmd_data + per_cmd_overhead <= max_length_per_cmd {
                break;
            }
            chunks += 1;
        }

        let mut scope = self.temp_allocator.scope();
        let mut offset = 0;
        for i in 0..chunks {
            let tag = if i == 0 {
                '0'
            } else if i == chunks - 1 {
                '2'
            } else {
                '1'
            };
            let mut end = if tag == '2' {
                cs_data.len()
            } else {
                (offset + max_data_length).min(cs_data.len())
            };
            while !cs_data.is_char_boundary(end) {
                end -= 1;
            }
            let piece = &cs_data[offset..end];

            let range = scope.alloc_str(&format!("bcs{} {} \"{}\"", tag, cs_index, piece));
            self.out_msg.write_byte(SVC_SERVERCOMMAND);
            self.out_msg.write_long(self.out_server_command_sequence);
            self.out_msg.write_string(scope.get_str(range));
            self.out_server_command_sequence += 1;

            offset = end;
        }
    }

    // ------------------------------------------------------------
    // svc_gamestate
    // ------------------------------------------------------------

    fn parse_gamestate(
        &mut self,
        ctx: &mut Context,
        plug_ins: &mut [Box<dyn ParserPlugIn>],
    ) -> bool {
        self.reset_for_gamestate();

        // A gamestate always marks a server command sequence.
        self.in_server_command_sequence = self.in_msg.read_long();

        loop {
            let command = self.in_msg.read_byte();

            if self.in_protocol <= Protocol::Dm48 && command == SVC_BAD {
                break;
            }
            if command == SVC_EOF {
                break;
            }

            if command == SVC_CONFIGSTRING {
                let index = self.in_msg.read_short();
                if index < 0 || index >= MAX_CONFIGSTRINGS as i32 {
                    ctx.log_error(&format!(
                        "parse_gamestate: config string index out of range: {} (in file: {})",
                        index, self.in_file_name
                    ));
                    return false;
                }
                let value = self.in_msg.read_big_string();
                let range = self.config_string_allocator.alloc_str(&value);
                self.in_config_strings[index as usize] = Some(range);
            } else if command == SVC_BASELINE {
                let new_index = self.in_msg.read_bits(GENTITYNUM_BITS);
                if new_index < 0 || new_index >= MAX_GENTITIES {
                    ctx.log_error(&format!(
                        "parse_gamestate: baseline number out of range: {} (in file: {})",
                        new_index, self.in_file_name
                    ));
                    return false;
                }

                // Full entity, deltaed from the null state.
                let null_state = EntityState::default();
                let mut baseline = EntityState::default();
                let mut changed = false;
                if !self.in_msg.read_delta_entity(
                    self.in_protocol,
                    &mut changed,
                    &null_state,
                    &mut baseline,
                    new_index,
                ) {
                    ctx.log_error(&format!(
                        "parse_gamestate: bad baseline {} (in file: {})",
                        new_index, self.in_file_name
                    ));
                    return false;
                }
                self.in_baselines[new_index as usize] = baseline;
            } else {
                ctx.log_error(&format!(
                    "parse_gamestate: unrecognized command byte: {} (in file: {})",
                    command, self.in_file_name
                ));
                return false;
            }
        }

        if self.in_protocol >= Protocol::Dm66 {
            self.in_client_num = self.in_msg.read_long();
            self.in_checksum_feed = self.in_msg.read_long();
        } else {
            self.in_client_num = -1;
            self.in_checksum_feed = 0;
        }

        if self.enable_plug_ins && !plug_ins.is_empty() {
            let info = GamestateInfo {
                server_command_sequence: self.in_server_command_sequence,
                client_num: self.in_client_num,
                checksum_feed: self.in_checksum_feed,
                file_offset: self.in_file_offset,
            };
            for plug_in in plug_ins.iter_mut() {
                plug_in.process_gamestate_message(&info, self);
            }
        }

        self.in_game_state_index += 1;
        self.in_game_state_file_offsets.push(self.in_file_offset);

        true
    }

    // ------------------------------------------------------------
    // svc_snapshot
    // ------------------------------------------------------------

    fn parse_snapshot(
        &mut self,
        ctx: &mut Context,
        plug_ins: &mut [Box<dyn ParserPlugIn>],
    ) -> bool {
        if self.in_protocol == Protocol::Dm3 {
            self.in_msg.read_long(); // client command sequence
        }

        self.in_server_time = self.in_msg.read_long();

        let mut new_snap = Snapshot {
            server_command_num: self.in_server_command_sequence,
            server_time: self.in_server_time,
            message_num: self.in_server_message_sequence,
            ..Snapshot::default()
        };

        let mut delta_offset = self.in_msg.read_byte();
        new_snap.delta_num = if delta_offset == 0 {
            -1
        } else {
            new_snap.message_num - delta_offset
        };
        new_snap.snap_flags = self.in_msg.read_byte();

        // A snapshot delta compressed against data we no longer hold must
        // still be fully read to keep the stream in sync, then dropped.
        let mut old_snap: Option<Snapshot> = None;
        if new_snap.delta_num <= 0 {
            new_snap.valid = true; // uncompressed
        } else {
            if delta_offset >= PACKET_BACKUP {
                ctx.log_warning(&format!(
                    "parse_snapshot: delta offset {} invalid",
                    delta_offset
                ));
            }
            if new_snap.delta_num > self.in_server_message_sequence {
                ctx.log_warning("parse_snapshot: need delta from read ahead");
            }

            let old = self.in_snapshots[(new_snap.delta_num & PACKET_MASK) as usize];
            if !old.valid {
                ctx.log_warning(&format!(
                    "parse_snapshot: delta from invalid frame {} (not supposed to happen!)",
                    delta_offset
                ));
            } else if old.message_num != new_snap.delta_num {
                // The base got overwritten in the ring.
                ctx.log_warning(&format!(
                    "parse_snapshot: delta frame {} too old",
                    delta_offset
                ));
            } else if self.in_parse_entities_num - old.parse_entities_num
                > MAX_PARSE_ENTITIES - 128
            {
                ctx.log_warning(&format!(
                    "parse_snapshot: delta parse entities {} too old",
                    self.in_parse_entities_num
                ));
            } else {
                new_snap.valid = true;
            }
            old_snap = Some(old);
        }

        let area_mask_length = self.in_msg.read_byte();
        if area_mask_length as usize > MAX_MAP_AREA_BYTES {
            ctx.log_error(&format!(
                "parse_snapshot: invalid areamask size {} (in file: {})",
                area_mask_length, self.in_file_name
            ));
            return false;
        }
        self.in_msg
            .read_data(&mut new_snap.areamask[..area_mask_length as usize]);

        let old_ps = old_snap.map(|s| s.player_state);
        if !self.in_msg.read_delta_player(
            self.in_protocol,
            old_ps.as_ref(),
            &mut new_snap.player_state,
        ) {
            ctx.log_error(&format!(
                "parse_snapshot: bad player state (in file: {})",
                self.in_file_name
            ));
            return false;
        }

        if !self.parse_packet_entities(old_snap.as_ref(), &mut new_snap) {
            ctx.log_error(&format!(
                "parse_snapshot: bad packet entities (in file: {})",
                self.in_file_name
            ));
            return false;
        }

        // The output cannot delta against snapshots it never wrote.
        let mut write_old = if delta_offset == 0 { None } else { old_snap };
        if self.out_snapshots_written < delta_offset {
            delta_offset = 0;
            write_old = None;
        }

        // Dropped, but the stream stays synchronized.
        if !new_snap.valid {
            return true;
        }

        // Clear the valid flags of every snapshot between the previous one
        // and this one, so a dropped packet cannot masquerade as a delta
        // base after the ring wraps.
        let mut old_message_num = self.in_snapshot.message_num + 1;
        if new_snap.message_num - old_message_num >= PACKET_BACKUP {
            old_message_num = new_snap.message_num - (PACKET_BACKUP - 1);
        }
        while old_message_num < new_snap.message_num {
            self.in_snapshots[(old_message_num & PACKET_MASK) as usize].valid = false;
            old_message_num += 1;
        }

        self.in_snapshot = new_snap;
        self.in_snapshots[(new_snap.message_num & PACKET_MASK) as usize] = new_snap;

        // Duplicate read-ahead: never hand the same snapshot out twice.
        if new_snap.message_num == self.in_last_snapshot_message_number {
            return true;
        }
        self.in_last_snapshot_message_number = new_snap.message_num;

        if self.enable_plug_ins && !plug_ins.is_empty() {
            let info = SnapshotInfo {
                server_time: self.in_server_time,
                snapshot_array_index: new_snap.message_num & PACKET_MASK,
                snapshot: &new_snap,
                old_snapshot: old_snap.as_ref(),
                entities: &self.in_changed_entities,
                removed_entities: &self.in_removed_entities,
            };
            for plug_in in plug_ins.iter_mut() {
                plug_in.process_snapshot_message(&info, self);
            }
        }

        if self.should_write_message() {
            self.out_msg.write_byte(SVC_SNAPSHOT);
            self.out_msg.write_long(new_snap.server_time);
            self.out_msg.write_byte(delta_offset);
            self.out_msg.write_byte(new_snap.snap_flags);
            self.out_msg.write_byte(area_mask_length);
            self.out_msg
                .write_data(&new_snap.areamask[..area_mask_length as usize]);

            self.converter.start_snapshot(new_snap.server_time);

            if self.out_protocol == self.in_protocol {
                let from_ps = write_old.map(|s| s.player_state);
                self.out_msg.write_delta_player(
                    self.out_protocol,
                    from_ps.as_ref(),
                    &new_snap.player_state,
                );
                self.emit_packet_entities(write_old.as_ref(), &new_snap);
            } else {
                let old_conv = write_old.map(|s| self.converter.convert_snapshot(&s));
                let new_conv = self.converter.convert_snapshot(&new_snap);
                self.out_msg.write_delta_player(
                    self.out_protocol,
                    old_conv.as_ref().map(|s| &s.player_state),
                    &new_conv.player_state,
                );
                self.emit_packet_entities(old_conv.as_ref(), &new_conv);
            }
            self.out_snapshots_written += 1;
        }

        true
    }

    // ------------------------------------------------------------
    // Packet entities
    // ------------------------------------------------------------

    fn fetch_old_entity(&self, old_frame: &Snapshot, old_index: i32) -> (i32, EntityState) {
        if old_index >= old_frame.num_entities {
            (99999, EntityState::default())
        } else {
            let slot =
                ((old_frame.parse_entities_num + old_index) & (MAX_PARSE_ENTITIES - 1)) as usize;
            let state = self.in_parse_entities[slot];
            (state.number, state)
        }
    }

    fn parse_packet_entities(
        &mut self,
        old_frame: Option<&Snapshot>,
        new_frame: &mut Snapshot,
    ) -> bool {
        self.in_changed_entities.clear();
        self.in_removed_entities.clear();

        new_frame.parse_entities_num = self.in_parse_entities_num;
        new_frame.num_entities = 0;

        let (mut old_num, mut old_state) = match old_frame {
            None => (99999, EntityState::default()),
            Some(of) => self.fetch_old_entity(of, 0),
        };
        let mut old_index = 0;

        loop {
            let new_num = self.in_msg.read_bits(GENTITYNUM_BITS);
            if new_num == ENTITYNUM_NONE {
                break;
            }
            if !self.in_msg.valid_state() {
                return false;
            }

            while old_num < new_num {
                // One or more entities from the old snapshot are unchanged.
                if !self.delta_entity(new_frame, old_num, &old_state, true) {
                    return false;
                }
                old_index += 1;
                let of = old_frame.expect("carried entities require an old frame");
                (old_num, old_state) = self.fetch_old_entity(of, old_index);
            }

            if old_num == new_num {
                // Delta from the previous state.
                let base = old_state;
                if !self.delta_entity(new_frame, new_num, &base, false) {
                    return false;
                }
                old_index += 1;
                let of = old_frame.expect("matched entities require an old frame");
                (old_num, old_state) = self.fetch_old_entity(of, old_index);
                continue;
            }

            // old_num > new_num: a new entity, delta from its baseline.
            let baseline = self.in_baselines[new_num as usize];
            if !self.delta_entity(new_frame, new_num, &baseline, false) {
                return false;
            }
        }

        // Any remaining old entities carry over unchanged.
        while old_num != 99999 {
            if !self.delta_entity(new_frame, old_num, &old_state, true) {
                return false;
            }
            old_index += 1;
            let of = old_frame.expect("carried entities require an old frame");
            (old_num, old_state) = self.fetch_old_entity(of, old_index);
        }

        true
    }

    /// Parse one entity delta and store the result in the parse ring. A
    /// removal is recorded but does not occupy a ring slot.
    fn delta_entity(
        &mut self,
        frame: &mut Snapshot,
        new_num: i32,
        old: &EntityState,
        unchanged: bool,
    ) -> bool {
        let removed_entity_number = old.number;
        let state;

        if unchanged {
            state = *old;
        } else {
            let mut parsed = EntityState::default();
            let mut added_or_changed = false;
            if !self.in_msg.read_delta_entity(
                self.in_protocol,
                &mut added_or_changed,
                old,
                &mut parsed,
                new_num,
            ) {
                return false;
            }

            if parsed.number == ENTITYNUM_NONE {
                self.in_removed_entities.push(removed_entity_number);
                return true;
            }

            if added_or_changed {
                let is_new_event = parsed.e_type >= ET_EVENTS
                    && self.in_server_time
                        > self.in_entity_event_times_ms[new_num as usize] + EVENT_VALID_MSEC;
                self.in_changed_entities.push(ChangedEntity {
                    state: parsed,
                    is_new_event,
                });
                if is_new_event {
                    self.in_entity_event_times_ms[new_num as usize] = self.in_server_time;
                }
            }
            state = parsed;
        }

        let slot = (self.in_parse_entities_num & (MAX_PARSE_ENTITIES - 1)) as usize;
        self.in_parse_entities[slot] = state;
        self.in_parse_entities_num += 1;
        frame.num_entities += 1;

        true
    }

    /// Write the delta update of the snapshot's entity list. The inverse of
    /// parse_packet_entities, walking both sorted sequences.
    fn emit_packet_entities(&mut self, from: Option<&Snapshot>, to: &Snapshot) {
        let from_num_entities = from.map_or(0, |f| f.num_entities);

        let mut old_index = 0;
        let mut new_index = 0;

        while new_index < to.num_entities || old_index < from_num_entities {
            let (new_num, new_ent) = if new_index >= to.num_entities {
                (9999, EntityState::default())
            } else {
                let slot =
                    ((to.parse_entities_num + new_index) & (MAX_PARSE_ENTITIES - 1)) as usize;
                let e = self.in_parse_entities[slot];
                (e.number, e)
            };

            let (old_num, old_ent) = if old_index >= from_num_entities {
                (9999, EntityState::default())
            } else {
                let from = from.expect("entity walk requires the old frame");
                let slot =
                    ((from.parse_entities_num + old_index) & (MAX_PARSE_ENTITIES - 1)) as usize;
                let e = self.in_parse_entities[slot];
                (e.number, e)
            };

            if new_num == old_num {
                // Delta from the old position; emits nothing when equal.
                let old_conv = self.converter.convert_entity_state(&old_ent);
                let new_conv = self.converter.convert_entity_state(&new_ent);
                self.out_msg
                    .write_delta_entity(self.out_protocol, &old_conv, Some(&new_conv), false);
                old_index += 1;
                new_index += 1;
            } else if new_num < old_num {
                // A new entity: force-encode it from its baseline.
                let baseline = self.in_baselines[new_num as usize];
                let base_conv = self.converter.convert_entity_state(&baseline);
                let new_conv = self.converter.convert_entity_state(&new_ent);
                self.out_msg
                    .write_delta_entity(self.out_protocol, &base_conv, Some(&new_conv), true);
                new_index += 1;
            } else {
                // The old entity is absent from the new snapshot.
                let old_conv = self.converter.convert_entity_state(&old_ent);
                self.out_msg
                    .write_delta_entity(self.out_protocol, &old_conv, None, true);
                old_index += 1;
            }
        }

        self.out_msg.write_bits(ENTITYNUM_NONE, GENTITYNUM_BITS);
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plug_in::PlugInList;
    use crate::test_support::{
        command_payload, finish, gamestate_payload, memory_stream_creator, out_msg_for,
        recorder, snapshot_payload, split_frames, Recorder,
    };
    use std::sync::{Arc, Mutex};

    fn make_parser(protocol: Protocol) -> (Parser, Context, PlugInList) {
        let mut parser = Parser::new();
        assert!(parser.init(protocol, protocol, 0, true));
        parser.set_file_name("test.dm_68");
        let plug_ins: PlugInList = vec![Box::new(Recorder::default())];
        (parser, Context::new(), plug_ins)
    }

    // -------------------------------------------------------
    // Gamestate handling
    // -------------------------------------------------------

    #[test]
    fn test_gamestate_populates_state() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let mut baseline = EntityState::default();
        baseline.number = 7;
        baseline.model_index = 3;
        baseline.origin = [8.0, 16.0, 24.0];

        let payload = gamestate_payload(
            Protocol::Dm68,
            0,
            &[(0, "\\protocol\\68\\mapname\\q3dm6"), (3, "Camping Grounds")],
            &[baseline],
            4,
        );
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &payload));

        assert_eq!(parser.game_state_index(), 0);
        assert_eq!(parser.game_state_file_offsets(), &[0]);
        assert_eq!(parser.client_num(), 4);
        assert_eq!(parser.config_string(3), Some("Camping Grounds"));
        assert_eq!(parser.config_string(4), None);

        let rec = recorder(&plug_ins);
        assert_eq!(rec.gamestates.len(), 1);
        assert_eq!(rec.gamestates[0].client_num, 4);
    }

    #[test]
    fn test_init_prefills_gamestate_offset_table() {
        let mut parser = Parser::new();
        assert!(parser.init(Protocol::Dm73, Protocol::Dm73, 2, false));
        assert_eq!(parser.game_state_index(), 1);
        assert_eq!(parser.game_state_file_offsets(), &[0, 0]);
        assert!(!parser.init(Protocol::Dm73, Protocol::Dm73, -1, false));
    }

    // -------------------------------------------------------
    // Commands
    // -------------------------------------------------------

    #[test]
    fn test_duplicate_command_suppression() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        let cmd = command_payload(Protocol::Dm68, 1, 1, "print hi");
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 100, &cmd));
        let dup = command_payload(Protocol::Dm68, 2, 1, "print hi");
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 2, 200, &dup));

        assert_eq!(recorder(&plug_ins).commands, ["print hi"]);
    }

    #[test]
    fn test_config_string_command_updates_table() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let gs = gamestate_payload(Protocol::Dm68, 0, &[(6, "old scores")], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));
        assert_eq!(parser.config_string(6), Some("old scores"));

        let cmd = command_payload(Protocol::Dm68, 1, 1, "cs 6 \"new scores\"");
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 50, &cmd));
        assert_eq!(parser.config_string(6), Some("new scores"));

        let rec = recorder(&plug_ins);
        assert_eq!(rec.commands, ["cs 6 \"new scores\""]);
        assert_eq!(rec.command_indices, [6]);
    }

    #[test]
    fn test_big_config_string_assembly() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        for (i, text) in [
            "bcs0 5 \"a\\b\\\"",
            "bcs1 5 \"c\\d\\\"",
            "bcs2 5 \"e\\f\"",
        ]
        .iter()
        .enumerate()
        {
            let cmd = command_payload(Protocol::Dm68, i as i32 + 1, i as i32 + 1, text);
            assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, i as i32 + 1, 0, &cmd));
        }

        assert_eq!(parser.config_string(5), Some("a\\b\\c\\d\\e\\f"));

        // Only the assembled command reaches plug-ins, never the pieces.
        let rec = recorder(&plug_ins);
        assert_eq!(rec.commands, ["cs 5 \"a\\b\\c\\d\\e\\f\""]);
        assert_eq!(rec.command_indices, [5]);
    }

    // -------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------

    #[test]
    fn test_snapshot_entity_removal() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        // Uncompressed snapshot introducing entity 5 (delta from its
        // zeroed baseline).
        let mut ent5 = EntityState::default();
        ent5.number = 5;
        ent5.e_type = 2;
        ent5.origin = [100.0, 0.0, 0.0];
        let ps = PlayerState::default();
        let zero = EntityState::default();

        let snap1 = snapshot_payload(Protocol::Dm68, 1, 500, 0, None, &ps, |m| {
            m.write_delta_entity(Protocol::Dm68, &zero, Some(&ent5), false);
        });
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap1));
        assert_eq!(parser.parse_entities_num(), 1);

        // Delta snapshot removing entity 5.
        let snap2 = snapshot_payload(Protocol::Dm68, 2, 600, 1, Some(&ps), &ps, |m| {
            m.write_delta_entity(Protocol::Dm68, &ent5, None, true);
        });
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 2, 0, &snap2));

        // The removal does not advance the parse ring cursor.
        assert_eq!(parser.parse_entities_num(), 1);

        let rec = recorder(&plug_ins);
        assert_eq!(rec.snapshots.len(), 2);
        assert_eq!(rec.snapshots[0], (500, vec![5], vec![]));
        assert_eq!(rec.snapshots[1], (600, vec![], vec![5]));
    }

    #[test]
    fn test_snapshot_delta_base_missing() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        // messageNum 100, delta 50: slot 50 & PACKET_MASK holds nothing
        // valid, so the snapshot must be dropped without desync.
        let ps = PlayerState::default();
        let snap = snapshot_payload(Protocol::Dm68, 100, 9000, 50, None, &ps, |_| {});
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 100, 0, &snap));

        assert!(recorder(&plug_ins).snapshots.is_empty());
        assert!(!parser.had_fatal_error());
    }

    #[test]
    fn test_gamestate_reset_clears_snapshot_ring() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let gs = gamestate_payload(Protocol::Dm68, 0, &[(9, "first")], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        let ps = PlayerState::default();
        let snap1 = snapshot_payload(Protocol::Dm68, 1, 500, 0, None, &ps, |_| {});
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap1));
        assert_eq!(recorder(&plug_ins).snapshots.len(), 1);

        // Second gamestate: ring and config strings are recycled.
        let gs2 = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 2, 4096, &gs2));
        assert_eq!(parser.game_state_index(), 1);
        assert_eq!(parser.config_string(9), None);

        // A delta against the pre-reset snapshot cannot be reconstructed.
        let snap2 = snapshot_payload(Protocol::Dm68, 3, 700, 2, None, &ps, |_| {});
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 3, 0, &snap2));
        assert_eq!(recorder(&plug_ins).snapshots.len(), 1);
    }

    #[test]
    fn test_entity_event_window() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        let ps = PlayerState::default();
        let zero = EntityState::default();
        let mut seq = 1;
        let mut fire = |parser: &mut Parser,
                        ctx: &mut Context,
                        plug_ins: &mut PlugInList,
                        time: i32,
                        wobble: f32| {
            let mut ent = EntityState::default();
            ent.number = 9;
            ent.e_type = ET_EVENTS + 1;
            ent.origin = [wobble, 0.0, 0.0];
            let snap = snapshot_payload(Protocol::Dm68, seq, time, 0, None, &ps, |m| {
                m.write_delta_entity(Protocol::Dm68, &zero, Some(&ent), false);
            });
            assert!(parser.parse_next_message(ctx, plug_ins, seq, 0, &snap));
            seq += 1;
        };

        fire(&mut parser, &mut ctx, &mut plug_ins, 1000, 1.0); // new event
        fire(&mut parser, &mut ctx, &mut plug_ins, 1100, 2.0); // repeat window
        fire(&mut parser, &mut ctx, &mut plug_ins, 1400, 3.0); // new again

        let rec = recorder(&plug_ins);
        assert_eq!(rec.snapshots.len(), 3);
        assert_eq!(rec.new_events, [9, 9]);
    }

    // -------------------------------------------------------
    // Cut scheduling and the write path
    // -------------------------------------------------------

    #[test]
    fn test_cut_window_boundary_and_round_trip() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let sink = Arc::new(Mutex::new(Vec::new()));
        parser.add_cut(0, 1000, 2000, "boundary", memory_stream_creator(sink.clone()));
        assert_eq!(parser.cut_count(), 1);

        let mut baseline = EntityState::default();
        baseline.number = 1;
        baseline.model_index = 2;
        let gs = gamestate_payload(
            Protocol::Dm68,
            0,
            &[(0, "\\protocol\\68"), (3, "arena")],
            &[baseline],
            0,
        );
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        let ps = PlayerState::default();
        let mut ent = EntityState::default();
        ent.number = 1;
        ent.model_index = 2;
        ent.origin = [10.0, 0.0, 0.0];

        let mut snapshot_at = |time: i32, seq: i32| {
            snapshot_payload(Protocol::Dm68, seq, time, 0, None, &ps, |m| {
                m.write_delta_entity(Protocol::Dm68, &baseline, Some(&ent), false);
            })
        };

        // 999 is outside, 1000 opens the cut, 2000 is the inclusive end,
        // 2001 closes the window and ends parsing.
        let s999 = snapshot_at(999, 1);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &s999));

        let s1000 = snapshot_at(1000, 2);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 2, 0, &s1000));

        let cmd = command_payload(Protocol::Dm68, 3, 1, "print mid");
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 3, 0, &cmd));

        let s2000 = snapshot_at(2000, 4);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 4, 0, &s2000));

        let s2001 = snapshot_at(2001, 5);
        assert!(!parser.parse_next_message(&mut ctx, &mut plug_ins, 5, 0, &s2001));
        assert!(!parser.had_fatal_error());
        assert_eq!(parser.cut_count(), 0);

        // Decode the written demo with a fresh parser: a synthesized
        // gamestate followed by exactly the in-window messages.
        let bytes = sink.lock().unwrap().clone();
        let (frames, terminated) = split_frames(&bytes);
        assert!(terminated, "output must end with the double -1 marker");
        assert_eq!(frames.len(), 4);

        let mut parser2 = Parser::new();
        assert!(parser2.init(Protocol::Dm68, Protocol::Dm68, 0, true));
        parser2.set_file_name("cut_output.dm_68");
        let mut plug_ins2: PlugInList = vec![Box::new(Recorder::default())];
        let mut ctx2 = Context::new();

        for (seq, payload) in &frames {
            assert!(parser2.parse_next_message(&mut ctx2, &mut plug_ins2, *seq, 0, payload));
        }
        assert!(!parser2.had_fatal_error());

        let rec = recorder(&plug_ins2);
        assert_eq!(rec.gamestates.len(), 1, "one synthesized gamestate per cut");
        assert_eq!(rec.commands, ["print mid"]);
        let times: Vec<i32> = rec.snapshots.iter().map(|s| s.0).collect();
        assert_eq!(times, [1000, 2000]);
        // The snapshot contents survived the re-encode.
        assert_eq!(rec.snapshots[0].1, vec![1]);
        assert_eq!(parser2.config_string(3), Some("arena"));
    }

    #[test]
    fn test_cut_stream_creation_soft_failure() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);
        parser.add_cut(0, 1000, 2000, "doomed", Box::new(|_arg| None));

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        let ps = PlayerState::default();
        let snap = snapshot_payload(Protocol::Dm68, 1, 1500, 0, None, &ps, |_| {});
        // The window matched but the stream failed: drop it, keep going.
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap));
        assert_eq!(parser.cut_count(), 0);
        assert!(!parser.had_fatal_error());
    }

    #[test]
    fn test_big_config_string_split_law() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let sink = Arc::new(Mutex::new(Vec::new()));
        parser.add_cut(0, 0, 100000, "bcs", memory_stream_creator(sink.clone()));

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));

        // Open the window.
        let ps = PlayerState::default();
        let snap = snapshot_payload(Protocol::Dm68, 1, 1000, 0, None, &ps, |_| {});
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap));

        // Deliver an oversized config string as three input pieces.
        let value = "x".repeat(2500);
        let pieces = [
            format!("bcs0 5 \"{}\"", &value[..900]),
            format!("bcs1 5 \"{}\"", &value[900..1800]),
            format!("bcs2 5 \"{}\"", &value[1800..]),
        ];
        for (i, piece) in pieces.iter().enumerate() {
            let cmd = command_payload(Protocol::Dm68, i as i32 + 2, i as i32 + 1, piece);
            assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, i as i32 + 2, 0, &cmd));
        }
        assert_eq!(parser.config_string(5), Some(value.as_str()));

        // Pull every server command back out of the written frames.
        let bytes = sink.lock().unwrap().clone();
        let (frames, _) = split_frames(&bytes);
        let mut written_commands = Vec::new();
        for (_, payload) in &frames {
            let mut m = Message::with_capacity(payload.len());
            m.init_read(payload);
            m.set_huffman(true);
            m.read_long();
            loop {
                let cmd = m.read_byte();
                if cmd == SVC_EOF || !m.valid_state() {
                    break;
                }
                match cmd {
                    SVC_SERVERCOMMAND => {
                        m.read_long();
                        written_commands.push(m.read_string());
                    }
                    SVC_GAMESTATE | SVC_SNAPSHOT => break,
                    _ => break,
                }
            }
        }

        // K is the smallest chunk count whose every piece fits the wire.
        let overhead = 8 + 1; // "bcs0 5 \"" plus the closing quote
        let mut expected_chunks = 2;
        while (value.len() + expected_chunks - 1) / expected_chunks + overhead
            > MAX_STRING_CHARS - 2
        {
            expected_chunks += 1;
        }
        assert_eq!(expected_chunks, 3);
        assert_eq!(written_commands.len(), expected_chunks);
        assert!(written_commands[0].starts_with("bcs0 5 \""));
        assert!(written_commands[1].starts_with("bcs1 5 \""));
        assert!(written_commands[2].starts_with("bcs2 5 \""));
        for cmd in &written_commands {
            assert!(cmd.len() < MAX_STRING_CHARS);
        }

        // Reassembling the pieces restores the value byte for byte.
        let mut reassembled = String::new();
        for cmd in &written_commands {
            let open = cmd.find('"').unwrap();
            reassembled.push_str(&cmd[open + 1..cmd.len() - 1]);
        }
        assert_eq!(reassembled, value);
    }

    #[test]
    fn test_abort_leaves_stream_without_terminator() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let sink = Arc::new(Mutex::new(Vec::new()));
        parser.add_cut(0, 1000, 9000, "abort", memory_stream_creator(sink.clone()));

        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));
        let ps = PlayerState::default();
        let snap = snapshot_payload(Protocol::Dm68, 1, 1500, 0, None, &ps, |_| {});
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap));

        // Abort mid-cut: no -1 markers are appended.
        parser.finish_parsing(&mut plug_ins, false);
        let bytes = sink.lock().unwrap().clone();
        let (frames, terminated) = split_frames(&bytes);
        assert!(!frames.is_empty());
        assert!(!terminated);

        // A clean finish would have closed it.
        let sink2 = Arc::new(Mutex::new(Vec::new()));
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);
        parser.add_cut(0, 1000, 9000, "clean", memory_stream_creator(sink2.clone()));
        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &gs));
        let snap = snapshot_payload(Protocol::Dm68, 1, 1500, 0, None, &ps, |_| {});
        assert!(parser.parse_next_message(&mut ctx, &mut plug_ins, 1, 0, &snap));
        parser.finish_parsing(&mut plug_ins, true);
        let bytes = sink2.lock().unwrap().clone();
        let (_, terminated) = split_frames(&bytes);
        assert!(terminated);
    }

    // -------------------------------------------------------
    // Error handling
    // -------------------------------------------------------

    #[test]
    fn test_unknown_command_byte_is_fatal() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let mut m = out_msg_for(Protocol::Dm68);
        m.write_long(0);
        m.write_byte(42); // not a server command
        let payload = finish(m);

        assert!(!parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &payload));
        assert!(parser.had_fatal_error());
    }

    #[test]
    fn test_gamestate_config_string_index_out_of_range_is_fatal() {
        let (mut parser, mut ctx, mut plug_ins) = make_parser(Protocol::Dm68);

        let mut m = out_msg_for(Protocol::Dm68);
        m.write_long(0);
        m.write_byte(SVC_GAMESTATE);
        m.write_long(0);
        m.write_byte(SVC_CONFIGSTRING);
        m.write_short(MAX_CONFIGSTRINGS as i32 + 5);
        m.write_big_string("junk");
        let payload = finish(m);

        assert!(!parser.parse_next_message(&mut ctx, &mut plug_ins, 0, 0, &payload));
        assert!(parser.had_fatal_error());
    }
}
