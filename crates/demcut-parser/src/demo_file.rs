// demo_file.rs — framed demo input
//
// A demo file is a sequence of records: 4-byte message sequence, 4-byte
// payload length, payload. A length of -1 ends the stream. The run loop
// feeds the parser one record at a time, checking the caller's cancel
// flag between messages and reporting progress by file position.

use std::io::{Read, Seek};
use std::sync::atomic::{AtomicI32, Ordering};

use byteorder::{LittleEndian, ReadBytesExt};

use demcut_common::qshared::MAX_MSGLEN;

use crate::context::Context;
use crate::parser::Parser;
use crate::plug_in::PlugInList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub canceled: bool,
}

/// Drive the parser over one framed demo stream. `progress_base` and
/// `progress_scale` place this file's progress within a larger batch.
pub fn run_parser<R: Read + Seek>(
    parser: &mut Parser,
    ctx: &mut Context,
    plug_ins: &mut PlugInList,
    reader: &mut R,
    file_length: u64,
    cancel: Option<&AtomicI32>,
    progress_base: f32,
    progress_scale: f32,
) -> RunOutcome {
    if parser.plug_ins_enabled() {
        for plug_in in plug_ins.iter_mut() {
            plug_in.start_processing_demo();
        }
    }

    let mut payload = vec![0u8; MAX_MSGLEN];
    let mut canceled = false;
    let mut clean = true;

    loop {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) != 0 {
                canceled = true;
                break;
            }
        }

        let offset = reader.stream_position().unwrap_or(0) as u32;
        let sequence = match reader.read_i32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => break, // plain end of file
        };
        let length = match reader.read_i32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => break,
        };
        if length == -1 || sequence == -1 {
            break;
        }
        if length <= 0 || length as usize > MAX_MSGLEN {
            ctx.log_error(&format!("run_parser: bad message length: {}", length));
            clean = false;
            break;
        }

        let length = length as usize;
        if reader.read_exact(&mut payload[..length]).is_err() {
            ctx.log_error("run_parser: truncated message");
            clean = false;
            break;
        }

        if !parser.parse_next_message(ctx, plug_ins, sequence, offset, &payload[..length]) {
            // Stream desync (reported separately) or the last cut closed.
            break;
        }

        if file_length > 0 {
            let pos = reader.stream_position().unwrap_or(0);
            let fraction = (pos as f32 / file_length as f32).min(1.0);
            ctx.notify_progress(progress_base + progress_scale * fraction);
        }
    }

    let success = clean && !canceled && !parser.had_fatal_error();

    // An aborted run closes output streams without end-of-stream markers.
    parser.finish_parsing(plug_ins, success);

    RunOutcome { success, canceled }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        command_payload, gamestate_payload, push_frame, push_terminator, recorder,
        snapshot_payload, Recorder,
    };
    use demcut_common::qshared::{PlayerState, Protocol};
    use std::io::Cursor;

    fn simple_demo(protocol: Protocol) -> Vec<u8> {
        let mut demo = Vec::new();
        let gs = gamestate_payload(protocol, 0, &[(3, "arena")], &[], 1);
        push_frame(&mut demo, 0, &gs);

        let cmd = command_payload(protocol, 1, 1, "print hello");
        push_frame(&mut demo, 1, &cmd);

        let ps = PlayerState::default();
        let snap = snapshot_payload(protocol, 2, 4200, 0, None, &ps, |_| {});
        push_frame(&mut demo, 2, &snap);

        push_terminator(&mut demo);
        demo
    }

    fn run_simple(demo: &[u8]) -> (Parser, PlugInList, RunOutcome) {
        let mut parser = Parser::new();
        assert!(parser.init(Protocol::Dm68, Protocol::Dm68, 0, true));
        parser.set_file_name("memory.dm_68");
        let mut plug_ins: PlugInList = vec![Box::new(Recorder::default())];
        let mut ctx = Context::new();
        let mut reader = Cursor::new(demo.to_vec());
        let outcome = run_parser(
            &mut parser,
            &mut ctx,
            &mut plug_ins,
            &mut reader,
            demo.len() as u64,
            None,
            0.0,
            1.0,
        );
        (parser, plug_ins, outcome)
    }

    #[test]
    fn test_run_full_demo() {
        let demo = simple_demo(Protocol::Dm68);
        let (parser, plug_ins, outcome) = run_simple(&demo);

        assert!(outcome.success);
        assert!(!outcome.canceled);
        assert!(!parser.had_fatal_error());

        let rec = recorder(&plug_ins);
        assert_eq!(rec.started, 1);
        assert_eq!(rec.finished, 1);
        assert_eq!(rec.gamestates.len(), 1);
        assert_eq!(rec.commands, ["print hello"]);
        assert_eq!(rec.snapshots.len(), 1);
        assert_eq!(rec.snapshots[0].0, 4200);
    }

    #[test]
    fn test_truncated_file_without_terminator_is_tolerated() {
        let mut demo = Vec::new();
        let gs = gamestate_payload(Protocol::Dm68, 0, &[], &[], 0);
        push_frame(&mut demo, 0, &gs);
        // No terminator at all: plain EOF ends the run cleanly.
        let (_, plug_ins, outcome) = run_simple(&demo);
        assert!(outcome.success);
        assert_eq!(recorder(&plug_ins).gamestates.len(), 1);
    }

    #[test]
    fn test_bad_length_fails() {
        let mut demo = Vec::new();
        demo.extend_from_slice(&0i32.to_le_bytes());
        demo.extend_from_slice(&(MAX_MSGLEN as i32 * 2).to_le_bytes());
        let (_, _, outcome) = run_simple(&demo);
        assert!(!outcome.success);
    }

    #[test]
    fn test_cancellation_between_messages() {
        let demo = simple_demo(Protocol::Dm68);
        let mut parser = Parser::new();
        assert!(parser.init(Protocol::Dm68, Protocol::Dm68, 0, true));
        let mut plug_ins: PlugInList = vec![Box::new(Recorder::default())];
        let mut ctx = Context::new();
        let mut reader = Cursor::new(demo.clone());

        let cancel = AtomicI32::new(1);
        let outcome = run_parser(
            &mut parser,
            &mut ctx,
            &mut plug_ins,
            &mut reader,
            demo.len() as u64,
            Some(&cancel),
            0.0,
            1.0,
        );
        assert!(outcome.canceled);
        assert!(!outcome.success);
        // Nothing was parsed: the flag was already set.
        assert!(recorder(&plug_ins).gamestates.is_empty());
        // The demo still gets its finish notification.
        assert_eq!(recorder(&plug_ins).finished, 1);
    }
}
