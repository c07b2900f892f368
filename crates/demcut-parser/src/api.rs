// api.rs — the stable library surface
//
// Context creation, single- and multi-file parsing with a plug-in set,
// the cut operations (explicit windows, chat rules, frag rules), the
// gamestate splitter, and per-demo plug-in output queries. All file and
// path policy lives here; the parser itself only ever sees streams.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI32;

use thiserror::Error;

use demcut_common::qshared::Protocol;

use crate::context::Context;
use crate::cut_by_chat::{ChatRecord, ChatRule, CutByChatAnalyzer, CutSection};
use crate::cut_by_frag::{find_frag_sections, CutByFragArg};
use crate::demo_file::run_parser;
use crate::obituaries::{ObituariesAnalyzer, ObituaryRecord};
use crate::parser::{Parser, StreamCreator};
use crate::plug_in::{ParserPlugIn, PlugInList};
use crate::splitter::{split_ranges, GamestateCollector};

pub const VERSION: &str = "1.0.0";

// ============================================================
// Error codes
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation failed")]
    OperationFailed,
    #[error("operation canceled")]
    OperationCanceled,
    #[error("unprocessed")]
    Unprocessed,
}

/// Stable integer codes for per-file result arrays and embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,
    InvalidArgument = 1,
    OperationFailed = 2,
    OperationCanceled = 3,
    Unprocessed = 4,
}

impl From<ApiError> for ErrorCode {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::InvalidArgument => ErrorCode::InvalidArgument,
            ApiError::OperationFailed => ErrorCode::OperationFailed,
            ApiError::OperationCanceled => ErrorCode::OperationCanceled,
            ApiError::Unprocessed => ErrorCode::Unprocessed,
        }
    }
}

impl ErrorCode {
    pub fn from_result(result: &Result<(), ApiError>) -> Self {
        match result {
            Ok(()) => ErrorCode::None,
            Err(err) => (*err).into(),
        }
    }
}

static ERROR_CODE_STRINGS: [&str; 5] = [
    "no error",
    "invalid argument",
    "operation failed",
    "operation canceled",
    "unprocessed",
];

pub fn error_code_string(code: i32) -> &'static str {
    if code < 0 || code >= ERROR_CODE_STRINGS.len() as i32 {
        return "invalid error code";
    }
    ERROR_CODE_STRINGS[code as usize]
}

pub fn get_protocol_by_file_path(path: &Path) -> Option<Protocol> {
    Protocol::from_file_path(&path.to_string_lossy())
}

// ============================================================
// Context
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugInId {
    Obituaries,
    GamestateInfo,
}

fn create_plug_in(id: PlugInId) -> Box<dyn ParserPlugIn> {
    match id {
        PlugInId::Obituaries => Box::new(ObituariesAnalyzer::new()),
        PlugInId::GamestateInfo => Box::new(GamestateCollector::new()),
    }
}

/// One parsing context: a parser, its callback context and its plug-in
/// instances. One context per worker thread; contexts share nothing.
pub struct ParserContext {
    pub context: Context,
    pub parser: Parser,
    plug_ins: PlugInList,
    demo_count: u32,
}

impl ParserContext {
    pub fn new() -> Self {
        Self {
            context: Context::new(),
            parser: Parser::new(),
            plug_ins: Vec::new(),
            demo_count: 0,
        }
    }

    /// Drop plug-in instances and their outputs.
    pub fn reset(&mut self) {
        self.plug_ins.clear();
        self.demo_count = 0;
        self.context.reset();
    }

    pub fn demo_count(&self) -> u32 {
        self.demo_count
    }

    pub fn plug_ins(&self) -> &PlugInList {
        &self.plug_ins
    }

    fn find_plug_in<T: 'static>(&self) -> Option<&T> {
        self.plug_ins
            .iter()
            .find_map(|p| p.as_any().downcast_ref::<T>())
    }

    pub fn obituaries(&self, demo_index: usize) -> Option<&[ObituaryRecord]> {
        self.find_plug_in::<ObituariesAnalyzer>()
            .map(|a| a.obituaries(demo_index))
    }

    pub fn chat_records(&self, demo_index: usize) -> Option<&[ChatRecord]> {
        self.find_plug_in::<CutByChatAnalyzer>()
            .map(|a| a.chat_records(demo_index))
    }

    pub fn gamestate_offsets(&self, demo_index: usize) -> Option<&[u32]> {
        self.find_plug_in::<GamestateCollector>()
            .map(|a| a.gamestate_offsets(demo_index))
    }
}

impl Default for ParserContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Arguments
// ============================================================

pub struct ParseArg<'a> {
    pub plug_ins: &'a [PlugInId],
    pub output_folder_path: Option<&'a Path>,
    /// Checked between messages; non-zero aborts with OperationCanceled.
    pub cancel: Option<&'a AtomicI32>,
    pub game_state_index: i32,
    pub file_offset: u32,
}

impl Default for ParseArg<'_> {
    fn default() -> Self {
        Self {
            plug_ins: &[],
            output_folder_path: None,
            cancel: None,
            game_state_index: 0,
            file_offset: 0,
        }
    }
}

/// One explicit extraction window, in server-time milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cut {
    pub start_time_ms: i32,
    pub end_time_ms: i32,
}

#[derive(Debug, Clone)]
pub struct CutByChatArg {
    pub rules: Vec<ChatRule>,
}

// ============================================================
// Shared plumbing
// ============================================================

fn open_input(path: &Path) -> Result<(BufReader<File>, u64), ApiError> {
    let file = File::open(path).map_err(|_| ApiError::OperationFailed)?;
    let length = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((BufReader::new(file), length))
}

fn file_display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "NEW_DEMO".to_string())
}

fn output_folder_for(input_path: &Path, output_folder: Option<&Path>) -> PathBuf {
    match output_folder {
        Some(folder) => folder.to_path_buf(),
        None => input_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf(),
    }
}

/// "mmss" for output file names.
fn format_time_for_file_name(time_ms: i32) -> String {
    let seconds = time_ms.max(0) / 1000;
    format!("{:02}{:02}", seconds / 60, seconds % 60)
}

/// The default cut stream factory: one file per window, named after the
/// input, the window times and the cut description.
fn file_stream_creator(input_path: &Path, output_folder: Option<&Path>) -> StreamCreator {
    let stem = file_stem(input_path);
    let folder = output_folder_for(input_path, output_folder);

    Box::new(move |arg| {
        let desc = if arg.very_short_desc.is_empty() {
            String::new()
        } else {
            format!("_{}", arg.very_short_desc)
        };
        let name = format!(
            "{}_CUT{}_{}_{}{}",
            stem,
            desc,
            format_time_for_file_name(arg.start_time_ms),
            format_time_for_file_name(arg.end_time_ms),
            arg.output_protocol.file_extension()
        );
        let path = folder.join(&name);
        let file = File::create(&path).ok()?;
        Some((name, Box::new(BufWriter::new(file)) as Box<dyn Write + Send>))
    })
}

fn parse_one_demo(
    pc: &mut ParserContext,
    arg: &ParseArg,
    path: &Path,
    progress_base: f32,
    progress_scale: f32,
) -> Result<(), ApiError> {
    let protocol = get_protocol_by_file_path(path).ok_or(ApiError::InvalidArgument)?;
    let (mut reader, length) = open_input(path)?;
    if arg.file_offset > 0 {
        reader
            .seek(SeekFrom::Start(arg.file_offset as u64))
            .map_err(|_| ApiError::OperationFailed)?;
    }

    if !pc
        .parser
        .init(protocol, protocol, arg.game_state_index, true)
    {
        return Err(ApiError::OperationFailed);
    }
    pc.parser.set_file_name(&file_display_name(path));

    let outcome = run_parser(
        &mut pc.parser,
        &mut pc.context,
        &mut pc.plug_ins,
        &mut reader,
        length,
        arg.cancel,
        progress_base,
        progress_scale,
    );
    pc.demo_count += 1;

    if outcome.canceled {
        return Err(ApiError::OperationCanceled);
    }
    if !outcome.success {
        return Err(ApiError::OperationFailed);
    }
    Ok(())
}

fn cancel_requested(arg: &ParseArg) -> bool {
    arg.cancel
        .map(|c| c.load(std::sync::atomic::Ordering::Relaxed) != 0)
        .unwrap_or(false)
}

// ============================================================
// Parsing
// ============================================================

/// Parse one demo with the given plug-in set; query the outputs from the
/// context afterwards.
pub fn parse_demo_file(
    pc: &mut ParserContext,
    arg: &ParseArg,
    path: &Path,
) -> Result<(), ApiError> {
    if arg.plug_ins.is_empty() {
        return Err(ApiError::InvalidArgument);
    }

    pc.reset();
    for &id in arg.plug_ins {
        pc.plug_ins.push(create_plug_in(id));
    }

    parse_one_demo(pc, arg, path, 0.0, 1.0)
}

/// Parse a batch of demos in one context. Every file gets a slot in
/// `error_codes` (Unprocessed until attempted); a failing file never
/// stops the batch. Progress is aggregated by file size.
pub fn parse_demo_files(
    pc: &mut ParserContext,
    arg: &ParseArg,
    paths: &[&Path],
    error_codes: &mut [ErrorCode],
) -> Result<(), ApiError> {
    if paths.is_empty() || paths.len() != error_codes.len() || arg.plug_ins.is_empty() {
        return Err(ApiError::InvalidArgument);
    }

    pc.reset();
    for &id in arg.plug_ins {
        pc.plug_ins.push(create_plug_in(id));
    }
    error_codes.fill(ErrorCode::Unprocessed);

    let sizes: Vec<u64> = paths
        .iter()
        .map(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
        .collect();
    let total_bytes: u64 = sizes.iter().sum::<u64>().max(1);

    let mut processed_bytes = 0u64;
    for (i, path) in paths.iter().enumerate() {
        if cancel_requested(arg) {
            break;
        }

        let base = processed_bytes as f32 / total_bytes as f32;
        let scale = sizes[i] as f32 / total_bytes as f32;
        let result = parse_one_demo(pc, arg, path, base, scale);
        error_codes[i] = ErrorCode::from_result(&result);

        processed_bytes += sizes[i];
    }

    if cancel_requested(arg) {
        return Err(ApiError::OperationCanceled);
    }
    Ok(())
}

// ============================================================
// Cutting
// ============================================================

/// Extract explicit time windows into new demo files.
pub fn cut_demo_file_by_time(
    pc: &mut ParserContext,
    arg: &ParseArg,
    cuts: &[Cut],
    path: &Path,
) -> Result<(), ApiError> {
    if cuts.is_empty() {
        return Err(ApiError::InvalidArgument);
    }
    let protocol = get_protocol_by_file_path(path).ok_or(ApiError::InvalidArgument)?;

    pc.reset();
    let (mut reader, length) = open_input(path)?;
    if arg.file_offset > 0 {
        reader
            .seek(SeekFrom::Start(arg.file_offset as u64))
            .map_err(|_| ApiError::OperationFailed)?;
    }

    if !pc
        .parser
        .init(protocol, protocol, arg.game_state_index, true)
    {
        return Err(ApiError::OperationFailed);
    }
    pc.parser.set_file_name(&file_display_name(path));

    for cut in cuts {
        if cut.start_time_ms < cut.end_time_ms {
            pc.parser.add_cut(
                arg.game_state_index,
                cut.start_time_ms,
                cut.end_time_ms,
                "",
                file_stream_creator(path, arg.output_folder_path),
            );
        }
    }

    pc.context
        .log_info(&format!("Processing for a timed cut: {}", path.display()));

    let outcome = run_parser(
        &mut pc.parser,
        &mut pc.context,
        &mut pc.plug_ins,
        &mut reader,
        length,
        arg.cancel,
        0.0,
        1.0,
    );
    if outcome.canceled {
        return Err(ApiError::OperationCanceled);
    }
    if !outcome.success {
        return Err(ApiError::OperationFailed);
    }
    Ok(())
}

/// Shared second pass for the rule-driven cuts: seek back to the first
/// relevant gamestate and extract the sections.
fn cut_sections(
    pc: &mut ParserContext,
    arg: &ParseArg,
    protocol: Protocol,
    path: &Path,
    sections: &[CutSection],
    desc: &str,
) -> Result<(), ApiError> {
    let first_gs = sections[0].game_state_index;
    let file_offset = pc
        .parser
        .game_state_file_offsets()
        .get(first_gs as usize)
        .copied()
        .unwrap_or(0);

    let (mut reader, length) = open_input(path)?;
    if file_offset > 0 {
        reader
            .seek(SeekFrom::Start(file_offset as u64))
            .map_err(|_| ApiError::OperationFailed)?;
    }

    if !pc.parser.init(protocol, protocol, first_gs, true) {
        return Err(ApiError::OperationFailed);
    }
    pc.parser.set_file_name(&file_display_name(path));

    for section in sections {
        pc.parser.add_cut(
            section.game_state_index,
            section.start_time_ms,
            section.end_time_ms,
            desc,
            file_stream_creator(path, arg.output_folder_path),
        );
    }

    let mut no_plug_ins: PlugInList = Vec::new();
    let outcome = run_parser(
        &mut pc.parser,
        &mut pc.context,
        &mut no_plug_ins,
        &mut reader,
        length,
        arg.cancel,
        0.0,
        1.0,
    );
    if outcome.canceled {
        return Err(ApiError::OperationCanceled);
    }
    if !outcome.success {
        return Err(ApiError::OperationFailed);
    }
    Ok(())
}

/// Find chat messages matching the rules, then extract the merged
/// sections around them.
pub fn cut_demo_file_by_chat(
    pc: &mut ParserContext,
    arg: &ParseArg,
    chat_arg: &CutByChatArg,
    path: &Path,
) -> Result<(), ApiError> {
    if chat_arg.rules.is_empty() {
        return Err(ApiError::InvalidArgument);
    }
    if let Some(folder) = arg.output_folder_path {
        if !folder.is_dir() {
            return Err(ApiError::InvalidArgument);
        }
    }
    let protocol = get_protocol_by_file_path(path).ok_or(ApiError::InvalidArgument)?;

    pc.context
        .log_info(&format!("Processing for chat analysis: {}", path.display()));

    pc.reset();
    pc.plug_ins
        .push(Box::new(CutByChatAnalyzer::new(chat_arg.rules.clone())));

    let analysis_arg = ParseArg {
        plug_ins: &[],
        output_folder_path: arg.output_folder_path,
        cancel: arg.cancel,
        game_state_index: 0,
        file_offset: 0,
    };
    parse_one_demo(pc, &analysis_arg, path, 0.0, 1.0)?;

    let sections = pc
        .find_plug_in::<CutByChatAnalyzer>()
        .map(|a| a.merged_sections())
        .unwrap_or_default();
    if sections.is_empty() {
        return Ok(());
    }

    pc.context
        .log_info(&format!("Processing for chat cut(s): {}", path.display()));

    cut_sections(pc, arg, protocol, path, &sections, "chat")
}

/// Find frag runs by the tracked player, then extract a section around
/// each run.
pub fn cut_demo_file_by_frag(
    pc: &mut ParserContext,
    arg: &ParseArg,
    frag_arg: &CutByFragArg,
    path: &Path,
) -> Result<(), ApiError> {
    if frag_arg.min_frag_count < 2 || frag_arg.time_between_frags_sec == 0 {
        return Err(ApiError::InvalidArgument);
    }
    if let Some(folder) = arg.output_folder_path {
        if !folder.is_dir() {
            return Err(ApiError::InvalidArgument);
        }
    }
    let protocol = get_protocol_by_file_path(path).ok_or(ApiError::InvalidArgument)?;

    pc.context
        .log_info(&format!("Processing for frag analysis: {}", path.display()));

    pc.reset();
    pc.plug_ins.push(Box::new(ObituariesAnalyzer::new()));

    let analysis_arg = ParseArg {
        plug_ins: &[],
        output_folder_path: arg.output_folder_path,
        cancel: arg.cancel,
        game_state_index: 0,
        file_offset: 0,
    };
    parse_one_demo(pc, &analysis_arg, path, 0.0, 1.0)?;

    let sections = {
        let analyzer = pc
            .find_plug_in::<ObituariesAnalyzer>()
            .ok_or(ApiError::OperationFailed)?;
        find_frag_sections(analyzer.obituaries(0), analyzer.recording_client_num(), frag_arg)
    };
    if sections.is_empty() {
        return Ok(());
    }

    pc.context
        .log_info(&format!("Processing for frag cut(s): {}", path.display()));

    cut_sections(pc, arg, protocol, path, &sections, "frag")
}

// ============================================================
// Splitting
// ============================================================

fn copy_file_range(
    input: &mut BufReader<File>,
    output_path: &Path,
    start: u32,
    end: u32,
) -> Result<(), ApiError> {
    input
        .seek(SeekFrom::Start(start as u64))
        .map_err(|_| ApiError::OperationFailed)?;
    let output = File::create(output_path).map_err(|_| ApiError::OperationFailed)?;
    let mut writer = BufWriter::new(output);
    let mut remaining = input.take((end - start) as u64);
    std::io::copy(&mut remaining, &mut writer).map_err(|_| ApiError::OperationFailed)?;
    writer.flush().map_err(|_| ApiError::OperationFailed)?;
    Ok(())
}

/// Split a demo into one file per gamestate. A single-gamestate demo is
/// left alone.
pub fn split_demo_file(
    pc: &mut ParserContext,
    arg: &ParseArg,
    path: &Path,
) -> Result<(), ApiError> {
    let protocol = get_protocol_by_file_path(path).ok_or(ApiError::InvalidArgument)?;

    pc.reset();
    pc.plug_ins.push(Box::new(GamestateCollector::new()));

    let analysis_arg = ParseArg {
        plug_ins: &[],
        output_folder_path: arg.output_folder_path,
        cancel: arg.cancel,
        game_state_index: 0,
        file_offset: 0,
    };
    parse_one_demo(pc, &analysis_arg, path, 0.0, 1.0)?;

    let (offsets, file_length) = {
        let collector = pc
            .find_plug_in::<GamestateCollector>()
            .ok_or(ApiError::OperationFailed)?;
        let length = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        (collector.gamestate_offsets(0).to_vec(), length as u32)
    };

    let ranges = split_ranges(&offsets, file_length);
    if ranges.is_empty() {
        return Ok(());
    }

    let stem = file_stem(path);
    let folder = output_folder_for(path, arg.output_folder_path);
    let (mut reader, _) = open_input(path)?;

    for (i, (start, end)) in ranges.iter().enumerate() {
        let name = format!("{}_SPLIT_{}{}", stem, i + 1, protocol.file_extension());
        let output_path = folder.join(name);
        pc.context
            .log_info(&format!("Writing demo {}...", output_path.display()));
        copy_file_range(&mut reader, &output_path, *start, *end)?;
    }

    Ok(())
}

// ============================================================
// Tests
// ============================================================
