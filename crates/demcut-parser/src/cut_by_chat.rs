// cut_by_chat.rs — chat rule matching and section building
//
// Watches chat commands, matches them against the caller's rules, and
// turns each match into a cut section padded by the rule's offsets.
// Overlapping sections within one gamestate merge before cutting.

use std::any::Any;

use demcut_common::info::clean_string;
use demcut_common::tokenizer::Tokenizer;

use crate::parser::Parser;
use crate::plug_in::{CommandInfo, ParserPlugIn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOperator {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone)]
pub struct ChatRule {
    pub pattern: String,
    pub operator: ChatOperator,
    pub case_sensitive: bool,
    pub ignore_color_codes: bool,
    pub start_offset_sec: u32,
    pub end_offset_sec: u32,
}

/// A requested extraction window over one gamestate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutSection {
    pub game_state_index: i32,
    pub start_time_ms: i32,
    pub end_time_ms: i32,
}

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub game_state_index: i32,
    pub server_time_ms: i32,
    pub message: String,
}

pub fn string_matches_chat_rule(text: &str, rule: &ChatRule) -> bool {
    let mut text = text.to_string();
    let mut pattern = rule.pattern.clone();

    if rule.ignore_color_codes {
        text = clean_string(&text);
    }
    if !rule.case_sensitive {
        text = text.to_lowercase();
        pattern = pattern.to_lowercase();
    }

    match rule.operator {
        ChatOperator::Contains => text.contains(&pattern),
        ChatOperator::StartsWith => text.starts_with(&pattern),
        ChatOperator::EndsWith => text.ends_with(&pattern),
    }
}

pub struct CutByChatAnalyzer {
    rules: Vec<ChatRule>,
    tokenizer: Tokenizer,
    demos: Vec<Vec<ChatRecord>>,
    sections: Vec<CutSection>,
}

impl CutByChatAnalyzer {
    pub fn new(rules: Vec<ChatRule>) -> Self {
        Self {
            rules,
            tokenizer: Tokenizer::new(),
            demos: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn chat_records(&self, demo_index: usize) -> &[ChatRecord] {
        self.demos
            .get(demo_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Matched sections, overlaps merged, ordered by gamestate then time.
    pub fn merged_sections(&self) -> Vec<CutSection> {
        let mut sections = self.sections.clone();
        sections.sort_by_key(|s| (s.game_state_index, s.start_time_ms));

        let mut merged: Vec<CutSection> = Vec::new();
        for section in sections {
            match merged.last_mut() {
                Some(last)
                    if last.game_state_index == section.game_state_index
                        && section.start_time_ms <= last.end_time_ms =>
                {
                    last.end_time_ms = last.end_time_ms.max(section.end_time_ms);
                }
                _ => merged.push(section),
            }
        }
        merged
    }
}

impl ParserPlugIn for CutByChatAnalyzer {
    fn start_processing_demo(&mut self) {
        self.demos.push(Vec::new());
        self.sections.clear();
    }

    fn process_command_message(&mut self, info: &CommandInfo, parser: &Parser) {
        self.tokenizer.tokenize(info.string);
        let name = self.tokenizer.argv(0);
        if name != "chat" && name != "tchat" {
            return;
        }
        let text = self.tokenizer.argv(1).to_string();

        // Chat arriving before the first snapshot has no usable time.
        let server_time = parser.server_time();
        if server_time == i32::MIN {
            return;
        }

        for rule in &self.rules {
            if !string_matches_chat_rule(&text, rule) {
                continue;
            }
            self.sections.push(CutSection {
                game_state_index: parser.game_state_index(),
                start_time_ms: server_time - rule.start_offset_sec as i32 * 1000,
                end_time_ms: server_time + rule.end_offset_sec as i32 * 1000,
            });
            if let Some(records) = self.demos.last_mut() {
                records.push(ChatRecord {
                    game_state_index: parser.game_state_index(),
                    server_time_ms: server_time,
                    message: text.clone(),
                });
            }
            break;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================
// Tests
// ============================================================
