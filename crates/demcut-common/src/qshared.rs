// qshared.rs — foundational constants and wire-state types shared by all modules

// ============================================================
// Wire limits
// ============================================================

pub const MAX_CLIENTS: usize = 64;

/// Number of bits used to encode an entity slot on the wire.
pub const GENTITYNUM_BITS: i32 = 10;
pub const MAX_GENTITIES: i32 = 1 << GENTITYNUM_BITS;

/// Reserved slot: list terminator in packet entities, and the number a
/// delta-removed entity decodes to.
pub const ENTITYNUM_NONE: i32 = MAX_GENTITIES - 1;
pub const ENTITYNUM_WORLD: i32 = MAX_GENTITIES - 2;

pub const MAX_CONFIGSTRINGS: usize = 1024;
pub const MAX_STRING_CHARS: usize = 1024;
pub const BIG_INFO_STRING: usize = 8192;
pub const MAX_MSGLEN: usize = 16384;

/// Snapshot ring size. Power of two; lookups use `messageNum & PACKET_MASK`.
pub const PACKET_BACKUP: i32 = 32;
pub const PACKET_MASK: i32 = PACKET_BACKUP - 1;

/// Entity parse ring size. Power of two.
pub const MAX_PARSE_ENTITIES: i32 = 2048;

pub const MAX_STATS: usize = 16;
pub const MAX_PERSISTANT: usize = 16;
pub const MAX_POWERUPS: usize = 16;
pub const MAX_WEAPONS: usize = 16;
pub const MAX_PS_EVENTS: usize = 2;
pub const MAX_MAP_AREA_BYTES: usize = 32;

// ============================================================
// Entity events
// ============================================================

/// An event-bearing entity repeats its event for EVENT_VALID_MSEC so that
/// clients joining mid-stream still see it. The parser uses this window to
/// tell a genuinely new event from a repeat.
pub const EVENT_VALID_MSEC: i32 = 300;

pub const EV_EVENT_BIT1: i32 = 0x100;
pub const EV_EVENT_BIT2: i32 = 0x200;
pub const EV_EVENT_BITS: i32 = EV_EVENT_BIT1 | EV_EVENT_BIT2;

/// First event entity type; `eType >= ET_EVENTS` marks an event entity and
/// `eType - ET_EVENTS` (minus the repeat bits) is the event id.
pub const ET_EVENTS: i32 = 13;

// ============================================================
// Protocols
// ============================================================

/// The versioned wire formats, oldest first. Ordering is meaningful: many
/// framing rules are expressed as "at least" / "at most" some version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Dm3,
    Dm48,
    Dm66,
    Dm68,
    Dm73,
    Dm90,
}

/// File extensions identify the protocol at open time.
pub const DEMO_FILE_EXTENSIONS: [(Protocol, &str); 6] = [
    (Protocol::Dm3, ".dm3"),
    (Protocol::Dm48, ".dm_48"),
    (Protocol::Dm66, ".dm_66"),
    (Protocol::Dm68, ".dm_68"),
    (Protocol::Dm73, ".dm_73"),
    (Protocol::Dm90, ".dm_90"),
];

impl Protocol {
    /// Protocol from a demo file path, by extension (case-insensitive).
    pub fn from_file_path(path: &str) -> Option<Protocol> {
        let lower = path.to_ascii_lowercase();
        DEMO_FILE_EXTENSIONS
            .iter()
            .find(|(_, ext)| lower.ends_with(ext))
            .map(|(p, _)| *p)
    }

    pub fn file_extension(self) -> &'static str {
        DEMO_FILE_EXTENSIONS
            .iter()
            .find(|(p, _)| *p == self)
            .map(|(_, ext)| *ext)
            .unwrap_or("")
    }

    /// Dm66 and later streams are Huffman-coded; earlier ones are raw bytes.
    pub fn uses_huffman(self) -> bool {
        self >= Protocol::Dm66
    }

    /// Legacy protocols re-align to a byte boundary after every dispatch.
    pub fn byte_aligned(self) -> bool {
        self <= Protocol::Dm48
    }

    /// The wire protocol number, as carried in server info strings.
    pub fn number(self) -> i32 {
        match self {
            Protocol::Dm3 => 3,
            Protocol::Dm48 => 48,
            Protocol::Dm66 => 66,
            Protocol::Dm68 => 68,
            Protocol::Dm73 => 73,
            Protocol::Dm90 => 90,
        }
    }
}

// ============================================================
// Server-to-client ops
// ============================================================

pub const SVC_BAD: i32 = 0;
pub const SVC_NOP: i32 = 1;
pub const SVC_GAMESTATE: i32 = 2;
pub const SVC_CONFIGSTRING: i32 = 3;
pub const SVC_BASELINE: i32 = 4;
pub const SVC_SERVERCOMMAND: i32 = 5;
pub const SVC_DOWNLOAD: i32 = 6;
pub const SVC_SNAPSHOT: i32 = 7;
pub const SVC_EOF: i32 = 8;
pub const SVC_VOIP: i32 = 9;
pub const SVC_EXTENSION: i32 = 10;

/// Server command name strings (for debug display)
pub static SVC_STRINGS: [&str; 11] = [
    "svc_bad",
    "svc_nop",
    "svc_gamestate",
    "svc_configstring",
    "svc_baseline",
    "svc_serverCommand",
    "svc_download",
    "svc_snapshot",
    "svc_EOF",
    "svc_voip",
    "svc_extension",
];

// ============================================================
// Per-protocol config string layout
// ============================================================

pub const CS_SERVERINFO: i32 = 0;
pub const CS_SYSTEMINFO: i32 = 1;
pub const CS_MODELS: i32 = 32;
pub const CS_SOUNDS: i32 = CS_MODELS + 256;

/// First player-info config string slot. The Dm73 family moved the player
/// block, so cross-family conversion must renumber these.
pub const CS_PLAYERS_68: i32 = 544;
pub const CS_PLAYERS_73: i32 = 529;

pub const CS_LOCATIONS_68: i32 = 608;
pub const CS_LOCATIONS_73: i32 = 593;

pub fn first_player_config_string(protocol: Protocol) -> i32 {
    if protocol <= Protocol::Dm68 {
        CS_PLAYERS_68
    } else {
        CS_PLAYERS_73
    }
}

pub fn first_location_config_string(protocol: Protocol) -> i32 {
    if protocol <= Protocol::Dm68 {
        CS_LOCATIONS_68
    } else {
        CS_LOCATIONS_73
    }
}

/// Obituary event id within the event range. The Dm73 family inserted two
/// events before it.
pub fn obituary_event_id(protocol: Protocol) -> i32 {
    if protocol <= Protocol::Dm68 {
        58
    } else {
        60
    }
}

// ============================================================
// Teams
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Team {
    Free = 0,
    Red,
    Blue,
    Spectator,
}

// ============================================================
// Means of death
// ============================================================

static MEANS_OF_DEATH_68: [&str; 24] = [
    "unknown",
    "shotgun",
    "gauntlet",
    "machine gun",
    "grenade",
    "grenade splash",
    "rocket",
    "rocket splash",
    "plasma",
    "plasma splash",
    "railgun",
    "lightning",
    "BFG",
    "BFG splash",
    "water",
    "slime",
    "lava",
    "crush",
    "telefrag",
    "fall",
    "suicide",
    "target laser",
    "trigger hurt",
    "grapple",
];

static MEANS_OF_DEATH_73: [&str; 32] = [
    "unknown",
    "shotgun",
    "gauntlet",
    "machine gun",
    "grenade",
    "grenade splash",
    "rocket",
    "rocket splash",
    "plasma",
    "plasma splash",
    "railgun",
    "lightning",
    "BFG",
    "BFG splash",
    "water",
    "slime",
    "lava",
    "crush",
    "telefrag",
    "fall",
    "suicide",
    "target laser",
    "trigger hurt",
    // mission pack start
    "nailgun",
    "chaingun",
    "proximity mine",
    "kamikaze",
    "juiced",
    // mission pack end
    "grapple",
    "team switch",
    "thaw",
    "heavy machine gun",
];

/// Id out of range maps to "unknown".
pub fn get_mean_of_death_name(mod_id: i32, protocol: Protocol) -> &'static str {
    let table: &[&str] = if protocol <= Protocol::Dm68 {
        &MEANS_OF_DEATH_68
    } else {
        &MEANS_OF_DEATH_73
    };

    let idx = if mod_id < 0 || mod_id >= table.len() as i32 {
        0
    } else {
        mod_id as usize
    };
    table[idx]
}

/// Remap a means-of-death id between protocol families. The Dm73 family
/// inserted five ids before "grapple"; ids without a counterpart map to 0.
pub fn convert_mean_of_death(mod_id: i32, from: Protocol, to: Protocol) -> i32 {
    let from_73 = from > Protocol::Dm68;
    let to_73 = to > Protocol::Dm68;
    if from_73 == to_73 {
        return mod_id;
    }

    if !from_73 {
        // Dm68 family -> Dm73 family: grapple moves past the inserted block.
        match mod_id {
            23 => 28,
            m if m >= 0 && m < 23 => m,
            _ => 0,
        }
    } else {
        match mod_id {
            28 => 23,
            m if m >= 0 && m < 23 => m,
            _ => 0,
        }
    }
}

// ============================================================
// Entity state: the union of the three per-protocol layouts.
//
// Dm3/Dm48/Dm66/Dm68 use the base fields; Dm73 adds the jump pair and Dm90
// additionally carries trajectory gravity. Which fields travel on the wire
// is decided by the per-protocol field tables, not by this struct.
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityState {
    pub number: i32,
    pub e_type: i32,
    pub e_flags: i32,

    pub pos_tr_type: i32,
    pub pos_tr_time: i32,
    pub pos_tr_duration: i32,
    pub pos_tr_base: [f32; 3],
    pub pos_tr_delta: [f32; 3],

    pub apos_tr_type: i32,
    pub apos_tr_time: i32,
    pub apos_tr_duration: i32,
    pub apos_tr_base: [f32; 3],
    pub apos_tr_delta: [f32; 3],

    pub time: i32,
    pub time2: i32,

    pub origin: [f32; 3],
    pub origin2: [f32; 3],
    pub angles: [f32; 3],
    pub angles2: [f32; 3],

    pub other_entity_num: i32,
    pub other_entity_num2: i32,
    pub ground_entity_num: i32,

    pub constant_light: i32,
    pub loop_sound: i32,

    pub model_index: i32,
    pub model_index2: i32,
    pub client_num: i32,
    pub frame: i32,

    pub solid: i32,

    pub event: i32,
    pub event_parm: i32,

    pub powerups: i32,
    pub weapon: i32,
    pub legs_anim: i32,
    pub torso_anim: i32,

    pub generic1: i32,

    // Dm73 and later
    pub jump_time: i32,
    pub double_jumped: i32,

    // Dm90 only
    pub pos_gravity: i32,
}

impl EntityState {
    /// True iff every field is zero, the "baseline not set" marker.
    pub fn is_zeroed(&self) -> bool {
        *self == EntityState::default()
    }
}

// ============================================================
// Player state
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    pub command_time: i32,
    pub pm_type: i32,
    pub bob_cycle: i32,
    pub pm_flags: i32,
    pub pm_time: i32,

    pub origin: [f32; 3],
    pub velocity: [f32; 3],

    pub weapon_time: i32,
    pub gravity: i32,
    pub speed: i32,
    pub delta_angles: [i32; 3],

    pub ground_entity_num: i32,

    pub legs_timer: i32,
    pub legs_anim: i32,
    pub torso_timer: i32,
    pub torso_anim: i32,

    pub movement_dir: i32,
    pub grapple_point: [f32; 3],

    pub e_flags: i32,
    pub event_sequence: i32,
    pub events: [i32; MAX_PS_EVENTS],
    pub event_parms: [i32; MAX_PS_EVENTS],
    pub external_event: i32,
    pub external_event_parm: i32,

    pub client_num: i32,
    pub weapon: i32,
    pub weaponstate: i32,

    pub view_angles: [f32; 3],
    pub view_height: i32,

    pub damage_event: i32,
    pub damage_yaw: i32,
    pub damage_pitch: i32,
    pub damage_count: i32,

    pub stats: [i32; MAX_STATS],
    pub persistant: [i32; MAX_PERSISTANT],
    pub powerups: [i32; MAX_POWERUPS],
    pub ammo: [i32; MAX_WEAPONS],

    pub generic1: i32,
    pub loop_sound: i32,
    pub jumppad_ent: i32,

    // Dm73 and later
    pub jump_time: i32,
    pub double_jumped: i32,
}

// ============================================================
// Snapshot
// ============================================================

/// A snapshot is *valid* iff it could be reconstructed: its delta base
/// existed, was itself valid, and its entities were still in the parse
/// ring. Invalid snapshots occupy their ring slot but are never used as a
/// delta base.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub valid: bool,
    pub snap_flags: i32,
    pub server_time: i32,
    pub message_num: i32,
    pub delta_num: i32,
    pub areamask: [u8; MAX_MAP_AREA_BYTES],
    pub player_state: PlayerState,
    pub num_entities: i32,
    pub parse_entities_num: i32,
    pub server_command_num: i32,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            valid: false,
            snap_flags: 0,
            server_time: 0,
            message_num: 0,
            delta_num: 0,
            areamask: [0; MAX_MAP_AREA_BYTES],
            player_state: PlayerState::default(),
            num_entities: 0,
            parse_entities_num: 0,
            server_command_num: 0,
        }
    }
}

// ============================================================
// Tests
// ============================================================
