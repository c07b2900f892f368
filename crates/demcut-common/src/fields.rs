// fields.rs — per-protocol delta-field tables and the delta codec
//
// Entity and player state travel as "only what changed" against a
// reference state. Each protocol defines an ordered field table; the
// writer sends the index of the last changed field (lc) and one presence
// bit per field before it, the reader mirrors that walk. The tables are
// data: Dm3/Dm48/Dm66 share the Dm68 layout, Dm73 appends the jump pair,
// Dm90 additionally carries trajectory gravity.

use std::sync::LazyLock;

use crate::msg::Message;
use crate::qshared::{
    EntityState, PlayerState, Protocol, ENTITYNUM_NONE, GENTITYNUM_BITS, MAX_GENTITIES,
    MAX_POWERUPS,
};

/// Small floats are sent as a truncated integer in this many bits; anything
/// else falls back to the full 32-bit pattern.
pub const FLOAT_INT_BITS: i32 = 13;
pub const FLOAT_INT_BIAS: i32 = 1 << (FLOAT_INT_BITS - 1);

/// One wire field. `bits` of 0 marks a float; a negative width is a
/// sign-extended integer. `get` returns the raw wire pattern (floats via
/// their bit representation) so change detection is an integer compare.
#[derive(Clone, Copy)]
pub struct EntField {
    pub name: &'static str,
    pub bits: i32,
    pub get: fn(&EntityState) -> i32,
    pub set: fn(&mut EntityState, i32),
}

#[derive(Clone, Copy)]
pub struct PsField {
    pub name: &'static str,
    pub bits: i32,
    pub get: fn(&PlayerState) -> i32,
    pub set: fn(&mut PlayerState, i32),
}

macro_rules! ent_i {
    ($field:ident, $bits:expr) => {
        EntField {
            name: stringify!($field),
            bits: $bits,
            get: |s: &EntityState| s.$field,
            set: |s: &mut EntityState, v: i32| s.$field = v,
        }
    };
}

macro_rules! ent_f {
    ($field:ident) => {
        EntField {
            name: stringify!($field),
            bits: 0,
            get: |s: &EntityState| s.$field.to_bits() as i32,
            set: |s: &mut EntityState, v: i32| s.$field = f32::from_bits(v as u32),
        }
    };
    ($field:ident[$idx:literal]) => {
        EntField {
            name: concat!(stringify!($field), "[", stringify!($idx), "]"),
            bits: 0,
            get: |s: &EntityState| s.$field[$idx].to_bits() as i32,
            set: |s: &mut EntityState, v: i32| s.$field[$idx] = f32::from_bits(v as u32),
        }
    };
}

macro_rules! ps_i {
    ($field:ident, $bits:expr) => {
        PsField {
            name: stringify!($field),
            bits: $bits,
            get: |s: &PlayerState| s.$field,
            set: |s: &mut PlayerState, v: i32| s.$field = v,
        }
    };
    ($field:ident[$idx:literal], $bits:expr) => {
        PsField {
            name: concat!(stringify!($field), "[", stringify!($idx), "]"),
            bits: $bits,
            get: |s: &PlayerState| s.$field[$idx],
            set: |s: &mut PlayerState, v: i32| s.$field[$idx] = v,
        }
    };
}

macro_rules! ps_f {
    ($field:ident) => {
        PsField {
            name: stringify!($field),
            bits: 0,
            get: |s: &PlayerState| s.$field.to_bits() as i32,
            set: |s: &mut PlayerState, v: i32| s.$field = f32::from_bits(v as u32),
        }
    };
    ($field:ident[$idx:literal]) => {
        PsField {
            name: concat!(stringify!($field), "[", stringify!($idx), "]"),
            bits: 0,
            get: |s: &PlayerState| s.$field[$idx].to_bits() as i32,
            set: |s: &mut PlayerState, v: i32| s.$field[$idx] = f32::from_bits(v as u32),
        }
    };
}

// ============================================================
// Entity state tables
// ============================================================

static ENTITY_FIELDS_68: LazyLock<Vec<EntField>> = LazyLock::new(|| {
    vec![
        ent_i!(pos_tr_time, 32),
        ent_f!(pos_tr_base[0]),
        ent_f!(pos_tr_base[1]),
        ent_f!(pos_tr_delta[0]),
        ent_f!(pos_tr_delta[1]),
        ent_f!(pos_tr_base[2]),
        ent_f!(apos_tr_base[1]),
        ent_f!(pos_tr_delta[2]),
        ent_f!(apos_tr_base[0]),
        ent_i!(event, 10),
        ent_f!(angles2[1]),
        ent_i!(e_type, 8),
        ent_i!(torso_anim, 8),
        ent_i!(event_parm, 8),
        ent_i!(legs_anim, 8),
        ent_i!(ground_entity_num, GENTITYNUM_BITS),
        ent_i!(pos_tr_type, 8),
        ent_i!(e_flags, 19),
        ent_i!(other_entity_num, GENTITYNUM_BITS),
        ent_i!(weapon, 8),
        ent_i!(client_num, 8),
        ent_f!(angles[1]),
        ent_i!(pos_tr_duration, 32),
        ent_i!(apos_tr_type, 8),
        ent_f!(origin[0]),
        ent_f!(origin[1]),
        ent_f!(origin[2]),
        ent_i!(solid, 24),
        ent_i!(powerups, MAX_POWERUPS as i32),
        ent_i!(model_index, 8),
        ent_i!(other_entity_num2, GENTITYNUM_BITS),
        ent_i!(loop_sound, 8),
        ent_i!(generic1, 8),
        ent_f!(origin2[2]),
        ent_f!(origin2[0]),
        ent_f!(origin2[1]),
        ent_i!(model_index2, 8),
        ent_f!(angles[0]),
        ent_i!(time, 32),
        ent_i!(apos_tr_time, 32),
        ent_i!(apos_tr_duration, 32),
        ent_f!(apos_tr_base[2]),
        ent_f!(apos_tr_delta[0]),
        ent_f!(apos_tr_delta[1]),
        ent_f!(apos_tr_delta[2]),
        ent_i!(time2, 32),
        ent_f!(angles[2]),
        ent_f!(angles2[0]),
        ent_f!(angles2[2]),
        ent_i!(constant_light, 32),
        ent_i!(frame, 16),
    ]
});

static ENTITY_FIELDS_73: LazyLock<Vec<EntField>> = LazyLock::new(|| {
    let mut fields = ENTITY_FIELDS_68.clone();
    fields.push(ent_i!(jump_time, 32));
    fields.push(ent_i!(double_jumped, 1));
    fields
});

static ENTITY_FIELDS_90: LazyLock<Vec<EntField>> = LazyLock::new(|| {
    let mut fields = ENTITY_FIELDS_73.clone();
    fields.push(ent_i!(pos_gravity, 32));
    fields
});

pub fn entity_fields(protocol: Protocol) -> &'static [EntField] {
    match protocol {
        Protocol::Dm3 | Protocol::Dm48 | Protocol::Dm66 | Protocol::Dm68 => {
            ENTITY_FIELDS_68.as_slice()
        }
        Protocol::Dm73 => ENTITY_FIELDS_73.as_slice(),
        Protocol::Dm90 => ENTITY_FIELDS_90.as_slice(),
    }
}

// ============================================================
// Player state tables
// ============================================================

static PLAYER_FIELDS_68: LazyLock<Vec<PsField>> = LazyLock::new(|| {
    vec![
        ps_i!(command_time, 32),
        ps_f!(origin[0]),
        ps_f!(origin[1]),
        ps_i!(bob_cycle, 8),
        ps_f!(velocity[0]),
        ps_f!(velocity[1]),
        ps_f!(view_angles[1]),
        ps_f!(view_angles[0]),
        ps_i!(weapon_time, -16),
        ps_f!(origin[2]),
        ps_f!(velocity[2]),
        ps_i!(legs_timer, 8),
        ps_i!(pm_time, -16),
        ps_i!(event_sequence, 16),
        ps_i!(torso_anim, 8),
        ps_i!(movement_dir, 4),
        ps_i!(events[0], 8),
        ps_i!(legs_anim, 8),
        ps_i!(events[1], 8),
        ps_i!(pm_flags, 16),
        ps_i!(ground_entity_num, GENTITYNUM_BITS),
        ps_i!(weaponstate, 4),
        ps_i!(e_flags, 16),
        ps_i!(external_event, 10),
        ps_i!(gravity, 16),
        ps_i!(speed, 16),
        ps_i!(delta_angles[1], 16),
        ps_i!(external_event_parm, 8),
        ps_i!(view_height, -8),
        ps_i!(damage_event, 8),
        ps_i!(damage_yaw, 8),
        ps_i!(damage_pitch, 8),
        ps_i!(damage_count, 8),
        ps_i!(generic1, 8),
        ps_i!(pm_type, 8),
        ps_i!(delta_angles[0], 16),
        ps_i!(delta_angles[2], 16),
        ps_i!(torso_timer, 12),
        ps_i!(event_parms[0], 8),
        ps_i!(event_parms[1], 8),
        ps_i!(client_num, 8),
        ps_i!(weapon, 5),
        ps_f!(view_angles[2]),
        ps_f!(grapple_point[0]),
        ps_f!(grapple_point[1]),
        ps_f!(grapple_point[2]),
        ps_i!(jumppad_ent, 10),
        ps_i!(loop_sound, 16),
    ]
});

static PLAYER_FIELDS_73: LazyLock<Vec<PsField>> = LazyLock::new(|| {
    let mut fields = PLAYER_FIELDS_68.clone();
    fields.push(ps_i!(jump_time, 32));
    fields.push(ps_i!(double_jumped, 1));
    fields
});

pub fn player_fields(protocol: Protocol) -> &'static [PsField] {
    match protocol {
        Protocol::Dm3 | Protocol::Dm48 | Protocol::Dm66 | Protocol::Dm68 => {
            PLAYER_FIELDS_68.as_slice()
        }
        Protocol::Dm73 | Protocol::Dm90 => PLAYER_FIELDS_73.as_slice(),
    }
}

// ============================================================
// Delta entity codec
// ============================================================

/// Write a delta update of `to` against `from`. `to` of None encodes a
/// removal. When nothing changed, nothing at all is emitted unless `force`
/// is set (baselines and new entities are forced).
pub fn write_delta_entity(
    msg: &mut Message,
    protocol: Protocol,
    from: &EntityState,
    to: Option<&EntityState>,
    force: bool,
) {
    let to = match to {
        Some(to) => to,
        None => {
            msg.write_bits(from.number, GENTITYNUM_BITS);
            msg.write_bits(1, 1);
            return;
        }
    };

    debug_assert!(to.number >= 0 && to.number < MAX_GENTITIES);

    let fields = entity_fields(protocol);
    let mut lc = 0;
    for (i, field) in fields.iter().enumerate() {
        if (field.get)(from) != (field.get)(to) {
            lc = i + 1;
        }
    }

    if lc == 0 {
        if !force {
            return;
        }
        msg.write_bits(to.number, GENTITYNUM_BITS);
        msg.write_bits(0, 1); // not removed
        msg.write_bits(0, 1); // no delta
        return;
    }

    msg.write_bits(to.number, GENTITYNUM_BITS);
    msg.write_bits(0, 1); // not removed
    msg.write_bits(1, 1); // state present
    msg.write_byte(lc as i32);

    for field in &fields[..lc] {
        let from_v = (field.get)(from);
        let to_v = (field.get)(to);
        if from_v == to_v {
            msg.write_bits(0, 1);
            continue;
        }
        msg.write_bits(1, 1);

        if field.bits == 0 {
            let full = f32::from_bits(to_v as u32);
            let trunc = full as i32;
            // Value compare, not bit compare: -0.0 takes the zero shortcut.
            if full == 0.0 {
                msg.write_bits(0, 1);
            } else {
                msg.write_bits(1, 1);
                if trunc as f32 == full
                    && trunc + FLOAT_INT_BIAS >= 0
                    && trunc + FLOAT_INT_BIAS < (1 << FLOAT_INT_BITS)
                {
                    msg.write_bits(0, 1);
                    msg.write_bits(trunc + FLOAT_INT_BIAS, FLOAT_INT_BITS);
                } else {
                    msg.write_bits(1, 1);
                    msg.write_bits(to_v, 32);
                }
            }
        } else if to_v == 0 {
            msg.write_bits(0, 1);
        } else {
            msg.write_bits(1, 1);
            msg.write_bits(to_v, field.bits);
        }
    }
}

/// Read a delta entity into `to`. The entity number was already consumed by
/// the caller. `changed` is set iff any field differed from the base; a
/// resulting number of ENTITYNUM_NONE is a removal. Returns false when the
/// stream desynchronized.
pub fn read_delta_entity(
    msg: &mut Message,
    protocol: Protocol,
    changed: &mut bool,
    from: &EntityState,
    to: &mut EntityState,
    number: i32,
) -> bool {
    if number < 0 || number >= MAX_GENTITIES {
        return false;
    }

    // Removed entity.
    if msg.read_bits(1) == 1 {
        *to = EntityState::default();
        to.number = ENTITYNUM_NONE;
        *changed = true;
        return msg.valid_state();
    }

    // No delta at all.
    if msg.read_bits(1) == 0 {
        *to = *from;
        to.number = number;
        *changed = false;
        return msg.valid_state();
    }

    let fields = entity_fields(protocol);
    let lc = msg.read_byte();
    if lc < 0 || lc as usize > fields.len() {
        return false;
    }

    *to = *from;
    to.number = number;
    *changed = false;

    for field in &fields[..lc as usize] {
        if msg.read_bits(1) == 0 {
            continue; // unchanged, already copied from the base
        }
        *changed = true;

        let value = if field.bits == 0 {
            if msg.read_bits(1) == 0 {
                0
            } else if msg.read_bits(1) == 0 {
                let trunc = msg.read_bits(FLOAT_INT_BITS) - FLOAT_INT_BIAS;
                (trunc as f32).to_bits() as i32
            } else {
                msg.read_bits(32)
            }
        } else if msg.read_bits(1) == 0 {
            0
        } else {
            msg.read_bits(field.bits)
        };
        (field.set)(to, value);
    }

    msg.valid_state()
}

// ============================================================
// Delta player codec
// ============================================================

fn array_delta_mask(from: &[i32], to: &[i32]) -> i32 {
    let mut mask = 0;
    for i in 0..from.len() {
        if from[i] != to[i] {
            mask |= 1 << i;
        }
    }
    mask
}

/// Write a delta player state. A missing `from` deltas against the zero
/// state (full encode).
pub fn write_delta_player(
    msg: &mut Message,
    protocol: Protocol,
    from: Option<&PlayerState>,
    to: &PlayerState,
) {
    let zero = PlayerState::default();
    let from = from.unwrap_or(&zero);

    let fields = player_fields(protocol);
    let mut lc = 0;
    for (i, field) in fields.iter().enumerate() {
        if (field.get)(from) != (field.get)(to) {
            lc = i + 1;
        }
    }

    msg.write_byte(lc as i32);

    for field in &fields[..lc] {
        let from_v = (field.get)(from);
        let to_v = (field.get)(to);
        if from_v == to_v {
            msg.write_bits(0, 1);
            continue;
        }
        msg.write_bits(1, 1);

        if field.bits == 0 {
            let full = f32::from_bits(to_v as u32);
            let trunc = full as i32;
            if trunc as f32 == full
                && trunc + FLOAT_INT_BIAS >= 0
                && trunc + FLOAT_INT_BIAS < (1 << FLOAT_INT_BITS)
            {
                msg.write_bits(0, 1);
                msg.write_bits(trunc + FLOAT_INT_BIAS, FLOAT_INT_BITS);
            } else {
                msg.write_bits(1, 1);
                msg.write_bits(to_v, 32);
            }
        } else {
            msg.write_bits(to_v, field.bits);
        }
    }

    let stats_bits = array_delta_mask(&from.stats, &to.stats);
    let persistant_bits = array_delta_mask(&from.persistant, &to.persistant);
    let ammo_bits = array_delta_mask(&from.ammo, &to.ammo);
    let powerup_bits = array_delta_mask(&from.powerups, &to.powerups);

    if stats_bits == 0 && persistant_bits == 0 && ammo_bits == 0 && powerup_bits == 0 {
        msg.write_bits(0, 1);
        return;
    }
    msg.write_bits(1, 1);

    for (mask, values, long_form) in [
        (stats_bits, &to.stats, false),
        (persistant_bits, &to.persistant, false),
        (ammo_bits, &to.ammo, false),
        (powerup_bits, &to.powerups, true),
    ] {
        if mask == 0 {
            msg.write_bits(0, 1);
            continue;
        }
        msg.write_bits(1, 1);
        msg.write_bits(mask, 16);
        for (i, &value) in values.iter().enumerate() {
            if mask & (1 << i) != 0 {
                if long_form {
                    msg.write_long(value);
                } else {
                    msg.write_short(value);
                }
            }
        }
    }
}

/// Read a delta player state into `to`. Returns false when the stream
/// desynchronized.
pub fn read_delta_player(
    msg: &mut Message,
    protocol: Protocol,
    from: Option<&PlayerState>,
    to: &mut PlayerState,
) -> bool {
    let zero = PlayerState::default();
    let from = from.unwrap_or(&zero);
    *to = *from;

    let fields = player_fields(protocol);
    let lc = msg.read_byte();
    if lc < 0 || lc as usize > fields.len() {
        return false;
    }

    for field in &fields[..lc as usize] {
        if msg.read_bits(1) == 0 {
            continue;
        }

        let value = if field.bits == 0 {
            if msg.read_bits(1) == 0 {
                let trunc = msg.read_bits(FLOAT_INT_BITS) - FLOAT_INT_BIAS;
                (trunc as f32).to_bits() as i32
            } else {
                msg.read_bits(32)
            }
        } else {
            msg.read_bits(field.bits)
        };
        (field.set)(to, value);
    }

    if msg.read_bits(1) != 0 {
        let mut read_array = |msg: &mut Message, values: &mut [i32], long_form: bool| {
            if msg.read_bits(1) == 0 {
                return;
            }
            let mask = msg.read_bits(16);
            for i in 0..values.len() {
                if mask & (1 << i) != 0 {
                    values[i] = if long_form {
                        msg.read_long()
                    } else {
                        msg.read_short()
                    };
                }
            }
        };
        read_array(msg, &mut to.stats, false);
        read_array(msg, &mut to.persistant, false);
        read_array(msg, &mut to.ammo, false);
        read_array(msg, &mut to.powerups, true);
    }

    msg.valid_state()
}

// ============================================================
// Tests
// ============================================================
