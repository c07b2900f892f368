// msg.rs — bit-addressable message buffer with typed reads/writes
//
// One Message wraps one demo message payload. The cursor is a bit
// position; Dm66+ streams route every whole byte through the Huffman
// codec while older streams are raw. Reading past the end returns zero
// and raises the overflow flag; nothing panics. Callers check
// valid_state() after a batch of reads.

use crate::fields;
use crate::huffman::HUFFMAN;
use crate::qshared::{
    EntityState, PlayerState, Protocol, BIG_INFO_STRING, MAX_STRING_CHARS,
};

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub data: Vec<u8>,
    /// Bytes valid for reading, or written so far.
    pub cursize: usize,
    pub maxsize: usize,
    /// Cursor, in bits.
    pub bit: usize,
    pub huffman: bool,
    pub overflowed: bool,
    /// Which file this message came from, for diagnostics.
    pub file_name: String,
}

impl Message {
    pub fn with_capacity(maxsize: usize) -> Self {
        Self {
            data: vec![0u8; maxsize],
            cursize: 0,
            maxsize,
            bit: 0,
            huffman: false,
            overflowed: false,
            file_name: String::new(),
        }
    }

    /// Reset for writing. The previously used range is re-zeroed so bit
    /// writes can OR into clean bytes.
    pub fn init_write(&mut self) {
        let used = self.cursize.min(self.data.len());
        self.data[..used].fill(0);
        self.cursize = 0;
        self.bit = 0;
        self.overflowed = false;
    }

    /// Take ownership of a payload for reading.
    pub fn init_read(&mut self, payload: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.cursize = payload.len();
        self.maxsize = self.maxsize.max(payload.len());
        self.bit = 0;
        self.overflowed = false;
    }

    /// Rewind to the start without touching the buffer. Turns a freshly
    /// written message into a readable one.
    pub fn reset_cursor(&mut self) {
        self.bit = 0;
        self.overflowed = false;
    }

    pub fn set_huffman(&mut self, on: bool) {
        self.huffman = on;
    }

    pub fn set_file_name(&mut self, name: &str) {
        self.file_name = name.to_string();
    }

    pub fn valid_state(&self) -> bool {
        !self.overflowed
    }

    /// Bytes consumed so far (partial bytes count as consumed).
    pub fn bytes_read(&self) -> usize {
        (self.bit + 7) >> 3
    }

    pub fn at_end(&self) -> bool {
        self.bit >= self.cursize * 8
    }

    /// Advance to the next byte boundary. Legacy byte-aligned protocols do
    /// this after every dispatch.
    pub fn go_to_next_byte(&mut self) {
        self.bit = (self.bit + 7) & !7;
    }

    // ============================================================
    // Raw bit access
    // ============================================================

    fn read_raw_bit(&mut self) -> u32 {
        if self.bit >= self.cursize * 8 {
            self.overflowed = true;
            return 0;
        }
        let byte = self.data[self.bit >> 3];
        let bit = (byte >> (self.bit & 7)) & 1;
        self.bit += 1;
        bit as u32
    }

    fn write_raw_bit(&mut self, value: u32) {
        if self.bit >= self.maxsize * 8 {
            self.overflowed = true;
            return;
        }
        if value & 1 != 0 {
            self.data[self.bit >> 3] |= 1 << (self.bit & 7);
        }
        self.bit += 1;
        self.cursize = (self.bit + 7) >> 3;
    }

    fn read_huff_symbol(&mut self) -> u32 {
        HUFFMAN.decode(|| self.read_raw_bit()) as u32
    }

    fn write_huff_symbol(&mut self, symbol: u32) {
        let code = HUFFMAN.code(symbol as u8);
        for i in 0..code.length {
            self.write_raw_bit((code.bits >> i) & 1);
        }
    }

    // ============================================================
    // Bit-level typed access
    // ============================================================

    /// Read `bits` bits (1..=32). Negative widths sign-extend.
    pub fn read_bits(&mut self, bits: i32) -> i32 {
        let signed = bits < 0;
        let bits = bits.unsigned_abs() as usize;
        debug_assert!(bits >= 1 && bits <= 32);

        let mut value: u32 = 0;
        if self.huffman {
            let frac = bits & 7;
            for i in 0..frac {
                value |= self.read_raw_bit() << i;
            }
            let mut shift = frac;
            while shift < bits {
                value |= self.read_huff_symbol() << shift;
                shift += 8;
            }
        } else {
            for i in 0..bits {
                value |= self.read_raw_bit() << i;
            }
        }

        let mut value = value as i32;
        if signed && bits < 32 && value & (1 << (bits - 1)) != 0 {
            value |= -1i32 ^ ((1 << bits) - 1);
        }
        value
    }

    pub fn write_bits(&mut self, value: i32, bits: i32) {
        let bits = bits.unsigned_abs() as usize;
        debug_assert!(bits >= 1 && bits <= 32);

        let mut value = value as u32;
        if bits < 32 {
            value &= (1u32 << bits) - 1;
        }

        if self.huffman {
            let frac = bits & 7;
            for i in 0..frac {
                self.write_raw_bit((value >> i) & 1);
            }
            let mut shift = frac;
            while shift < bits {
                self.write_huff_symbol((value >> shift) & 0xff);
                shift += 8;
            }
        } else {
            for i in 0..bits {
                self.write_raw_bit((value >> i) & 1);
            }
        }
    }

    // ============================================================
    // Typed reads
    // ============================================================

    pub fn read_byte(&mut self) -> i32 {
        self.read_bits(8)
    }

    pub fn read_char(&mut self) -> i32 {
        self.read_bits(-8)
    }

    pub fn read_short(&mut self) -> i32 {
        self.read_bits(-16)
    }

    pub fn read_long(&mut self) -> i32 {
        self.read_bits(32)
    }

    /// Look at the next byte without consuming it.
    pub fn peek_byte(&mut self) -> i32 {
        let bit = self.bit;
        let overflowed = self.overflowed;
        let value = self.read_byte();
        self.bit = bit;
        self.overflowed = overflowed;
        value
    }

    fn read_string_with_cap(&mut self, cap: usize) -> String {
        let mut bytes = Vec::new();
        loop {
            let c = self.read_byte();
            if c == 0 || self.overflowed {
                break;
            }
            if bytes.len() < cap - 1 {
                bytes.push(c as u8);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// NUL-terminated string, at most MAX_STRING_CHARS including the NUL.
    pub fn read_string(&mut self) -> String {
        self.read_string_with_cap(MAX_STRING_CHARS)
    }

    /// NUL-terminated string, at most BIG_INFO_STRING including the NUL.
    pub fn read_big_string(&mut self) -> String {
        self.read_string_with_cap(BIG_INFO_STRING)
    }

    pub fn read_data(&mut self, out: &mut [u8]) {
        for slot in out.iter_mut() {
            *slot = self.read_byte() as u8;
        }
    }

    // ============================================================
    // Typed writes
    // ============================================================

    pub fn write_byte(&mut self, value: i32) {
        self.write_bits(value, 8);
    }

    pub fn write_short(&mut self, value: i32) {
        self.write_bits(value, 16);
    }

    pub fn write_long(&mut self, value: i32) {
        self.write_bits(value, 32);
    }

    fn write_string_with_cap(&mut self, s: &str, cap: usize) {
        for &b in s.as_bytes().iter().take(cap - 1) {
            self.write_byte(b as i32);
        }
        self.write_byte(0);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_string_with_cap(s, MAX_STRING_CHARS);
    }

    pub fn write_big_string(&mut self, s: &str) {
        self.write_string_with_cap(s, BIG_INFO_STRING);
    }

    pub fn write_data(&mut self, data: &[u8]) {
        for &b in data {
            self.write_byte(b as i32);
        }
    }

    // ============================================================
    // Delta state: thin layer over the field codec
    // ============================================================

    /// Sets `changed` iff any field differed from the base. A decoded
    /// `number` of ENTITYNUM_NONE means the entity was removed. Returns
    /// false on stream desync.
    pub fn read_delta_entity(
        &mut self,
        protocol: Protocol,
        changed: &mut bool,
        from: &EntityState,
        to: &mut EntityState,
        number: i32,
    ) -> bool {
        fields::read_delta_entity(self, protocol, changed, from, to, number)
    }

    /// Emits nothing when nothing changed and `force` is false. `to` of
    /// None encodes a removal.
    pub fn write_delta_entity(
        &mut self,
        protocol: Protocol,
        from: &EntityState,
        to: Option<&EntityState>,
        force: bool,
    ) {
        fields::write_delta_entity(self, protocol, from, to, force)
    }

    pub fn read_delta_player(
        &mut self,
        protocol: Protocol,
        from: Option<&PlayerState>,
        to: &mut PlayerState,
    ) -> bool {
        fields::read_delta_player(self, protocol, from, to)
    }

    pub fn write_delta_player(
        &mut self,
        protocol: Protocol,
        from: Option<&PlayerState>,
        to: &PlayerState,
    ) {
        fields::write_delta_player(self, protocol, from, to)
    }
}

// ============================================================
// Tests
// ============================================================
