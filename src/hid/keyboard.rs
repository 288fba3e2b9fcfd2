//! HID keyboard support
//!
//! Implements HID Boot Protocol keyboard reports (USB HID Spec 1.11,
//! Appendix B.1) and turns consecutive reports into key transitions.

use bitflags::bitflags;

/// HID keyboard report (boot protocol)
///
/// - Byte 0: Modifier keys (Ctrl, Alt, Shift, GUI)
/// - Byte 1: Reserved (OEM use)
/// - Bytes 2-7: Up to 6 simultaneous key presses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyboardReport {
    /// Modifier key states
    pub modifiers: KeyModifiers,
    keycodes: [u8; 6],
}

impl KeyboardReport {
    /// Report with no keys held
    pub const EMPTY: Self = Self {
        modifiers: KeyModifiers::empty(),
        keycodes: [0; 6],
    };

    /// Parse an 8-byte boot report; `None` if shorter
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }

        let mut keycodes = [0u8; 6];
        keycodes.copy_from_slice(&data[2..8]);
        Some(Self {
            modifiers: KeyModifiers::from_bits_truncate(data[0]),
            keycodes,
        })
    }

    /// Whether the report is the rollover error pattern (all 0x01)
    pub fn is_rollover(&self) -> bool {
        self.keycodes.iter().all(|&code| code == KeyCode::ERROR_ROLLOVER.0)
    }

    /// Get iterator over pressed keys
    pub fn keys_pressed(&self) -> impl Iterator<Item = KeyCode> + '_ {
        self.keycodes
            .iter()
            .filter(|&&code| code != 0) // 0x00 = no key
            .map(|&code| KeyCode(code))
    }

    /// Check if specific key is pressed
    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        key.0 != 0 && self.keycodes.contains(&key.0)
    }

    /// Key transitions from `previous` to `self`
    ///
    /// Releases come first, in `previous` slot order, then presses in
    /// `self` slot order. Each carries the modifiers of `self`.
    pub fn transitions<'a>(&'a self, previous: &'a Self) -> impl Iterator<Item = KeyEvent> + 'a {
        let modifiers = self.modifiers;
        let released = previous
            .keys_pressed()
            .filter(move |&key| !self.is_key_pressed(key))
            .map(move |key| KeyEvent {
                modifiers,
                key,
                pressed: false,
            });
        let pressed = self
            .keys_pressed()
            .filter(move |&key| !previous.is_key_pressed(key))
            .map(move |key| KeyEvent {
                modifiers,
                key,
                pressed: true,
            });
        released.chain(pressed)
    }
}

/// One key press or release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Modifiers held when the transition was reported
    pub modifiers: KeyModifiers,
    /// Key that changed
    pub key: KeyCode,
    /// `true` on press, `false` on release
    pub pressed: bool,
}

bitflags! {
    /// Keyboard modifier keys
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyModifiers: u8 {
        /// Left Control
        const LEFT_CTRL  = 0b00000001;
        /// Left Shift
        const LEFT_SHIFT = 0b00000010;
        /// Left Alt
        const LEFT_ALT   = 0b00000100;
        /// Left GUI (Windows/Command key)
        const LEFT_GUI   = 0b00001000;
        /// Right Control
        const RIGHT_CTRL  = 0b00010000;
        /// Right Shift
        const RIGHT_SHIFT = 0b00100000;
        /// Right Alt
        const RIGHT_ALT   = 0b01000000;
        /// Right GUI (Windows/Command key)
        const RIGHT_GUI   = 0b10000000;
    }
}

impl KeyModifiers {
    /// Check if any Shift key is pressed
    pub fn shift(&self) -> bool {
        self.intersects(Self::LEFT_SHIFT | Self::RIGHT_SHIFT)
    }
}

/// HID keyboard usage (Usage Page 0x07)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCode(pub u8);

#[allow(missing_docs)]
impl KeyCode {
    pub const ERROR_ROLLOVER: Self = Self(0x01);
    pub const A: Self = Self(0x04);
    pub const Z: Self = Self(0x1D);
    pub const KEY_1: Self = Self(0x1E);
    pub const KEY_0: Self = Self(0x27);
    pub const ENTER: Self = Self(0x28);
    pub const ESCAPE: Self = Self(0x29);
    pub const BACKSPACE: Self = Self(0x2A);
    pub const TAB: Self = Self(0x2B);
    pub const SPACE: Self = Self(0x2C);

    /// ASCII for printable keys, honouring Shift for letters and digits
    pub fn to_ascii(&self, modifiers: KeyModifiers) -> Option<char> {
        let shift = modifiers.shift();
        match self.0 {
            0x04..=0x1D if shift => Some((b'A' + (self.0 - 0x04)) as char),
            0x04..=0x1D => Some((b'a' + (self.0 - 0x04)) as char),
            0x1E..=0x27 if shift => b"!@#$%^&*()".get((self.0 - 0x1E) as usize).map(|&b| b as char),
            0x1E..=0x26 => Some((b'1' + (self.0 - 0x1E)) as char),
            0x27 => Some('0'),
            0x28 => Some('\n'),
            0x2B => Some('\t'),
            0x2C => Some(' '),
            _ => None,
        }
    }
}
