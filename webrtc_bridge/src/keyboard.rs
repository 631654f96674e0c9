// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DOM `KeyboardEvent.code` names to Linux evdev key codes.

use std::collections::HashMap;

pub const KEY_ESC: u16 = 1;
pub const KEY_BACKSPACE: u16 = 14;
pub const KEY_TAB: u16 = 15;
pub const KEY_ENTER: u16 = 28;
pub const KEY_LEFTCTRL: u16 = 29;
pub const KEY_LEFTSHIFT: u16 = 42;
pub const KEY_RIGHTSHIFT: u16 = 54;
pub const KEY_LEFTALT: u16 = 56;
pub const KEY_SPACE: u16 = 57;
pub const KEY_CAPSLOCK: u16 = 58;
pub const KEY_RIGHTCTRL: u16 = 97;
pub const KEY_RIGHTALT: u16 = 100;
pub const KEY_HOME: u16 = 102;
pub const KEY_UP: u16 = 103;
pub const KEY_PAGEUP: u16 = 104;
pub const KEY_LEFT: u16 = 105;
pub const KEY_RIGHT: u16 = 106;
pub const KEY_END: u16 = 107;
pub const KEY_DOWN: u16 = 108;
pub const KEY_PAGEDOWN: u16 = 109;
pub const KEY_INSERT: u16 = 110;
pub const KEY_DELETE: u16 = 111;
pub const KEY_MUTE: u16 = 113;
pub const KEY_VOLUMEDOWN: u16 = 114;
pub const KEY_VOLUMEUP: u16 = 115;
pub const KEY_POWER: u16 = 116;
pub const KEY_LEFTMETA: u16 = 125;
pub const KEY_RIGHTMETA: u16 = 126;
pub const KEY_MENU: u16 = 139;
pub const KEY_BACK: u16 = 158;
pub const KEY_HOMEPAGE: u16 = 172;
pub const KEY_APPSELECT: u16 = 0x244;

static DOM_KEYS: &[(&str, u16)] = &[
    ("Escape", KEY_ESC),
    ("Digit1", 2),
    ("Digit2", 3),
    ("Digit3", 4),
    ("Digit4", 5),
    ("Digit5", 6),
    ("Digit6", 7),
    ("Digit7", 8),
    ("Digit8", 9),
    ("Digit9", 10),
    ("Digit0", 11),
    ("Minus", 12),
    ("Equal", 13),
    ("Backspace", KEY_BACKSPACE),
    ("Tab", KEY_TAB),
    ("KeyQ", 16),
    ("KeyW", 17),
    ("KeyE", 18),
    ("KeyR", 19),
    ("KeyT", 20),
    ("KeyY", 21),
    ("KeyU", 22),
    ("KeyI", 23),
    ("KeyO", 24),
    ("KeyP", 25),
    ("BracketLeft", 26),
    ("BracketRight", 27),
    ("Enter", KEY_ENTER),
    ("ControlLeft", KEY_LEFTCTRL),
    ("KeyA", 30),
    ("KeyS", 31),
    ("KeyD", 32),
    ("KeyF", 33),
    ("KeyG", 34),
    ("KeyH", 35),
    ("KeyJ", 36),
    ("KeyK", 37),
    ("KeyL", 38),
    ("Semicolon", 39),
    ("Quote", 40),
    ("Backquote", 41),
    ("ShiftLeft", KEY_LEFTSHIFT),
    ("Backslash", 43),
    ("KeyZ", 44),
    ("KeyX", 45),
    ("KeyC", 46),
    ("KeyV", 47),
    ("KeyB", 48),
    ("KeyN", 49),
    ("KeyM", 50),
    ("Comma", 51),
    ("Period", 52),
    ("Slash", 53),
    ("ShiftRight", KEY_RIGHTSHIFT),
    ("NumpadMultiply", 55),
    ("AltLeft", KEY_LEFTALT),
    ("Space", KEY_SPACE),
    ("CapsLock", KEY_CAPSLOCK),
    ("F1", 59),
    ("F2", 60),
    ("F3", 61),
    ("F4", 62),
    ("F5", 63),
    ("F6", 64),
    ("F7", 65),
    ("F8", 66),
    ("F9", 67),
    ("F10", 68),
    ("NumLock", 69),
    ("ScrollLock", 70),
    ("Numpad7", 71),
    ("Numpad8", 72),
    ("Numpad9", 73),
    ("NumpadSubtract", 74),
    ("Numpad4", 75),
    ("Numpad5", 76),
    ("Numpad6", 77),
    ("NumpadAdd", 78),
    ("Numpad1", 79),
    ("Numpad2", 80),
    ("Numpad3", 81),
    ("Numpad0", 82),
    ("NumpadDecimal", 83),
    ("F11", 87),
    ("F12", 88),
    ("NumpadEnter", 96),
    ("ControlRight", KEY_RIGHTCTRL),
    ("NumpadDivide", 98),
    ("AltRight", KEY_RIGHTALT),
    ("Home", KEY_HOME),
    ("ArrowUp", KEY_UP),
    ("PageUp", KEY_PAGEUP),
    ("ArrowLeft", KEY_LEFT),
    ("ArrowRight", KEY_RIGHT),
    ("End", KEY_END),
    ("ArrowDown", KEY_DOWN),
    ("PageDown", KEY_PAGEDOWN),
    ("Insert", KEY_INSERT),
    ("Delete", KEY_DELETE),
    ("AudioVolumeMute", KEY_MUTE),
    ("AudioVolumeDown", KEY_VOLUMEDOWN),
    ("AudioVolumeUp", KEY_VOLUMEUP),
    ("Power", KEY_POWER),
    ("MetaLeft", KEY_LEFTMETA),
    ("MetaRight", KEY_RIGHTMETA),
    ("ContextMenu", KEY_MENU),
    ("BrowserBack", KEY_BACK),
    ("BrowserHome", KEY_HOMEPAGE),
    ("AppSwitch", KEY_APPSELECT),
];

/// Looks up the evdev code for a DOM key code name.
pub fn dom_key_to_linux(dom_key: &str) -> Option<u16> {
    DOM_KEYS
        .iter()
        .find(|(name, _)| *name == dom_key)
        .map(|&(_, code)| code)
}

/// DOM key translation with per-device overrides taking precedence over the built-in table.
#[derive(Clone, Debug, Default)]
pub struct KeyMapping {
    overrides: HashMap<String, u16>,
}

impl KeyMapping {
    pub fn new(overrides: HashMap<String, u16>) -> Self {
        KeyMapping { overrides }
    }

    pub fn translate(&self, dom_key: &str) -> Option<u16> {
        self.overrides
            .get(dom_key)
            .copied()
            .or_else(|| dom_key_to_linux(dom_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_keys() {
        assert_eq!(dom_key_to_linux("KeyA"), Some(30));
        assert_eq!(dom_key_to_linux("Digit0"), Some(11));
        assert_eq!(dom_key_to_linux("F12"), Some(88));
        assert_eq!(dom_key_to_linux("ShiftLeft"), Some(KEY_LEFTSHIFT));
        assert_eq!(dom_key_to_linux("keya"), None);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = DOM_KEYS.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DOM_KEYS.len());
    }

    #[test]
    fn overrides_win() {
        let mapping = KeyMapping::new(HashMap::from([("KeyA".to_string(), 200)]));
        assert_eq!(mapping.translate("KeyA"), Some(200));
        assert_eq!(mapping.translate("KeyB"), Some(48));
        assert_eq!(mapping.translate("Unidentified"), None);
    }
}
