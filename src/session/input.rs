//! Controller input translation
//!
//! Platform pad state (button bitmap, unsigned 8-bit sticks centred on 128)
//! is remapped to the remote play layout and 16-bit signed sticks, then
//! packed big-endian for the transport.

use bytes::BufMut;

use crate::config::{ButtonMapping, Settings};

/// Platform pad button bits
pub mod pad {
    pub const SELECT: u32 = 0x0000_0001;
    pub const L3: u32 = 0x0000_0002;
    pub const R3: u32 = 0x0000_0004;
    pub const START: u32 = 0x0000_0008;
    pub const UP: u32 = 0x0000_0010;
    pub const RIGHT: u32 = 0x0000_0020;
    pub const DOWN: u32 = 0x0000_0040;
    pub const LEFT: u32 = 0x0000_0080;
    pub const LTRIGGER: u32 = 0x0000_0100;
    pub const RTRIGGER: u32 = 0x0000_0200;
    pub const L1: u32 = 0x0000_0400;
    pub const R1: u32 = 0x0000_0800;
    pub const TRIANGLE: u32 = 0x0000_1000;
    pub const CIRCLE: u32 = 0x0000_2000;
    pub const CROSS: u32 = 0x0000_4000;
    pub const SQUARE: u32 = 0x0000_8000;
    pub const PS: u32 = 0x0001_0000;
}

/// Remote play button bits
pub mod button {
    pub const CROSS: u32 = 0x0001;
    pub const CIRCLE: u32 = 0x0002;
    pub const SQUARE: u32 = 0x0004;
    pub const TRIANGLE: u32 = 0x0008;
    pub const DPAD_LEFT: u32 = 0x0010;
    pub const DPAD_RIGHT: u32 = 0x0020;
    pub const DPAD_UP: u32 = 0x0040;
    pub const DPAD_DOWN: u32 = 0x0080;
    pub const L1: u32 = 0x0100;
    pub const R1: u32 = 0x0200;
    pub const L3: u32 = 0x0400;
    pub const R3: u32 = 0x0800;
    pub const OPTIONS: u32 = 0x1000;
    pub const SHARE: u32 = 0x2000;
    pub const TOUCHPAD: u32 = 0x4000;
    pub const PS: u32 = 0x8000;
}

/// Encoded size of [`ControllerInput`]
pub const INPUT_PACKET_SIZE: usize = 14;

const STICK_CENTER: i32 = 128;

const BUTTON_MAP: &[(u32, u32)] = &[
    (pad::CROSS, button::CROSS),
    (pad::CIRCLE, button::CIRCLE),
    (pad::SQUARE, button::SQUARE),
    (pad::TRIANGLE, button::TRIANGLE),
    (pad::LEFT, button::DPAD_LEFT),
    (pad::RIGHT, button::DPAD_RIGHT),
    (pad::UP, button::DPAD_UP),
    (pad::DOWN, button::DPAD_DOWN),
    (pad::LTRIGGER, button::L1),
    (pad::L1, button::L1),
    (pad::RTRIGGER, button::R1),
    (pad::R1, button::R1),
    (pad::L3, button::L3),
    (pad::R3, button::R3),
    (pad::START, button::OPTIONS),
    (pad::SELECT, button::SHARE),
    (pad::PS, button::PS),
];

/// Raw pad sample from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadState {
    pub buttons: u32,
    pub lx: u8,
    pub ly: u8,
    pub rx: u8,
    pub ry: u8,
    pub touchpad: bool,
}

impl Default for PadState {
    fn default() -> Self {
        Self {
            buttons: 0,
            lx: STICK_CENTER as u8,
            ly: STICK_CENTER as u8,
            rx: STICK_CENTER as u8,
            ry: STICK_CENTER as u8,
            touchpad: false,
        }
    }
}

/// Stick shaping and button layout
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputMapping {
    /// Percent of stick travel ignored around centre, 0..=50
    pub deadzone: f32,
    /// Percent output gain, 50..=150
    pub sensitivity: f32,
    pub buttons: ButtonMapping,
}

impl InputMapping {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            deadzone: settings.deadzone,
            sensitivity: settings.sensitivity,
            buttons: settings.button_mapping,
        }
    }

    /// 8-bit unsigned axis to 16-bit signed, centred on zero
    pub fn scale_axis(&self, raw: u8) -> i16 {
        let offset = raw as i32 - STICK_CENTER;
        let normalized = (offset as f32 / 127.0).clamp(-1.0, 1.0);
        let deadzone = (self.deadzone / 100.0).clamp(0.0, 0.5);
        let magnitude = normalized.abs();
        if magnitude <= deadzone {
            return 0;
        }
        let shaped = (magnitude - deadzone) / (1.0 - deadzone) * (self.sensitivity / 100.0);
        let value = shaped.min(1.0) * normalized.signum() * i16::MAX as f32;
        value.round() as i16
    }

    pub fn map_buttons(&self, pad_buttons: u32, touchpad: bool) -> u32 {
        let mut mapped = BUTTON_MAP
            .iter()
            .filter(|(from, _)| pad_buttons & from != 0)
            .fold(0, |acc, (_, to)| acc | to);
        if touchpad {
            mapped |= button::TOUCHPAD;
        }
        if self.buttons == ButtonMapping::SwapConfirm {
            let cross = mapped & button::CROSS != 0;
            let circle = mapped & button::CIRCLE != 0;
            mapped &= !(button::CROSS | button::CIRCLE);
            if cross {
                mapped |= button::CIRCLE;
            }
            if circle {
                mapped |= button::CROSS;
            }
        }
        mapped
    }
}

impl Default for InputMapping {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// One controller report in remote play layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerInput {
    pub buttons: u32,
    pub left_x: i16,
    pub left_y: i16,
    pub right_x: i16,
    pub right_y: i16,
    pub l2: u8,
    pub r2: u8,
}

impl ControllerInput {
    pub fn from_pad(pad: &PadState, mapping: &InputMapping) -> Self {
        Self {
            buttons: mapping.map_buttons(pad.buttons, pad.touchpad),
            left_x: mapping.scale_axis(pad.lx),
            left_y: mapping.scale_axis(pad.ly),
            right_x: mapping.scale_axis(pad.rx),
            right_y: mapping.scale_axis(pad.ry),
            l2: 0,
            r2: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INPUT_PACKET_SIZE);
        buf.put_u32(self.buttons);
        buf.put_i16(self.left_x);
        buf.put_i16(self.left_y);
        buf.put_i16(self.right_x);
        buf.put_i16(self.right_y);
        buf.put_u8(self.l2);
        buf.put_u8(self.r2);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> InputMapping {
        InputMapping {
            deadzone: 0.0,
            sensitivity: 100.0,
            buttons: ButtonMapping::Default,
        }
    }

    #[test]
    fn test_axis_center_and_extremes() {
        let mapping = linear();
        assert_eq!(mapping.scale_axis(128), 0);
        assert_eq!(mapping.scale_axis(255), i16::MAX);
        assert_eq!(mapping.scale_axis(0), -i16::MAX);
        assert!(mapping.scale_axis(192) > 0);
        assert!(mapping.scale_axis(64) < 0);
    }

    #[test]
    fn test_axis_deadzone() {
        let mapping = InputMapping {
            deadzone: 15.0,
            ..linear()
        };
        // 10 / 127 is inside a 15% deadzone
        assert_eq!(mapping.scale_axis(138), 0);
        assert_eq!(mapping.scale_axis(118), 0);
        assert_eq!(mapping.scale_axis(255), i16::MAX);
    }

    #[test]
    fn test_axis_sensitivity_saturates() {
        let mapping = InputMapping {
            sensitivity: 150.0,
            ..linear()
        };
        assert_eq!(mapping.scale_axis(255), i16::MAX);
        let half = linear().scale_axis(192);
        assert!(mapping.scale_axis(192) > half);
    }

    #[test]
    fn test_button_remap() {
        let mapping = linear();
        let mapped = mapping.map_buttons(pad::CROSS | pad::START | pad::LTRIGGER, true);
        assert_eq!(mapped, button::CROSS | button::OPTIONS | button::L1 | button::TOUCHPAD);
    }

    #[test]
    fn test_swap_confirm() {
        let mapping = InputMapping {
            buttons: ButtonMapping::SwapConfirm,
            ..linear()
        };
        assert_eq!(mapping.map_buttons(pad::CROSS, false), button::CIRCLE);
        assert_eq!(mapping.map_buttons(pad::CIRCLE, false), button::CROSS);
        assert_eq!(
            mapping.map_buttons(pad::CROSS | pad::CIRCLE, false),
            button::CROSS | button::CIRCLE
        );
    }

    #[test]
    fn test_encode_layout() {
        let input = ControllerInput {
            buttons: button::PS,
            left_x: -1,
            left_y: 2,
            right_x: 0,
            right_y: i16::MAX,
            l2: 0xAA,
            r2: 0x55,
        };
        let bytes = input.encode();
        assert_eq!(bytes.len(), INPUT_PACKET_SIZE);
        assert_eq!(&bytes[..4], &[0, 0, 0x80, 0]);
        assert_eq!(&bytes[4..6], &[0xFF, 0xFF]);
        assert_eq!(&bytes[6..8], &[0, 2]);
        assert_eq!(&bytes[10..12], &[0x7F, 0xFF]);
        assert_eq!(&bytes[12..], &[0xAA, 0x55]);
    }

    #[test]
    fn test_idle_pad_is_neutral() {
        let input = ControllerInput::from_pad(&PadState::default(), &InputMapping::default());
        assert_eq!(input, ControllerInput::default());
    }
}
