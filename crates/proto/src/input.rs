use bytes::{BufMut, BytesMut};

use crate::packet::control;

/// Zoom region-of-interest request: a normalized rectangle on the host
/// screen plus the requested magnification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

/// Client-side device telemetry forwarded to the host encoder heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub battery: f32,
    pub charging: bool,
    pub thermal_state: u8,
    pub low_power: bool,
    pub fps: f64,
}

/// One upstream input event.
///
/// Every event serializes as `type:u8 | timestamp:u64` followed by its
/// fields, all big-endian; floats travel as their big-endian bit patterns.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    /// normalized pointer position.
    MouseMove { x: f32, y: f32 },
    MouseDown { button: u8 },
    MouseUp { button: u8 },
    Scroll { dx: f32, dy: f32 },
    KeyDown { keycode: u16 },
    KeyUp { keycode: u16 },
    ZoomRequest { active: bool, region: ZoomRegion },
    Telemetry(Telemetry),
    Registration { listen_port: u16, user_id: String },
}

impl InputEvent {
    /// the on-wire event type byte.
    pub fn code(&self) -> u8 {
        match self {
            Self::MouseMove { .. } => 0x10,
            Self::MouseDown { .. } => 0x11,
            Self::MouseUp { .. } => 0x12,
            Self::Scroll { .. } => 0x13,
            Self::KeyDown { .. } => 0x20,
            Self::KeyUp { .. } => 0x21,
            Self::ZoomRequest { .. } => 0x30,
            Self::Telemetry(_) => 0x40,
            Self::Registration { .. } => control::REGISTRATION,
        }
    }

    /// whether this event class is subject to the minimum-interval
    /// throttle. Zoom requests are throttled too, but an active-state
    /// transition overrides the throttle at the sender.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            Self::MouseMove { .. } | Self::Scroll { .. } | Self::ZoomRequest { .. }
        )
    }

    /// serialize the event with the given timestamp.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use visor_proto::input::InputEvent;
    ///
    /// let mut bytes = BytesMut::new();
    /// InputEvent::KeyDown { keycode: 0x002A }.encode(2, &mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[0x20, 0, 0, 0, 0, 0, 0, 0, 2, 0x00, 0x2A]
    /// );
    /// ```
    pub fn encode(&self, timestamp: u64, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u8(self.code());

        // registration keeps its legacy layout without a timestamp so the
        // host parses it identically on every socket it appears on.
        if let Self::Registration {
            listen_port,
            user_id,
        } = self
        {
            bytes.put_u16(*listen_port);
            bytes.put(user_id.as_bytes());
            return;
        }

        bytes.put_u64(timestamp);

        match self {
            Self::MouseMove { x, y } => {
                bytes.put_f32(*x);
                bytes.put_f32(*y);
            }
            Self::MouseDown { button } | Self::MouseUp { button } => {
                bytes.put_u8(*button);
            }
            Self::Scroll { dx, dy } => {
                bytes.put_f32(*dx);
                bytes.put_f32(*dy);
            }
            Self::KeyDown { keycode } | Self::KeyUp { keycode } => {
                bytes.put_u16(*keycode);
            }
            Self::ZoomRequest { active, region } => {
                bytes.put_u8(*active as u8);
                bytes.put_f32(region.x);
                bytes.put_f32(region.y);
                bytes.put_f32(region.width);
                bytes.put_f32(region.height);
                bytes.put_f32(region.scale);
            }
            Self::Telemetry(telemetry) => {
                bytes.put_f32(telemetry.battery);
                bytes.put_u8(telemetry.charging as u8);
                bytes.put_u8(telemetry.thermal_state);
                bytes.put_u8(telemetry.low_power as u8);
                bytes.put_f64(telemetry.fps);
            }
            Self::Registration { .. } => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_move_layout() {
        let mut bytes = BytesMut::new();
        InputEvent::MouseMove { x: 0.5, y: 0.25 }.encode(1_000, &mut bytes);

        assert_eq!(bytes.len(), 1 + 8 + 4 + 4);
        assert_eq!(bytes[0], 0x10);
        assert_eq!(&bytes[1..9], &1_000u64.to_be_bytes());
        assert_eq!(&bytes[9..13], &0.5f32.to_be_bytes());
        assert_eq!(&bytes[13..17], &0.25f32.to_be_bytes());
    }

    #[test]
    fn zoom_request_layout() {
        let mut bytes = BytesMut::new();
        InputEvent::ZoomRequest {
            active: true,
            region: ZoomRegion {
                x: 0.1,
                y: 0.2,
                width: 0.3,
                height: 0.4,
                scale: 2.0,
            },
        }
        .encode(7, &mut bytes);

        assert_eq!(bytes.len(), 1 + 8 + 1 + 5 * 4);
        assert_eq!(bytes[0], 0x30);
        assert_eq!(bytes[9], 0x01);
        assert_eq!(&bytes[10..14], &0.1f32.to_be_bytes());
        assert_eq!(&bytes[26..30], &2.0f32.to_be_bytes());
    }

    #[test]
    fn telemetry_layout() {
        let mut bytes = BytesMut::new();
        InputEvent::Telemetry(Telemetry {
            battery: 0.8,
            charging: false,
            thermal_state: 2,
            low_power: true,
            fps: 59.94,
        })
        .encode(9, &mut bytes);

        assert_eq!(bytes.len(), 1 + 8 + 4 + 3 + 8);
        assert_eq!(bytes[0], 0x40);
        assert_eq!(&bytes[9..13], &0.8f32.to_be_bytes());
        assert_eq!(bytes[13], 0x00);
        assert_eq!(bytes[14], 0x02);
        assert_eq!(bytes[15], 0x01);
        assert_eq!(&bytes[16..24], &59.94f64.to_be_bytes());
    }

    #[test]
    fn registration_has_no_timestamp() {
        let mut bytes = BytesMut::new();
        InputEvent::Registration {
            listen_port: 5001,
            user_id: "alice".into(),
        }
        .encode(123, &mut bytes);

        assert_eq!(&bytes[..3], &[0xFE, 0x13, 0x89]);
        assert_eq!(&bytes[3..], b"alice");
    }

    #[test]
    fn throttle_classes() {
        assert!(InputEvent::MouseMove { x: 0.0, y: 0.0 }.is_throttled());
        assert!(InputEvent::Scroll { dx: 1.0, dy: 0.0 }.is_throttled());
        assert!(!InputEvent::MouseDown { button: 0 }.is_throttled());
        assert!(!InputEvent::KeyUp { keycode: 13 }.is_throttled());
    }
}
