/*!
 # Wire protocol definitions

 Fixed bytes of the Triones command protocol. Every command is written as a
 single frame to one GATT characteristic; there is no sub-framing.

 | Command       | Bytes                   |
 |---------------|-------------------------|
 | Power on      | `CC 23 33`              |
 | Power off     | `CC 24 33`              |
 | Set color     | `56 R G B 19 F0 AA`     |
 | Set white     | `56 00 00 00 I 0F AA`   |
 | Built-in mode | `BB M S 44`             |
*/

use uuid::Uuid;

/// Control characteristic every command is written to
pub const CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffd9_0000_1000_8000_00805f9b34fb);

/// Leading tag of the power frame
pub const POWER_TAG: u8 = 0xCC;
/// Power frame argument for "on"
pub const POWER_ON: u8 = 0x23;
/// Power frame argument for "off"
pub const POWER_OFF: u8 = 0x24;
/// Trailing byte of the power frame
pub const POWER_END: u8 = 0x33;

/// Leading tag shared by the color and white frames
pub const LIGHT_TAG: u8 = 0x56;
/// Brightness byte baked into every color frame.
///
/// Fixed 10% scale of 255, kept exactly as the controllers expect it.
pub const COLOR_BRIGHTNESS: u8 = ((10 * 255 / 100) & 0xFF) as u8;
/// Marks a light frame as RGB
pub const COLOR_MARKER: u8 = 0xF0;
/// Marks a light frame as white
pub const WHITE_MARKER: u8 = 0x0F;
/// Trailing byte of the color and white frames
pub const LIGHT_END: u8 = 0xAA;

/// Leading tag of the built-in mode frame
pub const MODE_TAG: u8 = 0xBB;
/// Trailing byte of the built-in mode frame
pub const MODE_END: u8 = 0x44;

/// Lowest built-in mode code
pub const MODE_MIN: u8 = 37;
/// Highest built-in mode code
pub const MODE_MAX: u8 = 56;
/// Fastest accepted mode speed
pub const SPEED_MIN: u8 = 1;
/// Slowest accepted mode speed
pub const SPEED_MAX: u8 = 255;

/// Length of a power frame
pub const POWER_FRAME_LEN: usize = 3;
/// Length of a color or white frame
pub const LIGHT_FRAME_LEN: usize = 7;
/// Length of a built-in mode frame
pub const MODE_FRAME_LEN: usize = 4;
