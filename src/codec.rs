/*!
 # Command codec

 Pure translation of typed commands into wire frames. Nothing in here touches
 a device, so every frame can be checked without hardware.
*/

use std::fmt;

use crate::protocol::*;
use crate::ProtocolError;

/// Clamps an untyped channel value into `0..=255`
pub fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

/// Clamps an untyped speed value into `SPEED_MIN..=SPEED_MAX`
pub fn clamp_speed(value: i64) -> u8 {
    value.clamp(i64::from(SPEED_MIN), i64::from(SPEED_MAX)) as u8
}

/// An encoded frame, ready to be written to the control characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandPayload(Box<[u8]>);

impl CommandPayload {
    fn new(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    /// Raw frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; frames are never empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for CommandPayload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Turn the strip on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerCommand(pub bool);

/// Static RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorCommand {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl ColorCommand {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Builds a color from untyped input, clamping every channel into `0..=255`
    pub fn from_unclamped(red: i64, green: i64, blue: i64) -> Self {
        Self {
            red: clamp_channel(red),
            green: clamp_channel(green),
            blue: clamp_channel(blue),
        }
    }
}

/// White channel at the given intensity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhiteCommand {
    pub intensity: u8,
}

impl WhiteCommand {
    pub fn new(intensity: u8) -> Self {
        Self { intensity }
    }

    /// Builds a white command from untyped input, clamping into `0..=255`
    pub fn from_unclamped(intensity: i64) -> Self {
        Self {
            intensity: clamp_channel(intensity),
        }
    }
}

/// One of the firmware animations, already validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltInModeCommand {
    mode: u8,
    speed: u8,
}

impl BuiltInModeCommand {
    /// Validates the mode code and clamps the speed.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidMode` when `mode` is outside `37..=56`.
    pub fn new(mode: i64, speed: i64) -> Result<Self, ProtocolError> {
        if !(i64::from(MODE_MIN)..=i64::from(MODE_MAX)).contains(&mode) {
            return Err(ProtocolError::InvalidMode(mode));
        }
        Ok(Self {
            mode: mode as u8,
            speed: clamp_speed(speed),
        })
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }
}

/// Any command the controller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Power(PowerCommand),
    Color(ColorCommand),
    White(WhiteCommand),
    BuiltInMode(BuiltInModeCommand),
}

impl Command {
    /// Encodes the command into its wire frame
    pub fn encode(&self) -> CommandPayload {
        match *self {
            Command::Power(PowerCommand(on)) => encode_power(on),
            Command::Color(c) => encode_color(c.red, c.green, c.blue),
            Command::White(w) => encode_white(w.intensity),
            Command::BuiltInMode(m) => encode_mode_frame(m),
        }
    }
}

impl From<PowerCommand> for Command {
    fn from(value: PowerCommand) -> Self {
        Command::Power(value)
    }
}

impl From<ColorCommand> for Command {
    fn from(value: ColorCommand) -> Self {
        Command::Color(value)
    }
}

impl From<WhiteCommand> for Command {
    fn from(value: WhiteCommand) -> Self {
        Command::White(value)
    }
}

impl From<BuiltInModeCommand> for Command {
    fn from(value: BuiltInModeCommand) -> Self {
        Command::BuiltInMode(value)
    }
}

/// Encodes a power frame: `CC 23 33` for on, `CC 24 33` for off
pub fn encode_power(on: bool) -> CommandPayload {
    let state = if on { POWER_ON } else { POWER_OFF };
    CommandPayload::new(&[POWER_TAG, state, POWER_END])
}

/// Encodes a color frame: `56 R G B 19 F0 AA`
pub fn encode_color(red: u8, green: u8, blue: u8) -> CommandPayload {
    CommandPayload::new(&[
        LIGHT_TAG,
        red,
        green,
        blue,
        COLOR_BRIGHTNESS,
        COLOR_MARKER,
        LIGHT_END,
    ])
}

/// Encodes a white frame: `56 00 00 00 I 0F AA`
pub fn encode_white(intensity: u8) -> CommandPayload {
    CommandPayload::new(&[
        LIGHT_TAG,
        0x00,
        0x00,
        0x00,
        intensity,
        WHITE_MARKER,
        LIGHT_END,
    ])
}

/// Encodes a built-in mode frame: `BB M S 44`.
///
/// The speed is clamped into `1..=255`.
///
/// # Errors
///
/// Returns `ProtocolError::InvalidMode` when `mode` is outside `37..=56`.
pub fn encode_builtin_mode(mode: i64, speed: i64) -> Result<CommandPayload, ProtocolError> {
    BuiltInModeCommand::new(mode, speed).map(encode_mode_frame)
}

fn encode_mode_frame(command: BuiltInModeCommand) -> CommandPayload {
    CommandPayload::new(&[MODE_TAG, command.mode, command.speed, MODE_END])
}
