/*!
 # Built-in animation modes

 Named firmware animations. Codes run from 37 (0x25) to 56 (0x38); the
 controller plays them on its own once selected.
*/

use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Firmware animation selectable with a built-in mode command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltInMode {
    /// Crossfade through red, green, blue, yellow, cyan, magenta, white
    SevenColorCrossFade,
    /// Red gradual fade
    RedGradual,
    /// Green gradual fade
    GreenGradual,
    /// Blue gradual fade
    BlueGradual,
    /// Yellow gradual fade
    YellowGradual,
    /// Cyan gradual fade
    CyanGradual,
    /// Purple gradual fade
    PurpleGradual,
    /// White gradual fade
    WhiteGradual,
    /// Red and green crossfade
    RedGreenCrossFade,
    /// Red and blue crossfade
    RedBlueCrossFade,
    /// Green and blue crossfade
    GreenBlueCrossFade,
    /// Strobe through all seven colors
    SevenColorStrobe,
    /// Red strobe
    RedStrobe,
    /// Green strobe
    GreenStrobe,
    /// Blue strobe
    BlueStrobe,
    /// Yellow strobe
    YellowStrobe,
    /// Cyan strobe
    CyanStrobe,
    /// Purple strobe
    PurpleStrobe,
    /// White strobe
    WhiteStrobe,
    /// Jump through all seven colors
    SevenColorJumping,
}

impl BuiltInMode {
    /// Every mode, ordered by code
    pub const ALL: [BuiltInMode; 20] = [
        BuiltInMode::SevenColorCrossFade,
        BuiltInMode::RedGradual,
        BuiltInMode::GreenGradual,
        BuiltInMode::BlueGradual,
        BuiltInMode::YellowGradual,
        BuiltInMode::CyanGradual,
        BuiltInMode::PurpleGradual,
        BuiltInMode::WhiteGradual,
        BuiltInMode::RedGreenCrossFade,
        BuiltInMode::RedBlueCrossFade,
        BuiltInMode::GreenBlueCrossFade,
        BuiltInMode::SevenColorStrobe,
        BuiltInMode::RedStrobe,
        BuiltInMode::GreenStrobe,
        BuiltInMode::BlueStrobe,
        BuiltInMode::YellowStrobe,
        BuiltInMode::CyanStrobe,
        BuiltInMode::PurpleStrobe,
        BuiltInMode::WhiteStrobe,
        BuiltInMode::SevenColorJumping,
    ];

    /// Wire code of the mode
    pub fn code(self) -> u8 {
        0x25 + self as u8
    }

    /// Kebab-case name, as accepted by [`FromStr`]
    pub fn name(self) -> &'static str {
        match self {
            BuiltInMode::SevenColorCrossFade => "seven-color-cross-fade",
            BuiltInMode::RedGradual => "red-gradual",
            BuiltInMode::GreenGradual => "green-gradual",
            BuiltInMode::BlueGradual => "blue-gradual",
            BuiltInMode::YellowGradual => "yellow-gradual",
            BuiltInMode::CyanGradual => "cyan-gradual",
            BuiltInMode::PurpleGradual => "purple-gradual",
            BuiltInMode::WhiteGradual => "white-gradual",
            BuiltInMode::RedGreenCrossFade => "red-green-cross-fade",
            BuiltInMode::RedBlueCrossFade => "red-blue-cross-fade",
            BuiltInMode::GreenBlueCrossFade => "green-blue-cross-fade",
            BuiltInMode::SevenColorStrobe => "seven-color-strobe",
            BuiltInMode::RedStrobe => "red-strobe",
            BuiltInMode::GreenStrobe => "green-strobe",
            BuiltInMode::BlueStrobe => "blue-strobe",
            BuiltInMode::YellowStrobe => "yellow-strobe",
            BuiltInMode::CyanStrobe => "cyan-strobe",
            BuiltInMode::PurpleStrobe => "purple-strobe",
            BuiltInMode::WhiteStrobe => "white-strobe",
            BuiltInMode::SevenColorJumping => "seven-color-jumping",
        }
    }
}

impl TryFrom<i64> for BuiltInMode {
    type Error = ProtocolError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        BuiltInMode::ALL
            .into_iter()
            .find(|m| i64::from(m.code()) == code)
            .ok_or(ProtocolError::InvalidMode(code))
    }
}

impl From<BuiltInMode> for i64 {
    fn from(mode: BuiltInMode) -> Self {
        i64::from(mode.code())
    }
}

impl fmt::Display for BuiltInMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts a mode name (`red-strobe`, `red_strobe`) or its numeric code
impl FromStr for BuiltInMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i64>() {
            return BuiltInMode::try_from(code);
        }
        let wanted = s.to_lowercase().replace('_', "-");
        BuiltInMode::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| ProtocolError::UnknownModeName(s.to_string()))
    }
}
