use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const MIN_ROOM_ID_LEN: usize = 5;
pub const MAX_ROOM_ID_LEN: usize = 15;

/// Room identifier accepted from user input. Length is counted in characters,
/// not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("room id should contain {MIN_ROOM_ID_LEN}-{MAX_ROOM_ID_LEN} characters (got {len})")]
pub struct RoomIdError {
    pub len: usize,
}

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        let len = raw.chars().count();
        if (MIN_ROOM_ID_LEN..=MAX_ROOM_ID_LEN).contains(&len) {
            Ok(Self(raw.to_string()))
        } else {
            Err(RoomIdError { len })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
