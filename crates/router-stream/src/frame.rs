use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame type numbers as they appear on the router wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FrameType {
    Data = 0,
    Ping = 6,
    GoAway = 7,
}

impl FrameType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for FrameType {
    type Error = UnknownFrameType;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            6 => Ok(FrameType::Ping),
            7 => Ok(FrameType::GoAway),
            other => Err(UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown frame type {0}")]
pub struct UnknownFrameType(pub i32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    GoAway,
    Ping,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::GoAway => FrameType::GoAway,
            Frame::Ping => FrameType::Ping,
        }
    }
}

/// The shape a router call actually carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub frame_type: i32,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn new(frame_type: i32, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    pub fn data(payload: Bytes) -> Self {
        Frame::Data(payload).into()
    }

    pub fn goaway() -> Self {
        Frame::GoAway.into()
    }

    pub fn ping() -> Self {
        Frame::Ping.into()
    }

    /// One type byte followed by the payload. Used by message transports that
    /// carry exactly one frame per message.
    pub fn encode(&self) -> Result<Bytes, WireCodecError> {
        let kind = u8::try_from(self.frame_type)
            .map_err(|_| WireCodecError::TypeOutOfRange(self.frame_type))?;
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(kind);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut message: Bytes) -> Result<Self, WireCodecError> {
        if message.is_empty() {
            return Err(WireCodecError::Empty);
        }
        let kind = message.split_to(1)[0];
        Ok(Self {
            frame_type: i32::from(kind),
            payload: message,
        })
    }
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        let frame_type = frame.frame_type().as_i32();
        let payload = match frame {
            Frame::Data(bytes) => bytes,
            Frame::GoAway | Frame::Ping => Bytes::new(),
        };
        WireFrame {
            frame_type,
            payload,
        }
    }
}

impl TryFrom<WireFrame> for Frame {
    type Error = UnknownFrameType;

    fn try_from(wire: WireFrame) -> Result<Self, Self::Error> {
        Ok(match FrameType::try_from(wire.frame_type)? {
            FrameType::Data => Frame::Data(wire.payload),
            FrameType::GoAway => Frame::GoAway,
            FrameType::Ping => Frame::Ping,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireCodecError {
    #[error("empty frame message")]
    Empty,
    #[error("frame type {0} does not fit the wire encoding")]
    TypeOutOfRange(i32),
}
