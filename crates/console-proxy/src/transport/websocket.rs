//! WebSocket message adapter.
//!
//! The relay only cares about payload bytes, control traffic and close. axum's
//! server-side socket is reduced to that view; tests drive the same pump over
//! raw tokio-tungstenite streams.

use axum::extract::ws::Message as AxumMessage;
#[cfg(test)]
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// Sub-protocol the noVNC client requests.
pub const WS_PROTOCOL: &str = "binary";

/// What the relay sees of an inbound WebSocket message.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Payload bytes to forward upstream. Text frames carry their UTF-8 bytes.
    Data(Vec<u8>),
    /// Ping/pong and raw frames; the socket handles these itself.
    Control,
    /// Peer sent a close frame.
    Close,
}

/// A WebSocket message type the relay can forward.
pub trait WsFrame: Sized {
    /// Wrap tunnel bytes in a binary message.
    fn binary(data: Vec<u8>) -> Self;

    fn classify(self) -> Frame;
}

impl WsFrame for AxumMessage {
    fn binary(data: Vec<u8>) -> Self {
        AxumMessage::Binary(data)
    }

    fn classify(self) -> Frame {
        match self {
            AxumMessage::Binary(data) => Frame::Data(data),
            AxumMessage::Text(text) => Frame::Data(text.into_bytes()),
            AxumMessage::Ping(_) | AxumMessage::Pong(_) => Frame::Control,
            AxumMessage::Close(_) => Frame::Close,
        }
    }
}

#[cfg(test)]
impl WsFrame for TungsteniteMessage {
    fn binary(data: Vec<u8>) -> Self {
        TungsteniteMessage::Binary(data)
    }

    fn classify(self) -> Frame {
        match self {
            TungsteniteMessage::Binary(data) => Frame::Data(data),
            TungsteniteMessage::Text(text) => Frame::Data(text.into_bytes()),
            TungsteniteMessage::Ping(_)
            | TungsteniteMessage::Pong(_)
            | TungsteniteMessage::Frame(_) => Frame::Control,
            TungsteniteMessage::Close(_) => Frame::Close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_binary_are_data() {
        assert_eq!(
            AxumMessage::Text("hi".into()).classify(),
            Frame::Data(b"hi".to_vec())
        );
        assert_eq!(
            TungsteniteMessage::Binary(vec![1, 2]).classify(),
            Frame::Data(vec![1, 2])
        );
    }

    #[test]
    fn control_and_close() {
        assert_eq!(AxumMessage::Ping(vec![]).classify(), Frame::Control);
        assert_eq!(TungsteniteMessage::Pong(vec![]).classify(), Frame::Control);
        assert_eq!(AxumMessage::Close(None).classify(), Frame::Close);
        assert_eq!(TungsteniteMessage::Close(None).classify(), Frame::Close);
    }

    #[test]
    fn binary_wraps_bytes() {
        assert!(matches!(
            <AxumMessage as WsFrame>::binary(vec![7]),
            AxumMessage::Binary(b) if b == vec![7]
        ));
    }
}
