// y-sync frame codec for peer traffic.
//
// Every frame is one or more v1-encoded `yrs::sync::Message`s back to back.

use yrs::encoding::read::Cursor;
use yrs::sync::{AwarenessUpdate, Message, MessageReader, SyncMessage};
use yrs::updates::decoder::DecoderV1;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::error::SessionError;

pub fn sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

pub fn sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

pub fn update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

pub fn awareness_query() -> Vec<u8> {
    Message::AwarenessQuery.encode_v1()
}

/// Decode every message in a frame. Fails on the first malformed one.
pub fn decode_frame(payload: &[u8]) -> Result<Vec<Message>, SessionError> {
    let mut decoder = DecoderV1::new(Cursor::new(payload));
    let reader = MessageReader::new(&mut decoder);
    let mut messages = Vec::new();
    for next in reader {
        let message = next.map_err(|e| SessionError::Protocol(e.to_string()))?;
        messages.push(message);
    }
    if messages.is_empty() {
        return Err(SessionError::Protocol("empty frame".into()));
    }
    Ok(messages)
}
