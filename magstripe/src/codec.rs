//! Reply decoding
//!
//! Turns a transport result into either a decoded positive reply or a
//! signed integer code:
//!
//! | outcome                       | code                 |
//! |-------------------------------|----------------------|
//! | positive `('2','5')`          | `Ok`, status `+25`   |
//! | negative `('0','2')`          | `-2`                 |
//! | unavailable                   | `-9003`              |
//! | malformed reply payload       | `-9004`              |
//! | ACK timeout / NAK over limit  | `-9001` / `-9002`    |
//! | any other transport failure   | `-(n + 10000)`       |

use bytes::Bytes;
use magstripe_core::{constants::status, crypto::BLOCK_SIZE, Operation, Reply};
use magstripe_transport as transport;

/// Positive reply, checked against the operation it answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub operation: Operation,
    pub status: i32,
    pub payload: Bytes,
}

/// Decode `reply` as the answer to `operation`
pub fn decode(operation: Operation, reply: &Reply) -> Result<Decoded, i32> {
    let payload = match reply {
        Reply::Positive { payload, .. } => payload,
        Reply::Negative { .. } | Reply::Unavailable => return Err(reply.status_code()),
    };

    if reply.echo() != Some(operation.code()) {
        return Err(status::BAD_REPLY_PAYLOAD);
    }
    if let Some(expected) = operation.reply_len() {
        if payload.len() != expected {
            return Err(status::BAD_REPLY_PAYLOAD);
        }
    }
    if is_track_read(operation) && payload.len() % BLOCK_SIZE != 0 {
        return Err(status::BAD_REPLY_PAYLOAD);
    }

    Ok(Decoded {
        operation,
        status: reply.status_code(),
        payload: payload.clone(),
    })
}

/// Decode a full `execute` result
pub fn outcome(operation: Operation, result: &transport::Result<Reply>) -> Result<Decoded, i32> {
    match result {
        Ok(reply) => decode(operation, reply),
        Err(e) => Err(e.code()),
    }
}

/// Collapse an outcome to its integer form
pub fn status_code(outcome: &Result<Decoded, i32>) -> i32 {
    match outcome {
        Ok(decoded) => decoded.status,
        Err(code) => *code,
    }
}

fn is_track_read(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::ReadTrack1 | Operation::ReadTrack2 | Operation::ReadTrack3
    )
}
