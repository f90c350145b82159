//! Framing Layer
//!
//! This module provides the AMQP 1.0 framing layer used by the protocol
//! object: the frame header, incremental frame extraction from a byte stream,
//! the protocol header constants, and the performatives exchanged over a
//! connection (Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End,
//! Close).
//!
//! # Overview
//!
//! Frames arrive as a byte stream with no alignment guarantees; partial
//! frames must never desynchronize the decoder. [`Frame::split`] therefore
//! consumes bytes only when a complete frame is buffered and leaves the input
//! untouched otherwise.

use crate::codec::{Decoder, Encoder, Value};
use crate::condition::Condition;
use crate::error::{AmqpError, AmqpResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol constants
pub mod constants {
    /// AMQP 1.0 protocol header
    pub const AMQP_HEADER: &[u8] = &[0x41, 0x4D, 0x51, 0x50, 0x00, 0x01, 0x00, 0x00];

    /// Length of the protocol header
    pub const HEADER_SIZE: usize = 8;

    /// Length of a frame header
    pub const FRAME_HEADER_SIZE: usize = 8;

    /// Standard AMQP 1.0 data offset (in 4-byte words)
    pub const DATA_OFFSET: u8 = 2;

    /// Frame type for AMQP frames
    pub const FRAME_TYPE_AMQP: u8 = 0x00;
}

/// Performative descriptor codes
mod descriptor {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const ATTACH: u64 = 0x12;
    pub const FLOW: u64 = 0x13;
    pub const TRANSFER: u64 = 0x14;
    pub const DISPOSITION: u64 = 0x15;
    pub const DETACH: u64 = 0x16;
    pub const END: u64 = 0x17;
    pub const CLOSE: u64 = 0x18;
    pub const ERROR: u64 = 0x1d;
    pub const ACCEPTED: u64 = 0x24;
    pub const SOURCE: u64 = 0x28;
    pub const TARGET: u64 = 0x29;
}

/// Link endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// The complementary role of the peer endpoint
    pub fn peer(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    fn to_bool(self) -> bool {
        // On the wire: false = sender, true = receiver.
        matches!(self, Role::Receiver)
    }

    fn from_bool(value: bool) -> Role {
        if value {
            Role::Receiver
        } else {
            Role::Sender
        }
    }
}

/// A performative carried in the body of an AMQP frame
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open {
        container_id: String,
        hostname: Option<String>,
        max_frame_size: u32,
        channel_max: u16,
        idle_timeout: Option<u32>,
    },
    Begin {
        remote_channel: Option<u16>,
        next_outgoing_id: u32,
        incoming_window: u32,
        outgoing_window: u32,
    },
    Attach {
        name: String,
        handle: u32,
        role: Role,
        source: Option<String>,
        target: Option<String>,
    },
    Flow {
        next_incoming_id: Option<u32>,
        incoming_window: u32,
        next_outgoing_id: u32,
        outgoing_window: u32,
        handle: Option<u32>,
        delivery_count: Option<u32>,
        link_credit: Option<u32>,
    },
    Transfer {
        handle: u32,
        delivery_id: Option<u32>,
        delivery_tag: Bytes,
        settled: bool,
    },
    Disposition {
        role: Role,
        first: u32,
        last: Option<u32>,
        settled: bool,
        accepted: bool,
    },
    Detach {
        handle: u32,
        closed: bool,
        error: Option<Condition>,
    },
    End {
        error: Option<Condition>,
    },
    Close {
        error: Option<Condition>,
    },
}

/// An AMQP 1.0 frame: channel, optional performative, opaque payload
///
/// A frame with no body is a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub body: Option<Performative>,
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame carrying a performative without payload
    pub fn new(channel: u16, body: Performative) -> Self {
        Frame {
            channel,
            body: Some(body),
            payload: Bytes::new(),
        }
    }

    /// Create a frame carrying a performative and a payload
    pub fn with_payload(channel: u16, body: Performative, payload: Bytes) -> Self {
        Frame {
            channel,
            body: Some(body),
            payload,
        }
    }

    /// Encode the frame, appending it to `out`
    pub fn encode(&self, out: &mut BytesMut) -> AmqpResult<()> {
        let body = match &self.body {
            Some(performative) => encode_performative(performative)?,
            None => Vec::new(),
        };
        let size = constants::FRAME_HEADER_SIZE + body.len() + self.payload.len();
        out.reserve(size);
        out.put_u32(size as u32);
        out.put_u8(constants::DATA_OFFSET);
        out.put_u8(constants::FRAME_TYPE_AMQP);
        out.put_u16(self.channel);
        out.put_slice(&body);
        out.put_slice(&self.payload);
        Ok(())
    }

    /// Extract the next complete frame from `input`, if one is buffered
    ///
    /// Consumes nothing when the buffered bytes do not yet form a complete
    /// frame. `max_frame_size` bounds the accepted frame size.
    pub fn split(input: &mut BytesMut, max_frame_size: u32) -> AmqpResult<Option<Frame>> {
        if input.len() < constants::FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
        if size < constants::FRAME_HEADER_SIZE {
            return Err(AmqpError::decoding(format!("frame size {} below minimum", size)));
        }
        if size > max_frame_size as usize {
            return Err(AmqpError::decoding(format!(
                "frame size {} exceeds maximum {}",
                size, max_frame_size
            )));
        }
        if input.len() < size {
            return Ok(None);
        }

        let mut frame = input.split_to(size);
        frame.advance(4);
        let data_offset = frame.get_u8();
        let frame_type = frame.get_u8();
        let channel = frame.get_u16();

        if frame_type != constants::FRAME_TYPE_AMQP {
            return Err(AmqpError::decoding(format!(
                "unsupported frame type 0x{:02x}",
                frame_type
            )));
        }
        let body_start = (data_offset as usize) * 4;
        if body_start < constants::FRAME_HEADER_SIZE || body_start > size {
            return Err(AmqpError::decoding(format!("invalid data offset {}", data_offset)));
        }
        // Skip extended header bytes, if any.
        frame.advance(body_start - constants::FRAME_HEADER_SIZE);

        if frame.is_empty() {
            // Heartbeat frame.
            return Ok(Some(Frame {
                channel,
                body: None,
                payload: Bytes::new(),
            }));
        }

        let mut decoder = Decoder::new(frame.freeze());
        let body = decode_performative(&mut decoder)?;
        let payload = decoder.take_remaining();

        Ok(Some(Frame {
            channel,
            body: Some(body),
            payload,
        }))
    }
}

fn encode_performative(performative: &Performative) -> AmqpResult<Vec<u8>> {
    let (code, fields) = match performative {
        Performative::Open {
            container_id,
            hostname,
            max_frame_size,
            channel_max,
            idle_timeout,
        } => (
            descriptor::OPEN,
            vec![
                Value::String(container_id.clone()),
                opt_string(hostname),
                Value::Uint(*max_frame_size),
                Value::Ushort(*channel_max),
                match idle_timeout {
                    Some(ms) => Value::Uint(*ms),
                    None => Value::Null,
                },
            ],
        ),
        Performative::Begin {
            remote_channel,
            next_outgoing_id,
            incoming_window,
            outgoing_window,
        } => (
            descriptor::BEGIN,
            vec![
                match remote_channel {
                    Some(ch) => Value::Ushort(*ch),
                    None => Value::Null,
                },
                Value::Uint(*next_outgoing_id),
                Value::Uint(*incoming_window),
                Value::Uint(*outgoing_window),
            ],
        ),
        Performative::Attach {
            name,
            handle,
            role,
            source,
            target,
        } => (
            descriptor::ATTACH,
            vec![
                Value::String(name.clone()),
                Value::Uint(*handle),
                Value::Boolean(role.to_bool()),
                Value::Null, // snd-settle-mode
                Value::Null, // rcv-settle-mode
                terminus(descriptor::SOURCE, source),
                terminus(descriptor::TARGET, target),
            ],
        ),
        Performative::Flow {
            next_incoming_id,
            incoming_window,
            next_outgoing_id,
            outgoing_window,
            handle,
            delivery_count,
            link_credit,
        } => (
            descriptor::FLOW,
            vec![
                opt_uint(next_incoming_id),
                Value::Uint(*incoming_window),
                Value::Uint(*next_outgoing_id),
                Value::Uint(*outgoing_window),
                opt_uint(handle),
                opt_uint(delivery_count),
                opt_uint(link_credit),
            ],
        ),
        Performative::Transfer {
            handle,
            delivery_id,
            delivery_tag,
            settled,
        } => (
            descriptor::TRANSFER,
            vec![
                Value::Uint(*handle),
                opt_uint(delivery_id),
                Value::Binary(delivery_tag.clone()),
                Value::Uint(0), // message-format
                Value::Boolean(*settled),
            ],
        ),
        Performative::Disposition {
            role,
            first,
            last,
            settled,
            accepted,
        } => (
            descriptor::DISPOSITION,
            vec![
                Value::Boolean(role.to_bool()),
                Value::Uint(*first),
                opt_uint(last),
                Value::Boolean(*settled),
                if *accepted {
                    Value::Described(descriptor::ACCEPTED, Box::new(Value::List(Vec::new())))
                } else {
                    Value::Null
                },
            ],
        ),
        Performative::Detach {
            handle,
            closed,
            error,
        } => (
            descriptor::DETACH,
            vec![
                Value::Uint(*handle),
                Value::Boolean(*closed),
                encode_error(error),
            ],
        ),
        Performative::End { error } => (descriptor::END, vec![encode_error(error)]),
        Performative::Close { error } => (descriptor::CLOSE, vec![encode_error(error)]),
    };

    let mut encoder = Encoder::new();
    encoder.encode_described(code, &Value::List(fields))?;
    Ok(encoder.finish())
}

fn decode_performative(decoder: &mut Decoder) -> AmqpResult<Performative> {
    let (code, fields) = match decoder.decode_value()? {
        Value::Described(code, body) => match *body {
            Value::List(fields) => (code, fields),
            other => {
                return Err(AmqpError::decoding(format!(
                    "performative body is not a list: {:?}",
                    other
                )))
            }
        },
        other => {
            return Err(AmqpError::decoding(format!(
                "frame body is not a described value: {:?}",
                other
            )))
        }
    };

    let performative = match code {
        descriptor::OPEN => Performative::Open {
            container_id: req_string(&fields, 0, "open.container-id")?,
            hostname: get_string(&fields, 1),
            max_frame_size: get_u32(&fields, 2).unwrap_or(u32::MAX),
            channel_max: get_u16(&fields, 3).unwrap_or(u16::MAX),
            idle_timeout: get_u32(&fields, 4),
        },
        descriptor::BEGIN => Performative::Begin {
            remote_channel: get_u16(&fields, 0),
            next_outgoing_id: get_u32(&fields, 1).unwrap_or(0),
            incoming_window: get_u32(&fields, 2).unwrap_or(0),
            outgoing_window: get_u32(&fields, 3).unwrap_or(0),
        },
        descriptor::ATTACH => Performative::Attach {
            name: req_string(&fields, 0, "attach.name")?,
            handle: req_u32(&fields, 1, "attach.handle")?,
            role: Role::from_bool(get_bool(&fields, 2).unwrap_or(false)),
            source: decode_terminus(&fields, 5),
            target: decode_terminus(&fields, 6),
        },
        descriptor::FLOW => Performative::Flow {
            next_incoming_id: get_u32(&fields, 0),
            incoming_window: get_u32(&fields, 1).unwrap_or(0),
            next_outgoing_id: get_u32(&fields, 2).unwrap_or(0),
            outgoing_window: get_u32(&fields, 3).unwrap_or(0),
            handle: get_u32(&fields, 4),
            delivery_count: get_u32(&fields, 5),
            link_credit: get_u32(&fields, 6),
        },
        descriptor::TRANSFER => Performative::Transfer {
            handle: req_u32(&fields, 0, "transfer.handle")?,
            delivery_id: get_u32(&fields, 1),
            delivery_tag: fields
                .get(2)
                .and_then(|v| v.as_bytes())
                .cloned()
                .unwrap_or_default(),
            settled: get_bool(&fields, 4).unwrap_or(false),
        },
        descriptor::DISPOSITION => Performative::Disposition {
            role: Role::from_bool(get_bool(&fields, 0).unwrap_or(false)),
            first: req_u32(&fields, 1, "disposition.first")?,
            last: get_u32(&fields, 2),
            settled: get_bool(&fields, 3).unwrap_or(false),
            accepted: matches!(
                fields.get(4),
                Some(Value::Described(code, _)) if *code == descriptor::ACCEPTED
            ),
        },
        descriptor::DETACH => Performative::Detach {
            handle: req_u32(&fields, 0, "detach.handle")?,
            closed: get_bool(&fields, 1).unwrap_or(false),
            error: decode_error(&fields, 2),
        },
        descriptor::END => Performative::End {
            error: decode_error(&fields, 0),
        },
        descriptor::CLOSE => Performative::Close {
            error: decode_error(&fields, 0),
        },
        other => {
            return Err(AmqpError::decoding(format!(
                "unknown performative descriptor 0x{:02x}",
                other
            )))
        }
    };
    Ok(performative)
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn opt_uint(value: &Option<u32>) -> Value {
    match value {
        Some(v) => Value::Uint(*v),
        None => Value::Null,
    }
}

fn terminus(code: u64, address: &Option<String>) -> Value {
    Value::Described(code, Box::new(Value::List(vec![opt_string(address)])))
}

fn decode_terminus(fields: &[Value], index: usize) -> Option<String> {
    match fields.get(index) {
        Some(Value::Described(_, body)) => body
            .as_list()
            .and_then(|items| items.first())
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn encode_error(error: &Option<Condition>) -> Value {
    match error {
        Some(condition) if condition.is_set() => Value::Described(
            descriptor::ERROR,
            Box::new(Value::List(vec![
                Value::Symbol(condition.name().unwrap_or_default().to_string()),
                Value::String(condition.description().unwrap_or_default().to_string()),
            ])),
        ),
        _ => Value::Null,
    }
}

fn decode_error(fields: &[Value], index: usize) -> Option<Condition> {
    match fields.get(index) {
        Some(Value::Described(code, body)) if *code == descriptor::ERROR => {
            let items = body.as_list()?;
            let name = items.first().and_then(|v| v.as_str())?;
            let description = items.get(1).and_then(|v| v.as_str()).unwrap_or_default();
            Some(Condition::of(name, description))
        }
        _ => None,
    }
}

fn get_string(fields: &[Value], index: usize) -> Option<String> {
    fields
        .get(index)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn req_string(fields: &[Value], index: usize, what: &str) -> AmqpResult<String> {
    get_string(fields, index).ok_or_else(|| AmqpError::decoding(format!("missing {}", what)))
}

fn get_u32(fields: &[Value], index: usize) -> Option<u32> {
    fields.get(index).and_then(|v| v.as_u32())
}

fn req_u32(fields: &[Value], index: usize, what: &str) -> AmqpResult<u32> {
    get_u32(fields, index).ok_or_else(|| AmqpError::decoding(format!("missing {}", what)))
}

fn get_u16(fields: &[Value], index: usize) -> Option<u16> {
    fields.get(index).and_then(|v| v.as_u16())
}

fn get_bool(fields: &[Value], index: usize) -> Option<bool> {
    fields.get(index).and_then(|v| v.as_bool())
}
