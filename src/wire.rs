// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Wire protocol shared by peer links and the local service link.
//!
//! # Frame Format
//! ```text
//! [size: zigzag varint][type: u8][body: size - 1 bytes]
//! ```
//!
//! Bodies:
//! - RPC: `destLen:varint, dest, returnFlag:u8, methodId:varint, kind:u8,
//!   [senderLen:varint, sender, seqNo:varint unless fire-and-forget], args`
//! - RPCBatch: `count:varint, frames...`
//! - CountReplayableRPCBatch: `count:varint, replayable:varint, frames...`
//! - AttachTo: `nameLen:varint, name`
//! - ReplayFrom / Commit / TrimTo: `seq:i64 LE, replayableSeq:i64 LE`
//! - Checkpoint: `length:u64 LE`, then `length` raw bytes outside the frame

use crate::error::{AmbrosiaError, Result};
use ambrosia_persistence::varint;
use ambrosia_persistence::Watermark;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from a peer (checkpoint payloads excluded).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
/// Largest service state a Checkpoint frame may announce.
pub const MAX_CHECKPOINT_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Rpc = 0,
    AttachTo = 1,
    TakeCheckpoint = 2,
    Commit = 3,
    ReplayFrom = 4,
    RpcBatch = 5,
    Ping = 6,
    PingReturn = 7,
    Checkpoint = 8,
    InitialMessage = 9,
    UpgradeTakeCheckpoint = 10,
    TakeBecomingPrimaryCheckpoint = 11,
    UpgradeService = 12,
    CountReplayableRpcBatch = 13,
    TrimTo = 14,
    BecomingPrimary = 15,
}

impl TryFrom<u8> for MessageType {
    type Error = AmbrosiaError;

    fn try_from(byte: u8) -> Result<Self> {
        use MessageType::*;
        Ok(match byte {
            0 => Rpc,
            1 => AttachTo,
            2 => TakeCheckpoint,
            3 => Commit,
            4 => ReplayFrom,
            5 => RpcBatch,
            6 => Ping,
            7 => PingReturn,
            8 => Checkpoint,
            9 => InitialMessage,
            10 => UpgradeTakeCheckpoint,
            11 => TakeBecomingPrimaryCheckpoint,
            12 => UpgradeService,
            13 => CountReplayableRpcBatch,
            14 => TrimTo,
            15 => BecomingPrimary,
            other => return Err(AmbrosiaError::IllegalProtocolByte(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcKind {
    ReturnValue = 0,
    FireAndForget = 1,
    Impulse = 2,
}

impl RpcKind {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(RpcKind::ReturnValue),
            1 => Ok(RpcKind::FireAndForget),
            2 => Ok(RpcKind::Impulse),
            other => Err(AmbrosiaError::MalformedFrame(format!("unknown rpc kind {}", other))),
        }
    }

    /// Impulses occupy sequence space but not replayable sequence space.
    pub fn is_replayable(self) -> bool {
        self != RpcKind::Impulse
    }
}

/// Parsed head of an RPC body. `args` points into the original frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    pub dest: String,
    pub return_flag: u8,
    pub method_id: i32,
    pub kind: RpcKind,
    pub sender: Option<(String, i64)>,
    pub args: Bytes,
}

fn malformed(what: &str) -> AmbrosiaError {
    AmbrosiaError::MalformedFrame(what.to_string())
}

fn get_varint_i32(buf: &mut Bytes) -> Result<i32> {
    varint::read_zigzag_i32(buf).map_err(|e| malformed(&e.to_string()))
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_varint_i32(buf)?;
    let len = usize::try_from(len).map_err(|_| malformed("negative string length"))?;
    if buf.remaining() < len {
        return Err(malformed("string runs past frame"));
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| malformed("string is not utf-8"))
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(malformed("frame too short"));
    }
    Ok(buf.get_u8())
}

fn put_string(buf: &mut BytesMut, s: &str) {
    varint::write_zigzag_i32(buf, s.len() as i32);
    buf.put_slice(s.as_bytes());
}

/// Split a complete frame into its type and body.
pub fn frame_parts(frame: &Bytes) -> Result<(MessageType, Bytes)> {
    let (size, used) = varint::peek_zigzag_i32(frame)
        .map_err(|e| malformed(&e.to_string()))?
        .ok_or_else(|| malformed("truncated frame size"))?;
    let size = usize::try_from(size).map_err(|_| malformed("negative frame size"))?;
    if size == 0 || frame.len() < used + size {
        return Err(malformed("frame shorter than its size"));
    }
    let kind = MessageType::try_from(frame[used])?;
    Ok((kind, frame.slice(used + 1..used + size)))
}

impl RpcHeader {
    /// Parse the body of an RPC frame.
    pub fn parse(body: &Bytes) -> Result<Self> {
        let mut buf = body.clone();
        let dest = get_string(&mut buf)?;
        let return_flag = get_u8(&mut buf)?;
        let method_id = get_varint_i32(&mut buf)?;
        let kind = RpcKind::from_u8(get_u8(&mut buf)?)?;
        let sender = if kind != RpcKind::FireAndForget {
            let name = get_string(&mut buf)?;
            let seq = varint::read_zigzag_i64(&mut buf).map_err(|e| malformed(&e.to_string()))?;
            Some((name, seq))
        } else {
            None
        };
        Ok(Self {
            dest,
            return_flag,
            method_id,
            kind,
            sender,
            args: buf,
        })
    }

    /// Parse a whole RPC frame (size prefix included).
    pub fn from_frame(frame: &Bytes) -> Result<Self> {
        match frame_parts(frame)? {
            (MessageType::Rpc, body) => Self::parse(&body),
            (other, _) => Err(malformed(&format!("expected RPC frame, got {:?}", other))),
        }
    }
}

fn put_frame_head(dst: &mut BytesMut, kind: MessageType, body_len: usize) {
    varint::write_zigzag_i32(dst, (body_len + 1) as i32);
    dst.put_u8(kind as u8);
}

/// Encode a complete RPC frame.
pub fn encode_rpc(dest: &str, method_id: i32, kind: RpcKind, sender: Option<(&str, i64)>, args: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    put_string(&mut body, dest);
    body.put_u8(0);
    varint::write_zigzag_i32(&mut body, method_id);
    body.put_u8(kind as u8);
    if kind != RpcKind::FireAndForget {
        let (name, seq) = sender.unwrap_or(("", 0));
        put_string(&mut body, name);
        varint::write_zigzag_i64(&mut body, seq);
    }
    body.put_slice(args);

    let mut frame = BytesMut::with_capacity(body.len() + 6);
    put_frame_head(&mut frame, MessageType::Rpc, body.len());
    frame.put_slice(&body);
    frame.freeze()
}

/// Header of a batch frame wrapping `count` already-framed messages whose
/// concatenation is `frames_len` bytes. `replayable` selects the counted form.
pub fn put_batch_head(dst: &mut BytesMut, count: usize, replayable: Option<usize>, frames_len: usize) {
    let mut counts = BytesMut::with_capacity(10);
    varint::write_zigzag_i32(&mut counts, count as i32);
    let kind = match replayable {
        Some(r) => {
            varint::write_zigzag_i32(&mut counts, r as i32);
            MessageType::CountReplayableRpcBatch
        }
        None => MessageType::RpcBatch,
    };
    put_frame_head(dst, kind, counts.len() + frames_len);
    dst.put_slice(&counts);
}

/// Inner frames of a batch body (counts already stripped or not, see `kind`).
pub fn split_batch(kind: MessageType, body: &Bytes) -> Result<Vec<Bytes>> {
    let mut buf = body.clone();
    let count = get_varint_i32(&mut buf)?;
    if kind == MessageType::CountReplayableRpcBatch {
        get_varint_i32(&mut buf)?;
    }
    let count = usize::try_from(count).map_err(|_| malformed("negative batch count"))?;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let (size, used) = varint::peek_zigzag_i32(&buf)
            .map_err(|e| malformed(&e.to_string()))?
            .ok_or_else(|| malformed("truncated inner frame"))?;
        let total = used + usize::try_from(size).map_err(|_| malformed("negative frame size"))?;
        if buf.len() < total {
            return Err(malformed("inner frame runs past batch"));
        }
        frames.push(buf.split_to(total));
    }
    Ok(frames)
}

/// RPC frames carried by `frame`: itself for an RPC, the members of a batch.
pub fn rpc_frames(frame: &Bytes) -> Result<Vec<Bytes>> {
    let (kind, body) = frame_parts(frame)?;
    match kind {
        MessageType::Rpc => Ok(vec![frame.clone()]),
        MessageType::RpcBatch | MessageType::CountReplayableRpcBatch => split_batch(kind, &body),
        other => Err(malformed(&format!("{:?} does not carry calls", other))),
    }
}

/// Top-level frames laid end to end in a log payload.
pub fn split_frames(payload: &Bytes) -> Result<Vec<Bytes>> {
    let mut buf = payload.clone();
    let mut frames = Vec::new();
    while !buf.is_empty() {
        let (size, used) = varint::peek_zigzag_i32(&buf)
            .map_err(|e| malformed(&e.to_string()))?
            .ok_or_else(|| malformed("truncated frame size"))?;
        let total = used + usize::try_from(size).map_err(|_| malformed("negative frame size"))?;
        if buf.len() < total {
            return Err(malformed("frame runs past payload"));
        }
        frames.push(buf.split_to(total));
    }
    Ok(frames)
}

/// Count `(messages, replayable messages)` in an RPC or batch frame.
pub fn count_calls(frame: &Bytes) -> Result<(i64, i64)> {
    let mut total = 0;
    let mut replayable = 0;
    for rpc in rpc_frames(frame)? {
        let header = RpcHeader::from_frame(&rpc)?;
        total += 1;
        if header.kind.is_replayable() {
            replayable += 1;
        }
    }
    Ok((total, replayable))
}

/// Decoded frame. Call-carrying frames keep their exact bytes because they
/// are logged and forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Rpc(Bytes),
    Batch(Bytes),
    AttachTo(String),
    TakeCheckpoint,
    Commit(Watermark),
    ReplayFrom(Watermark),
    TrimTo(Watermark),
    Ping(Bytes),
    PingReturn(Bytes),
    Checkpoint(Bytes),
    InitialMessage(Bytes),
    UpgradeTakeCheckpoint,
    TakeBecomingPrimaryCheckpoint,
    UpgradeService,
    BecomingPrimary,
}

fn get_watermark(body: &Bytes) -> Result<Watermark> {
    if body.len() < 16 {
        return Err(malformed("watermark body too short"));
    }
    let mut buf = body.clone();
    Ok(Watermark::new(buf.get_i64_le(), buf.get_i64_le()))
}

#[derive(Debug, Default)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AmbrosiaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((size, used)) = varint::peek_zigzag_i32(src).map_err(|e| malformed(&e.to_string()))? else {
            return Ok(None);
        };
        let size = usize::try_from(size).map_err(|_| malformed("negative frame size"))?;
        let limit = if self.max_frame_size == 0 { MAX_FRAME_SIZE } else { self.max_frame_size };
        if size == 0 || size > limit {
            return Err(malformed(&format!("frame size {} out of range", size)));
        }
        if src.len() < used + size {
            src.reserve(used + size - src.len());
            return Ok(None);
        }
        let kind = MessageType::try_from(src[used])?;

        if kind == MessageType::Checkpoint {
            if size < 9 {
                return Err(malformed("checkpoint frame too short"));
            }
            let len = (&src[used + 1..used + 9]).get_u64_le();
            if len > MAX_CHECKPOINT_SIZE {
                return Err(malformed(&format!("checkpoint of {} bytes out of range", len)));
            }
            let len = len as usize;
            let total = used + size + len;
            if src.len() < total {
                src.reserve((total - src.len()).min(limit));
                return Ok(None);
            }
            src.advance(used + size);
            return Ok(Some(Frame::Checkpoint(src.split_to(len).freeze())));
        }

        let frame = src.split_to(used + size).freeze();
        let body = frame.slice(used + 1..);
        Ok(Some(match kind {
            MessageType::Rpc => Frame::Rpc(frame),
            MessageType::RpcBatch | MessageType::CountReplayableRpcBatch => Frame::Batch(frame),
            MessageType::AttachTo => {
                let mut buf = body;
                Frame::AttachTo(get_string(&mut buf)?)
            }
            MessageType::TakeCheckpoint => Frame::TakeCheckpoint,
            MessageType::Commit => Frame::Commit(get_watermark(&body)?),
            MessageType::ReplayFrom => Frame::ReplayFrom(get_watermark(&body)?),
            MessageType::TrimTo => Frame::TrimTo(get_watermark(&body)?),
            MessageType::Ping => Frame::Ping(body),
            MessageType::PingReturn => Frame::PingReturn(body),
            MessageType::InitialMessage => Frame::InitialMessage(body),
            MessageType::UpgradeTakeCheckpoint => Frame::UpgradeTakeCheckpoint,
            MessageType::TakeBecomingPrimaryCheckpoint => Frame::TakeBecomingPrimaryCheckpoint,
            MessageType::UpgradeService => Frame::UpgradeService,
            MessageType::BecomingPrimary => Frame::BecomingPrimary,
            MessageType::Checkpoint => unreachable!("handled above"),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AmbrosiaError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        match item {
            Frame::Rpc(raw) | Frame::Batch(raw) => dst.put_slice(&raw),
            Frame::AttachTo(name) => {
                let mut body = BytesMut::new();
                put_string(&mut body, &name);
                put_frame_head(dst, MessageType::AttachTo, body.len());
                dst.put_slice(&body);
            }
            Frame::Commit(wm) => put_watermark(dst, MessageType::Commit, wm),
            Frame::ReplayFrom(wm) => put_watermark(dst, MessageType::ReplayFrom, wm),
            Frame::TrimTo(wm) => put_watermark(dst, MessageType::TrimTo, wm),
            Frame::Ping(body) => put_raw(dst, MessageType::Ping, &body),
            Frame::PingReturn(body) => put_raw(dst, MessageType::PingReturn, &body),
            Frame::InitialMessage(body) => put_raw(dst, MessageType::InitialMessage, &body),
            Frame::Checkpoint(data) => {
                put_frame_head(dst, MessageType::Checkpoint, 8);
                dst.put_u64_le(data.len() as u64);
                dst.put_slice(&data);
            }
            Frame::TakeCheckpoint => put_raw(dst, MessageType::TakeCheckpoint, &[]),
            Frame::UpgradeTakeCheckpoint => put_raw(dst, MessageType::UpgradeTakeCheckpoint, &[]),
            Frame::TakeBecomingPrimaryCheckpoint => put_raw(dst, MessageType::TakeBecomingPrimaryCheckpoint, &[]),
            Frame::UpgradeService => put_raw(dst, MessageType::UpgradeService, &[]),
            Frame::BecomingPrimary => put_raw(dst, MessageType::BecomingPrimary, &[]),
        }
        Ok(())
    }
}

fn put_watermark(dst: &mut BytesMut, kind: MessageType, wm: Watermark) {
    put_frame_head(dst, kind, 16);
    dst.put_i64_le(wm.seq);
    dst.put_i64_le(wm.replayable_seq);
}

fn put_raw(dst: &mut BytesMut, kind: MessageType, body: &[u8]) {
    put_frame_head(dst, kind, body.len());
    dst.put_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_byte_maps() {
        for b in 0u8..=15 {
            assert_eq!(MessageType::try_from(b).unwrap() as u8, b);
        }
        assert!(matches!(
            MessageType::try_from(16),
            Err(AmbrosiaError::IllegalProtocolByte(16))
        ));
    }

    #[test]
    fn test_rpc_header_layout() {
        let frame = encode_rpc("bank", 7, RpcKind::ReturnValue, Some(("teller", 42)), b"args");
        // size varint, then the RPC type byte.
        assert_eq!(frame[1], MessageType::Rpc as u8);
        let header = RpcHeader::from_frame(&frame).unwrap();
        assert_eq!(header.dest, "bank");
        assert_eq!(header.method_id, 7);
        assert_eq!(header.kind, RpcKind::ReturnValue);
        assert_eq!(header.sender, Some(("teller".to_string(), 42)));
        assert_eq!(&header.args[..], b"args");

        let fire = encode_rpc("bank", 1, RpcKind::FireAndForget, None, b"x");
        assert_eq!(RpcHeader::from_frame(&fire).unwrap().sender, None);
    }

    #[test]
    fn test_codec_splits_stream() {
        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        let rpc = encode_rpc("a", 1, RpcKind::Impulse, Some(("b", 0)), b"hello");
        codec.encode(Frame::AttachTo("peer".into()), &mut wire).unwrap();
        codec.encode(Frame::Rpc(rpc.clone()), &mut wire).unwrap();
        codec.encode(Frame::Commit(Watermark::new(9, 8)), &mut wire).unwrap();
        codec.encode(Frame::Checkpoint(Bytes::from_static(b"state")), &mut wire).unwrap();

        // Feed one byte at a time: the decoder must wait for whole frames.
        let mut input = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            input.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut input).unwrap() {
                out.push(frame);
            }
        }
        assert_eq!(
            out,
            vec![
                Frame::AttachTo("peer".into()),
                Frame::Rpc(rpc),
                Frame::Commit(Watermark::new(9, 8)),
                Frame::Checkpoint(Bytes::from_static(b"state")),
            ]
        );
    }

    #[test]
    fn test_batch_counts() {
        let a = encode_rpc("d", 1, RpcKind::FireAndForget, None, b"1");
        let b = encode_rpc("d", 1, RpcKind::Impulse, Some(("s", 3)), b"2");
        let mut frame = BytesMut::new();
        put_batch_head(&mut frame, 2, Some(1), a.len() + b.len());
        frame.put_slice(&a);
        frame.put_slice(&b);
        let frame = frame.freeze();

        assert_eq!(frame_parts(&frame).unwrap().0, MessageType::CountReplayableRpcBatch);
        assert_eq!(rpc_frames(&frame).unwrap(), vec![a, b]);
        assert_eq!(count_calls(&frame).unwrap(), (2, 1));
    }

    #[test]
    fn test_illegal_byte_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut input = BytesMut::from(&[0x02u8, 0x63][..]);
        assert!(matches!(
            codec.decode(&mut input),
            Err(AmbrosiaError::IllegalProtocolByte(0x63))
        ));
    }

    #[test]
    fn test_oversized_checkpoint_announcement_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut input = BytesMut::new();
        varint::write_zigzag_i32(&mut input, 9);
        input.put_u8(MessageType::Checkpoint as u8);
        input.put_u64_le(u64::MAX);
        assert!(matches!(codec.decode(&mut input), Err(AmbrosiaError::MalformedFrame(_))));

        // A large but legal announcement waits for the bytes without
        // reserving all of them up front.
        let mut input = BytesMut::new();
        varint::write_zigzag_i32(&mut input, 9);
        input.put_u8(MessageType::Checkpoint as u8);
        input.put_u64_le(MAX_CHECKPOINT_SIZE);
        assert!(codec.decode(&mut input).unwrap().is_none());
        assert!(input.capacity() < MAX_CHECKPOINT_SIZE as usize);
    }
}
