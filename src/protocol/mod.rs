//! Wire protocol between the engine, launchers, and function workers
//!
//! Every IPC message is a fixed-size frame: a fixed-width header followed by
//! up to [`INLINE_MAX`] bytes of inline payload. The frame size is chosen so
//! that a complete message fits in one `PIPE_BUF`-atomic write, which is what
//! lets multiple workers share a FIFO without interleaving.
//!
//! ## Wire format (little-endian)
//!
//! ```text
//! message_type:    u16
//! flags:           u16      // bit 0: use FIFO for nested call output
//! func_id:         u16
//! client_id:       u16
//! call_id:         u32
//! parent_call_id:  u64      // 0 for external calls
//! payload_size:    i32      // negative => |size| bytes in shm; else inline
//! processing_time: i32      // microseconds, set on completion
//! dispatch_delay:  i32      // microseconds
//! send_timestamp:  i64      // monotonic microseconds at send
//! inline_data:     [u8; INLINE_MAX]
//! ```
//!
//! The sign of `payload_size` is the only wire signal for the shm-vs-inline
//! transport decision.

use bytes::{Buf, BufMut};

use crate::error::{LumenError, Result};

/// Atomic pipe write size on Linux
pub const PIPE_BUF_SIZE: usize = 4096;

/// Total size of a serialized message frame
pub const MESSAGE_SIZE: usize = 1024;

/// Size of the fixed-width header
pub const HEADER_SIZE: usize = 40;

/// Maximum inline payload carried within a message frame
pub const INLINE_MAX: usize = MESSAGE_SIZE - HEADER_SIZE;

const _: () = assert!(MESSAGE_SIZE <= PIPE_BUF_SIZE);

/// Flag bit: nested-call output is returned through a dedicated FIFO
pub const FLAG_USE_FIFO_FOR_NESTED_CALL: u16 = 1;

/// Message types on the engine IPC socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Invalid = 0,
    LauncherHandshake = 1,
    FuncWorkerHandshake = 2,
    HandshakeResponse = 3,
    CreateFuncWorker = 4,
    InvokeFunc = 5,
    DispatchFuncCall = 6,
    FuncCallComplete = 7,
    FuncCallFailed = 8,
    SharedLogOp = 9,
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        match value {
            1 => MessageType::LauncherHandshake,
            2 => MessageType::FuncWorkerHandshake,
            3 => MessageType::HandshakeResponse,
            4 => MessageType::CreateFuncWorker,
            5 => MessageType::InvokeFunc,
            6 => MessageType::DispatchFuncCall,
            7 => MessageType::FuncCallComplete,
            8 => MessageType::FuncCallFailed,
            9 => MessageType::SharedLogOp,
            _ => MessageType::Invalid,
        }
    }
}

/// Identity of a function call, globally unique over its lifetime
///
/// The 64-bit `full_call_id` packs (func_id:16 | client_id:16 | call_id:32).
/// `client_id == 0` marks an external call, bookkept by the engine; internal
/// calls belong to the worker that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncCall {
    pub func_id: u16,
    pub client_id: u16,
    pub call_id: u32,
}

impl FuncCall {
    /// The all-zero call, used as the parent of external calls
    pub const INVALID: FuncCall = FuncCall {
        func_id: 0,
        client_id: 0,
        call_id: 0,
    };

    pub fn new(func_id: u16, client_id: u16, call_id: u32) -> Self {
        Self {
            func_id,
            client_id,
            call_id,
        }
    }

    pub fn full_call_id(&self) -> u64 {
        (u64::from(self.func_id) << 48) | (u64::from(self.client_id) << 32) | u64::from(self.call_id)
    }

    pub fn from_full_call_id(full_call_id: u64) -> Self {
        Self {
            func_id: (full_call_id >> 48) as u16,
            client_id: (full_call_id >> 32) as u16,
            call_id: full_call_id as u32,
        }
    }

    /// External calls originate at the gateway, not at a worker
    pub fn is_external(&self) -> bool {
        self.client_id == 0
    }
}

impl std::fmt::Display for FuncCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FuncCall(func={}, client={}, call={})",
            self.func_id, self.client_id, self.call_id
        )
    }
}

/// A fixed-size IPC message frame
///
/// Messages are stack-lived at the endpoints and serialized verbatim on the
/// wire. Only the first `|payload_size|` bytes of `inline_data` are valid,
/// and only when `payload_size >= 0`.
#[derive(Clone, Copy)]
pub struct Message {
    pub message_type: u16,
    pub flags: u16,
    pub func_id: u16,
    pub client_id: u16,
    pub call_id: u32,
    pub parent_call_id: u64,
    pub payload_size: i32,
    pub processing_time: i32,
    pub dispatch_delay: i32,
    pub send_timestamp: i64,
    pub inline_data: [u8; INLINE_MAX],
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_type", &MessageType::from(self.message_type))
            .field("flags", &self.flags)
            .field("func_call", &self.func_call())
            .field("parent_call_id", &self.parent_call_id)
            .field("payload_size", &self.payload_size)
            .finish_non_exhaustive()
    }
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type: message_type as u16,
            flags: 0,
            func_id: 0,
            client_id: 0,
            call_id: 0,
            parent_call_id: 0,
            payload_size: 0,
            processing_time: 0,
            dispatch_delay: 0,
            send_timestamp: 0,
            inline_data: [0u8; INLINE_MAX],
        }
    }

    pub fn new_launcher_handshake(func_id: u16) -> Self {
        let mut msg = Self::empty(MessageType::LauncherHandshake);
        msg.func_id = func_id;
        msg
    }

    pub fn new_func_worker_handshake(func_id: u16, client_id: u16) -> Self {
        let mut msg = Self::empty(MessageType::FuncWorkerHandshake);
        msg.func_id = func_id;
        msg.client_id = client_id;
        msg
    }

    pub fn new_handshake_response(payload_size: u32) -> Self {
        let mut msg = Self::empty(MessageType::HandshakeResponse);
        msg.payload_size = payload_size as i32;
        msg
    }

    pub fn new_create_func_worker(client_id: u16) -> Self {
        let mut msg = Self::empty(MessageType::CreateFuncWorker);
        msg.client_id = client_id;
        msg
    }

    pub fn new_invoke_func(func_call: FuncCall, parent_call_id: u64) -> Self {
        let mut msg = Self::empty(MessageType::InvokeFunc);
        msg.set_func_call(func_call);
        msg.parent_call_id = parent_call_id;
        msg
    }

    pub fn new_dispatch_func_call(func_call: FuncCall, parent_call_id: u64) -> Self {
        let mut msg = Self::empty(MessageType::DispatchFuncCall);
        msg.set_func_call(func_call);
        msg.parent_call_id = parent_call_id;
        msg
    }

    pub fn new_func_call_complete(func_call: FuncCall, processing_time: i32) -> Self {
        let mut msg = Self::empty(MessageType::FuncCallComplete);
        msg.set_func_call(func_call);
        msg.processing_time = processing_time;
        msg
    }

    pub fn new_func_call_failed(func_call: FuncCall) -> Self {
        let mut msg = Self::empty(MessageType::FuncCallFailed);
        msg.set_func_call(func_call);
        msg
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from(self.message_type)
    }

    pub fn func_call(&self) -> FuncCall {
        FuncCall::new(self.func_id, self.client_id, self.call_id)
    }

    pub fn set_func_call(&mut self, func_call: FuncCall) {
        self.func_id = func_call.func_id;
        self.client_id = func_call.client_id;
        self.call_id = func_call.call_id;
    }

    pub fn is_launcher_handshake(&self) -> bool {
        self.message_type() == MessageType::LauncherHandshake
    }

    pub fn is_func_worker_handshake(&self) -> bool {
        self.message_type() == MessageType::FuncWorkerHandshake
    }

    pub fn is_invoke_func(&self) -> bool {
        self.message_type() == MessageType::InvokeFunc
    }

    pub fn is_func_call_complete(&self) -> bool {
        self.message_type() == MessageType::FuncCallComplete
    }

    pub fn is_func_call_failed(&self) -> bool {
        self.message_type() == MessageType::FuncCallFailed
    }

    /// The valid prefix of the inline payload, empty when the payload lives
    /// in shared memory
    pub fn inline_data(&self) -> &[u8] {
        if self.payload_size <= 0 {
            return &[];
        }
        let size = (self.payload_size as usize).min(INLINE_MAX);
        &self.inline_data[..size]
    }

    /// Store an inline payload. Panics if `data` exceeds [`INLINE_MAX`];
    /// callers decide the shm-vs-inline route before this point.
    pub fn set_inline_data(&mut self, data: &[u8]) {
        assert!(data.len() <= INLINE_MAX, "inline payload too large");
        self.payload_size = data.len() as i32;
        self.inline_data[..data.len()].copy_from_slice(data);
    }

    /// Record that the payload of `size` bytes is carried in a shm region.
    /// Encoded as a negated size, the only wire signal for the route.
    pub fn set_shm_payload(&mut self, size: usize) {
        self.payload_size = -(size as i32);
    }

    pub fn payload_in_shm(&self) -> bool {
        self.payload_size < 0
    }

    /// Stamp the send timestamp; done immediately before the write
    pub fn fill_send_timestamp(&mut self) {
        self.send_timestamp = monotonic_micros();
    }

    /// Serialize to a fixed-size frame
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut frame = [0u8; MESSAGE_SIZE];
        let mut buf = &mut frame[..];
        buf.put_u16_le(self.message_type);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.func_id);
        buf.put_u16_le(self.client_id);
        buf.put_u32_le(self.call_id);
        buf.put_u64_le(self.parent_call_id);
        buf.put_i32_le(self.payload_size);
        buf.put_i32_le(self.processing_time);
        buf.put_i32_le(self.dispatch_delay);
        buf.put_i64_le(self.send_timestamp);
        buf.put_slice(&self.inline_data);
        frame
    }

    /// Deserialize from a fixed-size frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() != MESSAGE_SIZE {
            return Err(LumenError::Protocol(format!(
                "bad frame size: have {}, expected {}",
                frame.len(),
                MESSAGE_SIZE
            )));
        }
        let mut buf = frame;
        let mut msg = Self::empty(MessageType::Invalid);
        msg.message_type = buf.get_u16_le();
        msg.flags = buf.get_u16_le();
        msg.func_id = buf.get_u16_le();
        msg.client_id = buf.get_u16_le();
        msg.call_id = buf.get_u32_le();
        msg.parent_call_id = buf.get_u64_le();
        msg.payload_size = buf.get_i32_le();
        msg.processing_time = buf.get_i32_le();
        msg.dispatch_delay = buf.get_i32_le();
        msg.send_timestamp = buf.get_i64_le();
        msg.inline_data.copy_from_slice(&buf[..INLINE_MAX]);
        Ok(msg)
    }
}

/// Monotonic clock reading in microseconds
pub fn monotonic_micros() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime on CLOCK_MONOTONIC cannot fail with a valid timespec
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000
}

/// Microseconds elapsed since the message was sent, or -1 when the sender
/// did not stamp it
pub fn compute_message_delay(message: &Message) -> i32 {
    if message.send_timestamp <= 0 {
        return -1;
    }
    let delay = monotonic_micros() - message.send_timestamp;
    if delay >= 0 && delay <= i64::from(i32::MAX) {
        delay as i32
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_call_id_roundtrip() {
        let call = FuncCall::new(0x1234, 0x5678, 0x9abc_def0);
        let unpacked = FuncCall::from_full_call_id(call.full_call_id());
        assert_eq!(call, unpacked);
        assert_eq!(call.full_call_id(), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn test_external_call_detection() {
        assert!(FuncCall::new(1, 0, 7).is_external());
        assert!(!FuncCall::new(1, 3, 7).is_external());
    }

    #[test]
    fn test_message_encode_decode_roundtrip() {
        let mut msg = Message::new_invoke_func(FuncCall::new(2, 0, 99), 0);
        msg.set_inline_data(b"hello");
        msg.fill_send_timestamp();
        let frame = msg.encode();
        assert_eq!(frame.len(), MESSAGE_SIZE);

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.message_type(), MessageType::InvokeFunc);
        assert_eq!(decoded.func_call(), FuncCall::new(2, 0, 99));
        assert_eq!(decoded.inline_data(), b"hello");
        assert_eq!(decoded.send_timestamp, msg.send_timestamp);
    }

    #[test]
    fn test_shm_payload_sign_signal() {
        let mut msg = Message::new_func_call_complete(FuncCall::new(1, 0, 1), 250);
        msg.set_shm_payload(INLINE_MAX + 1);
        assert!(msg.payload_in_shm());
        assert_eq!(msg.payload_size, -(INLINE_MAX as i32 + 1));
        assert!(msg.inline_data().is_empty());

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert!(decoded.payload_in_shm());
        assert_eq!(decoded.payload_size, msg.payload_size);
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(Message::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_message_delay() {
        let mut msg = Message::new_invoke_func(FuncCall::new(1, 0, 1), 0);
        assert_eq!(compute_message_delay(&msg), -1);
        msg.fill_send_timestamp();
        assert!(compute_message_delay(&msg) >= 0);
    }

    #[test]
    #[should_panic(expected = "inline payload too large")]
    fn test_oversized_inline_panics() {
        let mut msg = Message::new_invoke_func(FuncCall::new(1, 0, 1), 0);
        msg.set_inline_data(&vec![0u8; INLINE_MAX + 1]);
    }
}
