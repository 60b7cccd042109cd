use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

/// Wire size of the length prefix on every inbound frame.
pub const HEADER_LENGTH: usize = 2;
/// Wire size of the optional Adler-32 prefix on a first frame.
pub const CHECKSUM_LENGTH: usize = 4;
/// Largest body a frame may announce.
pub const MAX_BODY_LENGTH: usize = 4096;

/// Space reserved in front of an outbound body for headers stamped by the
/// protocol handler (length prefix, checksum, sequence).
pub const OUTPUT_HEADER_SPACE: usize = 8;

/// One inbound frame body with a read cursor.
///
/// The two-byte length header lives in the connection's inbound buffer; by
/// the time a frame reaches a protocol handler only the body remains, with
/// the cursor past whatever prefix (checksum, protocol identifier) the
/// connection consumed.
#[derive(Debug, Default)]
pub struct InputMessage {
    body: Vec<u8>,
    position: usize,
}

impl InputMessage {
    #[inline]
    pub fn new() -> InputMessage {
        InputMessage {
            body: Vec::with_capacity(MAX_BODY_LENGTH),
            position: 0,
        }
    }

    /// Reloads the message with a fresh frame body and rewinds the cursor.
    #[inline]
    pub fn reset_from(&mut self, frame: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(frame);
        self.position = 0;
    }

    /// Total body length.
    #[inline]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Bytes left between the cursor and the end of the body.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.body.len() - self.position
    }

    /// Current cursor offset from the start of the body.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// The unread tail of the body.
    #[inline]
    pub fn remaining_slice(&self) -> &[u8] {
        &self.body[self.position..]
    }

    #[inline]
    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        let value = self.cursor()?.read_u8()?;
        self.position += 1;
        Ok(value)
    }

    #[inline]
    pub fn get_u16(&mut self) -> NetworkResult<u16> {
        let value = self.cursor()?.read_u16::<LittleEndian>()?;
        self.position += 2;
        Ok(value)
    }

    #[inline]
    pub fn get_u32(&mut self) -> NetworkResult<u32> {
        let value = self.cursor()?.read_u32::<LittleEndian>()?;
        self.position += 4;
        Ok(value)
    }

    /// Moves the cursor by `count` bytes; negative values step back over
    /// already-consumed bytes (the checksum-less dialect rewind).
    #[inline]
    pub fn skip_bytes(&mut self, count: isize) -> NetworkResult<()> {
        let target = self.position as isize + count;
        if target < 0 || target as usize > self.body.len() {
            return Err(NetworkError::Fatal(ErrorType::Truncated));
        }
        self.position = target as usize;
        Ok(())
    }

    #[inline]
    fn cursor(&self) -> NetworkResult<&[u8]> {
        if self.position > self.body.len() {
            return Err(NetworkError::Fatal(ErrorType::Truncated));
        }
        Ok(&self.body[self.position..])
    }
}

/// One outbound message. The body is appended behind a reserved header
/// region; protocol handlers stamp length or integrity prefixes backwards
/// into that region from their `on_send_message` hook.
#[derive(Debug)]
pub struct OutputMessage {
    buffer: Vec<u8>,
    header_start: usize,
}

impl Default for OutputMessage {
    fn default() -> OutputMessage {
        OutputMessage::new()
    }
}

impl OutputMessage {
    #[inline]
    pub fn new() -> OutputMessage {
        OutputMessage {
            buffer: vec![0; OUTPUT_HEADER_SPACE],
            header_start: OUTPUT_HEADER_SPACE,
        }
    }

    /// Body length, excluding any stamped headers.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.buffer.len() - OUTPUT_HEADER_SPACE
    }

    /// Total wire length, stamped headers included.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len() - self.header_start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn add_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    #[inline]
    pub fn add_u16(&mut self, value: u16) {
        let mut raw = [0u8; 2];
        LittleEndian::write_u16(&mut raw, value);
        self.buffer.extend_from_slice(&raw);
    }

    #[inline]
    pub fn add_u32(&mut self, value: u32) {
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, value);
        self.buffer.extend_from_slice(&raw);
    }

    #[inline]
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Stamps a little-endian u16 immediately in front of the current output.
    #[inline]
    pub fn prepend_u16(&mut self, value: u16) {
        assert!(self.header_start >= 2, "Output header space exhausted");
        self.header_start -= 2;
        LittleEndian::write_u16(&mut self.buffer[self.header_start..self.header_start + 2], value);
    }

    /// Stamps a little-endian u32 immediately in front of the current output.
    #[inline]
    pub fn prepend_u32(&mut self, value: u32) {
        assert!(self.header_start >= 4, "Output header space exhausted");
        self.header_start -= 4;
        LittleEndian::write_u32(&mut self.buffer[self.header_start..self.header_start + 4], value);
    }

    /// The wire bytes: stamped headers followed by the body.
    #[inline]
    pub fn output(&self) -> &[u8] {
        &self.buffer[self.header_start..]
    }

    /// The body written so far, without stamped headers.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buffer[OUTPUT_HEADER_SPACE..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_cursor_little_endian() {
        let mut msg = InputMessage::new();
        msg.reset_from(&[0x05, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x7F]);

        assert_eq!(msg.get_u16().unwrap(), 5);
        assert_eq!(msg.get_u32().unwrap(), 0xDDCC_BBAA);
        assert_eq!(msg.get_u8().unwrap(), 0x7F);
        assert_eq!(msg.remaining(), 0);
    }

    #[test]
    fn test_input_truncated_read() {
        let mut msg = InputMessage::new();
        msg.reset_from(&[0x01]);

        assert!(msg.get_u32().is_err());
    }

    #[test]
    fn test_skip_bytes_rewind() {
        let mut msg = InputMessage::new();
        msg.reset_from(&[0x01, 0x02, 0x03, 0x04, 0x09]);

        let checksum = msg.get_u32().unwrap();
        assert_eq!(checksum, 0x0403_0201);

        // The checksum-less dialect path steps back over the four bytes.
        msg.skip_bytes(-(CHECKSUM_LENGTH as isize)).unwrap();
        assert_eq!(msg.position(), 0);
        assert_eq!(msg.get_u8().unwrap(), 0x01);
    }

    #[test]
    fn test_skip_bytes_bounds() {
        let mut msg = InputMessage::new();
        msg.reset_from(&[0x01, 0x02]);

        assert!(msg.skip_bytes(-1).is_err());
        assert!(msg.skip_bytes(3).is_err());
        msg.skip_bytes(2).unwrap();
        assert_eq!(msg.remaining(), 0);
    }

    #[test]
    fn test_reset_rewinds() {
        let mut msg = InputMessage::new();
        msg.reset_from(&[0x01, 0x02, 0x03]);
        msg.get_u8().unwrap();

        msg.reset_from(&[0x09]);
        assert_eq!(msg.position(), 0);
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn test_output_prepend_order() {
        let mut msg = OutputMessage::new();
        msg.add_bytes(b"abc");

        msg.prepend_u32(0xDEAD_BEEF);
        msg.prepend_u16(7);

        // The last prepend ends up first on the wire.
        assert_eq!(msg.len(), 9);
        assert_eq!(&msg.output()[..2], &[0x07, 0x00]);
        assert_eq!(&msg.output()[2..6], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&msg.output()[6..], b"abc");
        assert_eq!(msg.body(), b"abc");
    }

    #[test]
    fn test_output_body_only() {
        let mut msg = OutputMessage::new();
        msg.add_u8(1);
        msg.add_u16(0x0203);

        assert_eq!(msg.body_len(), 3);
        assert_eq!(msg.output(), &[1, 0x03, 0x02]);
    }

    #[test]
    #[should_panic(expected = "Output header space exhausted")]
    fn test_output_header_space_limit() {
        let mut msg = OutputMessage::new();
        msg.prepend_u32(0);
        msg.prepend_u32(0);
        msg.prepend_u16(0);
    }
}
