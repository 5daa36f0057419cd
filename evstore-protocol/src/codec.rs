//! Streaming decoder for length-prefixed packages.

use crate::error::ProtocolError;
use crate::package::{TcpPackage, PACKAGE_HEADER_SIZE};
use crate::{LENGTH_PREFIX_SIZE, MAX_PACKAGE_SIZE};
use bytes::{Buf, Bytes, BytesMut};

/// Reassembles packages from arbitrarily segmented socket reads.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Splits the next complete package content off the buffer.
    ///
    /// Returns `Ok(None)` while the length prefix or the content is incomplete.
    pub fn decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_PACKAGE_SIZE {
            return Err(ProtocolError::PackageTooLarge {
                size: len,
                max: MAX_PACKAGE_SIZE,
            });
        }
        if len < PACKAGE_HEADER_SIZE {
            return Err(ProtocolError::PackageTooShort {
                size: len,
                min: PACKAGE_HEADER_SIZE,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Attempts to decode the next package from the buffer.
    pub fn decode_package(&mut self) -> Result<Option<TcpPackage>, ProtocolError> {
        match self.decode_frame()? {
            Some(content) => Ok(Some(TcpPackage::from_content(content)?)),
            None => Ok(None),
        }
    }

    /// Decodes every complete package currently buffered, keeping any partial tail.
    pub fn decode_all(&mut self) -> Result<Vec<TcpPackage>, ProtocolError> {
        let mut packages = Vec::new();
        while let Some(package) = self.decode_package()? {
            packages.push(package);
        }
        Ok(packages)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
