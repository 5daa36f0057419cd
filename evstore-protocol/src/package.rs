//! TCP package format.
//!
//! Package layout (4 bytes prefix + 18 bytes header + optional auth block + payload):
//!
//! ```text
//! +-------------+---------+--------+------------------+
//! | length (LE) | command | flags  | correlation id   |
//! |   4 bytes   | 1 byte  | 1 byte |    16 bytes      |
//! +-------------+---------+--------+------------------+
//! | [u8 len | username | u8 len | password]  payload |
//! |  present iff flags & AUTHENTICATED                |
//! +---------------------------------------------------+
//! ```
//!
//! The correlation id is written in GUID byte order (first three groups
//! little-endian), matching what the server expects.

use crate::command::TcpCommand;
use crate::error::ProtocolError;
use crate::{LENGTH_PREFIX_SIZE, MAX_PACKAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Size of the fixed package header in bytes (1+1+16 = 18).
pub const PACKAGE_HEADER_SIZE: usize = 18;

/// Package flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(u8);

impl TcpFlags {
    /// Credentials block is present after the header.
    pub const AUTHENTICATED: u8 = 1 << 0;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_authenticated(mut self) -> Self {
        self.0 |= Self::AUTHENTICATED;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.0 & Self::AUTHENTICATED != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// Username/password pair sent in the auth block.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One protocol package.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpPackage {
    pub command: TcpCommand,
    pub flags: TcpFlags,
    pub correlation_id: Uuid,
    pub credentials: Option<UserCredentials>,
    pub data: Bytes,
}

impl TcpPackage {
    /// Creates a package without credentials.
    pub fn new(command: TcpCommand, correlation_id: Uuid, data: Bytes) -> Self {
        Self {
            command,
            flags: TcpFlags::new(),
            correlation_id,
            credentials: None,
            data,
        }
    }

    /// Creates a package, attaching credentials (and setting the flag) when given.
    pub fn with_credentials(
        command: TcpCommand,
        correlation_id: Uuid,
        credentials: Option<UserCredentials>,
        data: Bytes,
    ) -> Self {
        let flags = if credentials.is_some() {
            TcpFlags::new().with_authenticated()
        } else {
            TcpFlags::new()
        };
        Self {
            command,
            flags,
            correlation_id,
            credentials,
            data,
        }
    }

    /// Number of content bytes (everything after the length prefix).
    pub fn content_len(&self) -> usize {
        let auth_len = match (&self.credentials, self.flags.is_authenticated()) {
            (Some(creds), true) => 2 + creds.username.len() + creds.password.len(),
            _ => 0,
        };
        PACKAGE_HEADER_SIZE + auth_len + self.data.len()
    }

    /// Encodes the package, including its length prefix.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let content_len = self.content_len();
        if content_len > MAX_PACKAGE_SIZE {
            return Err(ProtocolError::PackageTooLarge {
                size: content_len,
                max: MAX_PACKAGE_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + content_len);

        // Length prefix (4 bytes, LE)
        buf.put_u32_le(content_len as u32);

        // Header (18 bytes)
        buf.put_u8(self.command.as_byte());
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.correlation_id.to_bytes_le());

        // Auth block
        if self.flags.is_authenticated() {
            let creds = self
                .credentials
                .as_ref()
                .ok_or(ProtocolError::TruncatedCredentials)?;
            put_short_string(&mut buf, "username", &creds.username)?;
            put_short_string(&mut buf, "password", &creds.password)?;
        }

        // Payload
        buf.put_slice(&self.data);

        Ok(buf)
    }

    /// Parses the content of one package (the bytes following the length prefix).
    pub fn from_content(mut content: Bytes) -> Result<Self, ProtocolError> {
        if content.len() < PACKAGE_HEADER_SIZE {
            return Err(ProtocolError::PackageTooShort {
                size: content.len(),
                min: PACKAGE_HEADER_SIZE,
            });
        }

        let command = TcpCommand::try_from(content.get_u8())?;
        let flags = TcpFlags::from_bits(content.get_u8());

        let mut id = [0u8; 16];
        content.copy_to_slice(&mut id);
        let correlation_id = Uuid::from_bytes_le(id);

        let credentials = if flags.is_authenticated() {
            let username = get_short_string(&mut content, "username")?;
            let password = get_short_string(&mut content, "password")?;
            Some(UserCredentials { username, password })
        } else {
            None
        };

        Ok(Self {
            command,
            flags,
            correlation_id,
            credentials,
            data: content,
        })
    }
}

fn put_short_string(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), ProtocolError> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(ProtocolError::CredentialTooLong { field, len });
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_short_string(content: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    if content.remaining() < 1 {
        return Err(ProtocolError::TruncatedCredentials);
    }
    let len = content.get_u8() as usize;
    if content.remaining() < len {
        return Err(ProtocolError::TruncatedCredentials);
    }
    let raw = content.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode(mut encoded: BytesMut) -> TcpPackage {
        let len = encoded.get_u32_le() as usize;
        assert_eq!(len, encoded.len());
        TcpPackage::from_content(encoded.freeze()).unwrap()
    }

    #[test]
    fn test_package_roundtrip_without_credentials() {
        let id = Uuid::new_v4();
        let package = TcpPackage::new(TcpCommand::Ping, id, Bytes::from_static(b"hello"));

        let encoded = package.encode().unwrap();
        assert_eq!(encoded.len(), 4 + 18 + 5);

        let decoded = decode(encoded);
        assert_eq!(decoded, package);
        assert!(decoded.credentials.is_none());
    }

    #[test]
    fn test_package_roundtrip_with_credentials() {
        let creds = UserCredentials::new("admin", "changeit");
        let package = TcpPackage::with_credentials(
            TcpCommand::WriteEvents,
            Uuid::new_v4(),
            Some(creds.clone()),
            Bytes::from_static(b"payload"),
        );
        assert!(package.flags.is_authenticated());

        let encoded = package.encode().unwrap();
        assert_eq!(encoded.len(), 4 + 18 + 1 + 5 + 1 + 8 + 7);

        let decoded = decode(encoded);
        assert_eq!(decoded.credentials, Some(creds));
        assert_eq!(decoded.data.as_ref(), b"payload");
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let package = TcpPackage::new(TcpCommand::Pong, Uuid::nil(), Bytes::new());
        let encoded = package.encode().unwrap();
        assert_eq!(&encoded[..4], &[18, 0, 0, 0]);
        assert_eq!(encoded[4], 0x04);
        assert_eq!(encoded[5], 0x00);
    }

    #[test]
    fn test_correlation_id_guid_byte_order() {
        let id = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let package = TcpPackage::new(TcpCommand::Ping, id, Bytes::new());
        let encoded = package.encode().unwrap();
        assert_eq!(
            &encoded[6..22],
            &[
                0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
                0xdd, 0xee, 0xff
            ]
        );
    }

    #[test]
    fn test_credentials_too_long() {
        let creds = UserCredentials::new("u".repeat(256), "p");
        let package = TcpPackage::with_credentials(
            TcpCommand::Authenticate,
            Uuid::new_v4(),
            Some(creds),
            Bytes::new(),
        );
        assert!(matches!(
            package.encode(),
            Err(ProtocolError::CredentialTooLong {
                field: "username",
                len: 256
            })
        ));
    }

    #[test]
    fn test_truncated_credentials() {
        let mut content = BytesMut::new();
        content.put_u8(TcpCommand::Ping.as_byte());
        content.put_u8(TcpFlags::AUTHENTICATED);
        content.put_slice(&[0u8; 16]);
        content.put_u8(10);
        content.put_slice(b"abc");

        let result = TcpPackage::from_content(content.freeze());
        assert!(matches!(result, Err(ProtocolError::TruncatedCredentials)));
    }

    #[test]
    fn test_content_too_short() {
        let result = TcpPackage::from_content(Bytes::from_static(&[0x01, 0x00, 0x00]));
        assert!(matches!(
            result,
            Err(ProtocolError::PackageTooShort { size: 3, .. })
        ));
    }

    #[test]
    fn test_unknown_command_in_content() {
        let mut content = BytesMut::new();
        content.put_u8(0x7f);
        content.put_u8(0);
        content.put_slice(&[0u8; 16]);
        let result = TcpPackage::from_content(content.freeze());
        assert!(matches!(result, Err(ProtocolError::UnknownCommand(0x7f))));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = UserCredentials::new("admin", "secret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("secret"));
    }

    proptest! {
        #[test]
        fn prop_package_roundtrip(
            command in prop::sample::select(vec![
                TcpCommand::WriteEvents,
                TcpCommand::ReadEvent,
                TcpCommand::SubscribeToStream,
                TcpCommand::StreamEventAppeared,
                TcpCommand::HeartbeatRequestCommand,
            ]),
            id in any::<u128>(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
            creds in prop::option::of(("[a-z]{0,32}", "[ -~]{0,32}")),
        ) {
            let package = TcpPackage::with_credentials(
                command,
                Uuid::from_u128(id),
                creds.map(|(u, p)| UserCredentials::new(u, p)),
                Bytes::from(payload),
            );
            let decoded = decode(package.encode().unwrap());
            prop_assert_eq!(decoded, package);
        }
    }
}
