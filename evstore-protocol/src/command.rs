//! TCP command bytes.

use crate::error::ProtocolError;
use std::fmt;

macro_rules! tcp_commands {
    ($($name:ident = $value:literal),+ $(,)?) => {
        /// The closed set of commands carried in the first header byte.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum TcpCommand {
            $($name = $value),+
        }

        impl TryFrom<u8> for TcpCommand {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(TcpCommand::$name),)+
                    other => Err(ProtocolError::UnknownCommand(other)),
                }
            }
        }

        impl fmt::Display for TcpCommand {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(TcpCommand::$name => f.write_str(stringify!($name)),)+
                }
            }
        }
    };
}

tcp_commands! {
    HeartbeatRequestCommand = 0x01,
    HeartbeatResponseCommand = 0x02,

    Ping = 0x03,
    Pong = 0x04,

    WriteEvents = 0x82,
    WriteEventsCompleted = 0x83,

    TransactionStart = 0x84,
    TransactionStartCompleted = 0x85,
    TransactionWrite = 0x86,
    TransactionWriteCompleted = 0x87,
    TransactionCommit = 0x88,
    TransactionCommitCompleted = 0x89,

    DeleteStream = 0x8A,
    DeleteStreamCompleted = 0x8B,

    ReadEvent = 0xB0,
    ReadEventCompleted = 0xB1,
    ReadStreamEventsForward = 0xB2,
    ReadStreamEventsForwardCompleted = 0xB3,
    ReadStreamEventsBackward = 0xB4,
    ReadStreamEventsBackwardCompleted = 0xB5,
    ReadAllEventsForward = 0xB6,
    ReadAllEventsForwardCompleted = 0xB7,
    ReadAllEventsBackward = 0xB8,
    ReadAllEventsBackwardCompleted = 0xB9,

    SubscribeToStream = 0xC0,
    SubscriptionConfirmation = 0xC1,
    StreamEventAppeared = 0xC2,
    UnsubscribeFromStream = 0xC3,
    SubscriptionDropped = 0xC4,
    ConnectToPersistentSubscription = 0xC5,
    PersistentSubscriptionConfirmation = 0xC6,
    PersistentSubscriptionStreamEventAppeared = 0xC7,
    CreatePersistentSubscription = 0xC8,
    CreatePersistentSubscriptionCompleted = 0xC9,
    DeletePersistentSubscription = 0xCA,
    DeletePersistentSubscriptionCompleted = 0xCB,
    PersistentSubscriptionAckEvents = 0xCC,
    PersistentSubscriptionNakEvents = 0xCD,
    UpdatePersistentSubscription = 0xCE,
    UpdatePersistentSubscriptionCompleted = 0xCF,

    BadRequest = 0xF0,
    NotHandled = 0xF1,
    Authenticate = 0xF2,
    Authenticated = 0xF3,
    NotAuthenticated = 0xF4,
}

impl TcpCommand {
    /// Returns the byte written on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the completion command a server answers this request with.
    ///
    /// Commands that are not requests (completions, pushes, errors) return `None`.
    pub fn completion(self) -> Option<TcpCommand> {
        use TcpCommand::*;
        let completion = match self {
            HeartbeatRequestCommand => HeartbeatResponseCommand,
            Ping => Pong,
            WriteEvents => WriteEventsCompleted,
            TransactionStart => TransactionStartCompleted,
            TransactionWrite => TransactionWriteCompleted,
            TransactionCommit => TransactionCommitCompleted,
            DeleteStream => DeleteStreamCompleted,
            ReadEvent => ReadEventCompleted,
            ReadStreamEventsForward => ReadStreamEventsForwardCompleted,
            ReadStreamEventsBackward => ReadStreamEventsBackwardCompleted,
            ReadAllEventsForward => ReadAllEventsForwardCompleted,
            ReadAllEventsBackward => ReadAllEventsBackwardCompleted,
            SubscribeToStream => SubscriptionConfirmation,
            ConnectToPersistentSubscription => PersistentSubscriptionConfirmation,
            CreatePersistentSubscription => CreatePersistentSubscriptionCompleted,
            DeletePersistentSubscription => DeletePersistentSubscriptionCompleted,
            UpdatePersistentSubscription => UpdatePersistentSubscriptionCompleted,
            Authenticate => Authenticated,
            _ => return None,
        };
        Some(completion)
    }

    /// Returns whether the server may send this command for any correlation id.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            TcpCommand::BadRequest | TcpCommand::NotHandled | TcpCommand::NotAuthenticated
        )
    }
}

impl From<TcpCommand> for u8 {
    fn from(command: TcpCommand) -> Self {
        command.as_byte()
    }
}
