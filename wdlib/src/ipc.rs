//! The IPC message: a `(key, payload)` pair marshalled big-endian for the
//! length-framed transport between the parent, frontend and engine
//! processes. The payload is always NUL-terminated on the wire, mirroring
//! the original `ipcmsg_new`/`ipcmsg_marshal` contract.

use crate::error::{Error, Result};

pub const IPC_HEADER_LEN: usize = 4 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub key: u32,
    pub payload: String,
}

impl IpcMessage {
    pub fn new(key: u32, payload: impl Into<String>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut body = self.payload.as_bytes().to_vec();
        body.push(0);

        let msglen = u16::try_from(body.len()).map_err(|_| Error::Overflow)?;

        let mut out = Vec::with_capacity(IPC_HEADER_LEN + body.len());
        out.extend_from_slice(&self.key.to_be_bytes());
        out.extend_from_slice(&msglen.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IPC_HEADER_LEN {
            return Err(Error::Truncated);
        }

        let key = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let msglen = u16::from_be_bytes(bytes[4..6].try_into().unwrap()) as usize;

        if bytes.len() < IPC_HEADER_LEN + msglen {
            return Err(Error::Truncated);
        }

        let body = &bytes[IPC_HEADER_LEN..IPC_HEADER_LEN + msglen];
        if body.last() != Some(&0) {
            return Err(Error::NotNulTerminated);
        }

        let payload = String::from_utf8(body[..body.len() - 1].to_vec())?;
        Ok(Self { key, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_round_trips() {
        let m = IpcMessage::new(42, "hello");
        let bytes = m.marshal().unwrap();
        let back = IpcMessage::unmarshal(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn empty_payload_round_trips() {
        let m = IpcMessage::new(0, "");
        let bytes = m.marshal().unwrap();
        assert_eq!(bytes.len(), IPC_HEADER_LEN + 1);
        let back = IpcMessage::unmarshal(&bytes).unwrap();
        assert_eq!(back.payload, "");
    }

    #[test]
    fn truncated_buffer_errors() {
        let m = IpcMessage::new(1, "x");
        let bytes = m.marshal().unwrap();
        assert!(matches!(
            IpcMessage::unmarshal(&bytes[..bytes.len() - 1]),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn missing_nul_terminator_errors() {
        let mut bytes = IpcMessage::new(1, "x").marshal().unwrap();
        *bytes.last_mut().unwrap() = b'y';
        assert!(matches!(
            IpcMessage::unmarshal(&bytes),
            Err(Error::NotNulTerminated)
        ));
    }
}
