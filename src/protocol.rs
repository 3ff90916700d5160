//! Tunnel Wire Protocol
//!
//! Every datagram is a one-byte code followed by a sealed body:
//!
//! ```text
//! [1: code] [N: nonce || ciphertext || tag]
//! ```
//!
//! Control bodies are JSON objects; the data body is the raw IP packet.
//! The body shape is implied by the code, it is not self-describing.

use serde::{Deserialize, Serialize};

use crate::crypto::Cipher;
use crate::error::{Error, Result};

/// Wire type tag carried in the first byte of every datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    /// Client authentication request (JSON)
    ClientAuthRequest = 0x01,
    /// Server authentication response (JSON)
    ServerAuthResponse = 0x02,
    /// Encrypted IP packet (raw bytes)
    Data = 0x03,
}

impl PacketCode {
    /// Read the code from the first byte of a datagram
    pub fn from_datagram(datagram: &[u8]) -> Result<Self> {
        match datagram.first() {
            None => Err(Error::NotEnoughData),
            Some(&byte) => Self::try_from(byte),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Get the code name (for logging)
    pub fn type_name(self) -> &'static str {
        match self {
            PacketCode::ClientAuthRequest => "ClientAuthRequest",
            PacketCode::ServerAuthResponse => "ServerAuthResponse",
            PacketCode::Data => "Data",
        }
    }
}

impl TryFrom<u8> for PacketCode {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(PacketCode::ClientAuthRequest),
            0x02 => Ok(PacketCode::ServerAuthResponse),
            0x03 => Ok(PacketCode::Data),
            other => Err(Error::InvalidCode(other)),
        }
    }
}

/// A datagram body with a fixed wire code
pub trait Body: Sized {
    const CODE: PacketCode;

    /// Serialize to the plaintext that gets sealed
    fn to_plaintext(&self) -> Result<Vec<u8>>;

    /// Deserialize from an opened plaintext
    fn from_plaintext(plaintext: Vec<u8>) -> Result<Self>;
}

/// Credentials sent by the client right after the socket becomes ready
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuthRequest {
    pub login: String,
    pub password: String,
}

impl std::fmt::Debug for ClientAuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuthRequest")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Server verdict on a `ClientAuthRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAuthResponse {
    #[serde(rename = "isOK")]
    pub is_ok: bool,
    /// Tunnel remote address to report once authenticated
    #[serde(default)]
    pub address: String,
}

/// One tunneled IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub payload: Vec<u8>,
}

impl Body for ClientAuthRequest {
    const CODE: PacketCode = PacketCode::ClientAuthRequest;

    fn to_plaintext(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn from_plaintext(plaintext: Vec<u8>) -> Result<Self> {
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl Body for ServerAuthResponse {
    const CODE: PacketCode = PacketCode::ServerAuthResponse;

    fn to_plaintext(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn from_plaintext(plaintext: Vec<u8>) -> Result<Self> {
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl Body for Data {
    const CODE: PacketCode = PacketCode::Data;

    fn to_plaintext(&self) -> Result<Vec<u8>> {
        Ok(self.payload.clone())
    }

    fn from_plaintext(plaintext: Vec<u8>) -> Result<Self> {
        Ok(Data { payload: plaintext })
    }
}

/// Seal `body` and prepend its code
pub fn encode<B: Body>(body: &B, cipher: &Cipher) -> Result<Vec<u8>> {
    let plaintext = body.to_plaintext()?;
    let sealed = cipher.encrypt(&plaintext)?;

    let mut datagram = Vec::with_capacity(1 + sealed.len());
    datagram.push(B::CODE.as_byte());
    datagram.extend_from_slice(&sealed);
    Ok(datagram)
}

/// Encode a raw IP packet as a `Data` datagram without copying it first
pub fn encode_data(payload: &[u8], cipher: &Cipher) -> Result<Vec<u8>> {
    let sealed = cipher.encrypt(payload)?;
    let mut datagram = Vec::with_capacity(1 + sealed.len());
    datagram.push(PacketCode::Data.as_byte());
    datagram.extend_from_slice(&sealed);
    Ok(datagram)
}

/// Open a datagram as body type `B`
///
/// The code byte must match `B::CODE`; the rest is opened with `cipher`
/// and deserialized.
pub fn decode<B: Body>(datagram: &[u8], cipher: &Cipher) -> Result<B> {
    let code = PacketCode::from_datagram(datagram)?;
    if code != B::CODE {
        return Err(Error::InvalidCode(code.as_byte()));
    }
    let plaintext = cipher.decrypt(&datagram[1..])?;
    B::from_plaintext(plaintext)
}
