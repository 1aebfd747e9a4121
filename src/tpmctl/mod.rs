// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Companion control-protocol client (spec.md 4.10, 6), grounded in
//! `tpm2d_control.c`: a length-prefixed framing over a unix stream socket to
//! whatever implements the TPM daemon side. This module speaks the wire
//! format only; key derivation and TPM operations stay external.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SOCKET_PATH: &str = "/data/misc/cml/tpm2d/control";

/// Selects the XTS key width, derived from key length (spec.md 4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdeKeyType {
    XtsAes128,
    XtsAes192,
    XtsAes256,
}

impl FdeKeyType {
    pub fn from_key_len(bytes: usize) -> Option<FdeKeyType> {
        match bytes {
            32 => Some(FdeKeyType::XtsAes128),
            48 => Some(FdeKeyType::XtsAes192),
            64 => Some(FdeKeyType::XtsAes256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    DmcryptSetup { key_hex: String, key_type: FdeKeyType },
    DmcryptLock,
    DmcryptReset,
    Exit,
    RandomRequest { len: u32 },
    Clear,
    ChangeOwnerPwd { old: String, new: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub message: String,
    #[serde(default)]
    pub random: Vec<u8>,
}

/// Process exit codes preserved bit-for-bit from the original CLI and
/// spec.md section 6.
pub mod exit_code {
    pub const USAGE: i32 = -1;
    pub const SOCKET_MISSING: i32 = -2;
    pub const CONNECT_FAILED: i32 = -3;
    pub const SEND_FAILED: i32 = -4;
    pub const RECV_FAILED: i32 = -5;
    pub const SUCCESS: i32 = 0;
}

pub struct Client {
    stream: UnixStream,
}

#[derive(Debug)]
pub enum ClientError {
    SocketMissing,
    ConnectFailed(std::io::Error),
    SendFailed(std::io::Error),
    RecvFailed(std::io::Error),
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::SocketMissing => exit_code::SOCKET_MISSING,
            ClientError::ConnectFailed(_) => exit_code::CONNECT_FAILED,
            ClientError::SendFailed(_) => exit_code::SEND_FAILED,
            ClientError::RecvFailed(_) => exit_code::RECV_FAILED,
        }
    }
}

impl Client {
    pub fn connect(socket_path: &str) -> Result<Client, ClientError> {
        if !std::path::Path::new(socket_path).exists() {
            return Err(ClientError::SocketMissing);
        }
        let stream = UnixStream::connect(socket_path).map_err(ClientError::ConnectFailed)?;
        stream.set_read_timeout(Some(Duration::from_secs(10))).ok();
        Ok(Client { stream })
    }

    pub fn send(&mut self, cmd: &Command) -> Result<Response, ClientError> {
        let body = serde_json::to_vec(cmd).expect("Command always serializes");
        let len = (body.len() as u32).to_le_bytes();
        self.stream.write_all(&len).map_err(ClientError::SendFailed)?;
        self.stream.write_all(&body).map_err(ClientError::SendFailed)?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).map_err(ClientError::RecvFailed)?;
        let resp_len = u32::from_le_bytes(len_buf) as usize;
        let mut resp_buf = vec![0u8; resp_len];
        self.stream.read_exact(&mut resp_buf).map_err(ClientError::RecvFailed)?;
        serde_json::from_slice(&resp_buf).map_err(|e| {
            ClientError::RecvFailed(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}
