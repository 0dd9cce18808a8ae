//! TCP socket framing to the UE simulator and response canonicalization.
//!
//! Grounded on `core_fuzzer.py`'s `connectUE`/`connectUE2`/`connectUE3`,
//! `sendSymbol`, `sendFuzzingMessage`, and `canonical_ret`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::sut;

/// UE control-plane sockets connect with a 5s timeout; the gNB one (not
/// opened here, see `sut.rs`) uses 1s.
const UE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_ATTEMPTS: u32 = 3;
const RECV_RETRY_SLEEP: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize, Default, Clone)]
pub struct UeResponse {
    #[serde(default)]
    pub ret_type: String,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub new_msg: String,
    #[serde(default)]
    pub sht: i64,
    #[serde(default)]
    pub secmod: i64,
    #[serde(default)]
    pub mm_status: String,
    #[serde(default)]
    pub byte_mut: bool,
}

/// A connection to one of the UE simulator's 3 control ports
/// (`port_base`, `port_base+1`, `port_base+2`).
pub struct UeLink {
    stream: TcpStream,
    peer: String,
}

impl UeLink {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let addr = peer
            .parse()
            .map_err(|_| Error::Protocol(format!("bad address {peer}")))?;
        let stream = TcpStream::connect_timeout(&addr, UE_CONNECT_TIMEOUT)
            .map_err(|e| Error::socket(peer.clone(), e))?;
        stream
            .set_read_timeout(Some(UE_CONNECT_TIMEOUT))
            .map_err(|e| Error::socket(peer.clone(), e))?;
        stream
            .set_write_timeout(Some(UE_CONNECT_TIMEOUT))
            .map_err(|e| Error::socket(peer.clone(), e))?;
        Ok(UeLink { stream, peer })
    }

    /// Sends `symbol` (and, for the `name:payload` fuzz-symbol form, its
    /// raw payload) and reads back one response, retrying up to
    /// [`RECV_ATTEMPTS`] times on a timed-out/empty read.
    ///
    /// `serviceRequest` is special-cased: UERANSIM needs an RRC release
    /// issued first or the request never reaches RRC-IDLE framing.
    pub fn send_symbol(&mut self, symbol: &str) -> Result<UeResponse> {
        if symbol.contains("serviceRequest") {
            sut::send_rrc_release()?;
        }

        if let Some((name, payload)) = symbol.split_once(':') {
            self.write_frame(b"testMessage")?;
            self.write_frame(payload.as_bytes())?;
            log::debug!("sent fuzz symbol {name} with {} byte payload", payload.len());
        } else {
            self.write_frame(symbol.as_bytes())?;
        }

        self.recv_with_retry()
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.stream
            .write_all(payload)
            .map_err(|e| Error::socket(self.peer.clone(), e))
    }

    fn recv_with_retry(&mut self) -> Result<UeResponse> {
        let mut last_err = None;
        for attempt in 0..RECV_ATTEMPTS {
            match self.recv_one() {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt + 1 < RECV_ATTEMPTS => {
                    last_err = Some(e);
                    std::thread::sleep(RECV_RETRY_SLEEP);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Protocol("exhausted receive attempts".into())))
    }

    /// Sends a raw mutated payload with no symbol framing and reads back
    /// one response, left uncanonicalized: `sendFuzzingMessage` in
    /// `core_fuzzer.py` feeds its result straight to `json.loads` rather
    /// than through `canonical_ret`.
    pub fn send_raw(&mut self, payload: &[u8]) -> Result<FuzzReply> {
        self.write_frame(payload)?;
        let mut buf = vec![0u8; 8192];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| Error::socket(self.peer.clone(), e))?;
        if n == 0 {
            return Ok(FuzzReply::Crashed);
        }
        let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        if text.is_empty() {
            return Ok(FuzzReply::Crashed);
        }
        if text.eq_ignore_ascii_case("decode error") {
            return Ok(FuzzReply::DecodeError);
        }
        match serde_json::from_str::<UeResponse>(&text) {
            Ok(resp) => Ok(FuzzReply::Response(resp)),
            Err(_) => Ok(FuzzReply::DecodeError),
        }
    }

    fn recv_one(&mut self) -> Result<UeResponse> {
        let mut buf = vec![0u8; 8192];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| Error::socket(self.peer.clone(), e))?;
        if n == 0 {
            return Err(Error::Protocol("empty response".into()));
        }
        Ok(canonical_ret(&buf[..n]))
    }
}

/// Result of [`UeLink::send_raw`]: a successfully parsed JSON response, or
/// one of the two disqualifying outcomes `sendFuzzingMessage`'s caller
/// distinguishes (empty read vs. an explicit `decode error` string).
#[derive(Debug, Clone)]
pub enum FuzzReply {
    Crashed,
    DecodeError,
    Response(UeResponse),
}

fn null_action() -> UeResponse {
    UeResponse {
        ret_type: "null_action".to_string(),
        ..Default::default()
    }
}

/// Canonicalizes a raw wire response, per spec.md §6 and
/// `core_fuzzer.py`'s `canonical_ret`: empty, `unknown fuzzing message
/// name`, `decode error`, `error`, `timeout`, or `null_action` itself all
/// collapse to `"null_action"`; a JSON object yields its `ret_type` (or
/// `ret_msg` if that's empty), defaulting to `"null_action"` if both are
/// empty or the object fails to parse; any other string passes through
/// verbatim. Idempotent: feeding `canonical(x).ret_type` back through
/// behaves the same as `canonical(x)` since every one of those literal
/// strings is already in its own fixed point.
pub fn canonical_ret(raw: &[u8]) -> UeResponse {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return null_action();
    }
    let low = trimmed.to_ascii_lowercase();
    if low.contains("unknown fuzzing message name")
        || matches!(low.as_str(), "null_action" | "decode error" | "error" | "timeout")
    {
        return null_action();
    }

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return match serde_json::from_str::<UeResponse>(trimmed) {
            Ok(mut resp) => {
                if resp.ret_type.is_empty() {
                    resp.ret_type = if resp.ret_msg.is_empty() {
                        "null_action".to_string()
                    } else {
                        resp.ret_msg.clone()
                    };
                }
                resp
            }
            Err(_) => null_action(),
        };
    }

    UeResponse {
        ret_type: trimmed.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_is_null_action() {
        let resp = canonical_ret(b"");
        assert_eq!(resp.ret_type, "null_action");
    }

    #[test]
    fn bare_error_literal_is_null_action() {
        let resp = canonical_ret(b"error");
        assert_eq!(resp.ret_type, "null_action");
    }

    #[test]
    fn unknown_fuzzing_message_name_is_null_action() {
        let resp = canonical_ret(b"unknown fuzzing message name: foo");
        assert_eq!(resp.ret_type, "null_action");
    }

    #[test]
    fn bare_symbol_passes_through() {
        let resp = canonical_ret(b"authenticationRequest");
        assert_eq!(resp.ret_type, "authenticationRequest");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in [&b""[..], b"error", b"timeout", b"authenticationRequest", br#"{"ret_type":"regAccept"}"#] {
            let once = canonical_ret(raw).ret_type;
            let twice = canonical_ret(once.as_bytes()).ret_type;
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn valid_json_object_is_parsed() {
        let resp = canonical_ret(br#"{"ret_type":"regAccept","sht":1}"#);
        assert_eq!(resp.ret_type, "regAccept");
        assert_eq!(resp.sht, 1);
    }

    #[test]
    fn malformed_json_object_falls_back_to_null_action() {
        let resp = canonical_ret(b"{not json at all}");
        assert_eq!(resp.ret_type, "null_action");
    }
}
