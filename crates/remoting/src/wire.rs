//! Wire mirror of the value and expression types.
//!
//! The wire restricts messages to a tagged union without local
//! handles: senders travel as tagged address paths, closures as
//! (module, name) references. Frames are postcard payloads behind the
//! transport's 4-byte big-endian length prefix.

use monad::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sender was received from the peer it is being sent back to; the
/// address carries the unrouted tail.
pub const TAG_UNROUTE: u8 = 2;
/// Sender carries its full address; the peer routes it through its
/// mailbox.
pub const TAG_ROUTE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSender {
    pub tag: u8,
    pub addr: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Addr(Vec<u64>),
    Sender(WireSender),
    Expr(Box<WireExpr>),
    Closure { module: String, name: String },
    Error(Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireExpr {
    Const(WireValue),
    Arg(String),
    Env,
    Call {
        func: Box<WireExpr>,
        args: Vec<WireExpr>,
        kwargs: BTreeMap<String, WireExpr>,
    },
    GetAttr {
        target: Box<WireExpr>,
        name: String,
    },
    GetItem {
        target: Box<WireExpr>,
        item: Box<WireExpr>,
    },
    If {
        cond: Box<WireExpr>,
        then: Box<WireExpr>,
        otherwise: Box<WireExpr>,
    },
    Bind(Box<WireExpr>),
}

/// One transport frame: the message, its destination path, and the
/// optional reply-to sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub msg: WireValue,
    pub dst: Vec<u64>,
    pub src: Option<WireSender>,
}

/// Context for moving values between their in-memory and wire forms.
/// Connections rewrite senders and translate closure module names; the
/// plain codec supports neither and is used for transport-free data
/// such as shipped lambda bodies.
pub(crate) trait WireCodec {
    fn freeze_sender(&self, sender: &crate::hub::Sender) -> Result<WireSender>;
    fn thaw_sender(&self, wire: &WireSender) -> Result<crate::hub::Sender>;
    fn thaw_closure(&self, module: &str, name: &str) -> Result<crate::registry::Closure>;
}

pub(crate) struct PlainCodec;

impl WireCodec for PlainCodec {
    fn freeze_sender(&self, _sender: &crate::hub::Sender) -> Result<WireSender> {
        Err(Error::value(
            "a sender cannot be serialized outside a connection",
        ))
    }

    fn thaw_sender(&self, _wire: &WireSender) -> Result<crate::hub::Sender> {
        Err(Error::value(
            "a sender cannot be deserialized outside a connection",
        ))
    }

    fn thaw_closure(&self, module: &str, name: &str) -> Result<crate::registry::Closure> {
        Ok(crate::registry::Closure::new(module, name))
    }
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    postcard::to_stdvec(frame).map_err(|err| Error::value(format!("frame encoding failed: {err}")))
}

pub fn decode(data: &[u8]) -> Result<Frame> {
    postcard::from_bytes(data).map_err(|err| Error::value(format!("frame decoding failed: {err}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame {
            msg: WireValue::Expr(Box::new(WireExpr::Call {
                func: Box::new(WireExpr::Const(WireValue::Closure {
                    module: "builtins".into(),
                    name: "identity".into(),
                })),
                args: vec![WireExpr::Const(WireValue::Bytes(b"0123456789".to_vec()))],
                kwargs: BTreeMap::new(),
            })),
            dst: vec![3, 7],
            src: Some(WireSender {
                tag: TAG_ROUTE,
                addr: vec![4],
            }),
        };
        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
