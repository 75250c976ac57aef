//! Shared fixtures for DNS tests

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use std::net::SocketAddr;

use crate::dns::{ResponseWriter, Transport};
use crate::error::{Result, ServerError};

/// Build a standard query with the given questions
pub(crate) fn query_message(id: u16, questions: &[(&str, RecordType)]) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query);
    for (name, record_type) in questions {
        let name = Name::from_ascii(name).unwrap();
        message.add_query(Query::query(name, *record_type));
    }
    message
}

/// Writer that keeps every message it was asked to send
#[derive(Default)]
pub(crate) struct RecordingWriter {
    pub sent: Vec<Message>,
    pub attempts: usize,
    fail: bool,
}

impl RecordingWriter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ResponseWriter for RecordingWriter {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        self.attempts += 1;
        if self.fail {
            return Err(ServerError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        self.sent.push(msg.clone());
        Ok(())
    }
}
