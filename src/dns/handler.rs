//! DNS Request Handler
//!
//! Logs every question it sees and answers with SERVER FAILURE.

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType, ResponseCode};
use tracing::{info, warn};

use crate::dns::{Handler, ResponseWriter};

/// Handler that refuses to resolve anything
#[derive(Debug, Default, Clone, Copy)]
pub struct ServFailHandler;

#[async_trait]
impl Handler for ServFailHandler {
    async fn serve_dns(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        for query in request.queries() {
            info!(
                name = %query.name(),
                "type" = %query.query_type(),
                transport = %writer.transport(),
                peer = %writer.remote_addr(),
                "Received DNS query"
            );
        }

        let response = servfail_reply(request);
        if let Err(e) = writer.write_msg(&response).await {
            warn!(error = %e, peer = %writer.remote_addr(), "Failed to write DNS response");
        }
    }
}

/// Build the SERVFAIL reply for a request.
///
/// Mirrors id, opcode, RD/CD and the whole question section so the client
/// can correlate it.
pub fn servfail_reply(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_checking_disabled(request.checking_disabled())
        .set_response_code(ResponseCode::ServFail);
    response.add_queries(request.queries().iter().cloned());
    response
}

/// SERVFAIL for a request whose body could not be decoded; only the header
/// is trusted.
pub(crate) fn malformed_reply(header: &Header) -> Message {
    let mut response = Message::new();
    response
        .set_id(header.id())
        .set_message_type(MessageType::Response)
        .set_op_code(header.op_code())
        .set_recursion_desired(header.recursion_desired())
        .set_response_code(ResponseCode::ServFail);
    response
}
